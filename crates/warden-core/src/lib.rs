//! # warden-core
//!
//! Core library for warden — a zero-trust execution runtime that mediates
//! between user requests, an untrusted reasoning core, and side-effectful
//! tools.
//!
//! The crate implements the trust boundary and its state machine:
//!
//! - **Canonicalization**: deterministic serialization of tool arguments,
//!   the sole basis of the integrity hash
//! - **Approval tokens**: HMAC-SHA256 signed, payload-bound, single-use
//! - **DLP**: PII redaction on ingress, secret detection on egress
//! - **Risk engine**: honeytoken traps, sandbox checks, tiered decisions
//! - **Audit log**: append-only JSONL record of every security decision
//! - **Eviction**: content-addressed overflow store for oversized outputs
//! - **State**: snapshot/restore of the execution graph, keyed by thread
//! - **Graph runtime**: the node state machine from Router to Finalizer
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use warden_core::clock::SystemClock;
//! use warden_core::config::RuntimeConfig;
//! use warden_core::graph::GraphRuntime;
//! use warden_core::oracle::{ScriptedExecutor, ScriptedInvoker, ScriptedPlanner};
//! use warden_core::state::{GraphState, Intent, MemoryStateStore};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(RuntimeConfig::for_dev());
//! let clock = Arc::new(SystemClock);
//! let runtime = GraphRuntime::builder(config, clock)
//!     .planner(Arc::new(ScriptedPlanner::new(["read README.md"])))
//!     .executor(Arc::new(ScriptedExecutor::default()))
//!     .invoker(Arc::new(ScriptedInvoker::default()))
//!     .build()?;
//!
//! let store = MemoryStateStore::new();
//! let mut state = GraphState::new("thread-1", "user-1", Intent::Task);
//! state.push_user_message("Read README.md");
//! let outcome = runtime.run_turn(&mut state, &store)?;
//! println!("awaiting approval: {}", outcome.awaiting_approval);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod audit;
pub mod canonical;
pub mod clock;
pub mod config;
pub mod dlp;
pub mod eviction;
pub mod graph;
pub mod oracle;
pub mod risk;
pub mod state;
pub mod token;

/// Re-export commonly used types at the crate root.
pub use audit::{AuditEntry, AuditLog};
pub use canonical::{IntegrityError, canonicalize, sha256_hex};
pub use config::RuntimeConfig;
pub use graph::{GraphRuntime, TurnOutcome};
pub use risk::{RiskDecision, RiskEngine, RiskLevel};
pub use state::{GraphState, Intent, StateStore};
pub use token::TokenManager;
