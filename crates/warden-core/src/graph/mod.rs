//! The execution graph: a zero-trust state machine over [`GraphState`].
//!
//! Nodes are dispatched flatly over the [`NodeId`] enumeration; there are no
//! structural references between nodes. Every node application persists the
//! updated state, so a turn can stop at any suspension point (notably the
//! human-approval pause) and resume in another process.
//!
//! ```text
//! Router ──> Planner ──> Supervisor ──> Executor ──> RiskGate ──┬─> Tools ──> Interpreter ─┐
//!    │                        ^                                 │                          │
//!    │                        └──────────────────────────────────────────────────<─────────┘
//!    │                                                          ├─> AwaitApproval ──> END
//!    │                                                          └─> Interpreter (blocked)
//!    ├──> ApprovalHandler ──> Tools | Supervisor
//!    └──> Finalizer ──> END
//! ```
//!
//! # Trust boundary
//!
//! The executor's proposal is untrusted even though the runtime computed its
//! integrity fields: the risk gate independently recomputes the canonical
//! form and hash and refuses on any divergence. Nothing reaches the tool
//! substrate except through the gate.

mod runtime;

pub use runtime::{GraphRuntime, GraphRuntimeBuilder, is_approval_command};

use thiserror::Error;

use crate::audit::AuditError;
use crate::dlp::DlpError;
use crate::state::StateError;
use crate::token::TokenError;

/// Upper bound on node transitions per turn; a loop guard, far above any
/// legitimate plan (32 steps x 3 tries x ~6 nodes).
pub const MAX_TRANSITIONS: usize = 2048;

/// Identifiers of the graph nodes. Flat dispatch happens over this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeId {
    /// Entry point; routes on intent and interaction state.
    Router,
    /// Produces the plan via the planner oracle.
    Planner,
    /// Advances, retries, or escalates plan steps.
    Supervisor,
    /// Produces a tool proposal via the executor oracle.
    Executor,
    /// The chokepoint: integrity verification plus risk policy.
    RiskGate,
    /// Emits the approval challenge and suspends the turn.
    AwaitApproval,
    /// Validates approval and rejection replies.
    ApprovalHandler,
    /// Invokes the tool substrate.
    Tools,
    /// Applies eviction policy and closes out the step.
    Interpreter,
    /// Composes the closing assistant message.
    Finalizer,
    /// Sentinel: the turn is over.
    End,
}

impl NodeId {
    /// Lowercase name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Router => "router",
            Self::Planner => "planner",
            Self::Supervisor => "supervisor",
            Self::Executor => "executor",
            Self::RiskGate => "risk_gate",
            Self::AwaitApproval => "await_approval",
            Self::ApprovalHandler => "approval_handler",
            Self::Tools => "tools",
            Self::Interpreter => "interpreter",
            Self::Finalizer => "finalizer",
            Self::End => "end",
        }
    }
}

/// Result of one graph turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Assistant messages emitted during the turn, in order.
    pub messages: Vec<String>,
    /// Whether the thread is paused on human approval.
    pub awaiting_approval: bool,
}

/// Infrastructure failures during a turn. Policy failures (blocked tools,
/// rejected approvals, tool errors) are not errors — they become failed
/// tool results and the turn continues.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GraphError {
    /// The audit sink failed; the turn cannot continue unaudited.
    #[error("audit failure: {0}")]
    Audit(#[from] AuditError),

    /// Snapshot persistence failed.
    #[error("state persistence failure: {0}")]
    State(#[from] StateError),

    /// The transition budget was exhausted (runaway loop guard).
    #[error("transition budget exhausted after {limit} node transitions")]
    TransitionBudget {
        /// The budget that was exhausted.
        limit: usize,
    },
}

/// Errors constructing a [`GraphRuntime`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GraphBuildError {
    /// A required oracle was not provided.
    #[error("graph runtime requires a {0} oracle")]
    MissingOracle(&'static str),

    /// The token manager rejected the configured secret.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// The audit log could not be opened.
    #[error(transparent)]
    Audit(#[from] AuditError),

    /// A configured secret pattern failed to compile.
    #[error(transparent)]
    Dlp(#[from] DlpError),
}
