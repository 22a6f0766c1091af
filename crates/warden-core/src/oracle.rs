//! Oracle boundaries: the reasoning core and the tool substrate.
//!
//! The planner and executor oracles are the untrusted reasoning core; the
//! runtime never trusts their output — integrity fields are computed inside
//! the runtime and every proposal passes the risk gate. The tool invoker is
//! the opaque execution substrate; it enforces the per-tool timeout and
//! maps transport failures into [`ToolError`].
//!
//! Scripted implementations live here too. They drive the test suites and
//! the daemon's dev mode, and double as reference implementations of the
//! traits.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::state::{GraphState, ToolStatus};

/// Errors from the reasoning oracles.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OracleError {
    /// The oracle returned output the runtime cannot use.
    #[error("malformed oracle output: {0}")]
    Malformed(String),

    /// The oracle could not be reached or had no answer.
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the tool substrate.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ToolError {
    /// The named tool is not known to the substrate.
    #[error("tool '{name}' is not registered")]
    UnknownTool {
        /// The unknown tool name.
        name: String,
    },

    /// The transport to the substrate failed.
    #[error("tool transport failed: {0}")]
    Transport(String),

    /// The tool ran and failed.
    #[error("tool execution failed: {0}")]
    Execution(String),

    /// The tool exceeded its execution timeout.
    #[error("tool timed out after {seconds}s")]
    Timeout {
        /// The timeout that elapsed.
        seconds: u64,
    },
}

/// A tool invocation as proposed by the executor oracle.
///
/// Deliberately carries only `name` and `args`: the integrity fields of a
/// [`ProposedTool`](crate::state::ProposedTool) are never oracle output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolProposal {
    /// Tool identifier.
    pub name: String,
    /// Raw arguments.
    pub args: Map<String, Value>,
}

/// Raw outcome of a physical tool execution, before interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    /// Success or failure as reported by the substrate.
    pub status: ToolStatus,
    /// Raw output text.
    pub output: String,
}

impl ToolOutcome {
    /// A successful outcome with the given output.
    #[must_use]
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Success,
            output: output.into(),
        }
    }

    /// A failed outcome with the given output.
    #[must_use]
    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Failed,
            output: output.into(),
        }
    }
}

/// Proposes an ordered list of plan steps for the current state.
pub trait PlannerOracle: Send + Sync {
    /// Returns step descriptors for the latest user request.
    ///
    /// # Errors
    ///
    /// Returns [`OracleError`] when no usable plan can be produced.
    fn propose_steps(&self, state: &GraphState) -> Result<Vec<String>, OracleError>;
}

/// Proposes the next tool invocation for the current step.
pub trait ExecutorOracle: Send + Sync {
    /// Returns the tool the reasoning core wants to run next.
    ///
    /// # Errors
    ///
    /// Returns [`OracleError`] when no usable proposal can be produced.
    fn propose_tool(&self, state: &GraphState) -> Result<ToolProposal, OracleError>;
}

/// Executes tools. Implementations enforce the per-tool timeout.
pub trait ToolInvoker: Send + Sync {
    /// Runs `name` with `args` and returns the raw outcome.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError`] on transport, execution, or timeout failure.
    fn invoke(&self, name: &str, args: &Map<String, Value>) -> Result<ToolOutcome, ToolError>;
}

/// Planner double that always returns the same fixed plan.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPlanner {
    steps: Vec<String>,
}

impl ScriptedPlanner {
    /// Creates a planner returning the given steps.
    pub fn new<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            steps: steps.into_iter().map(Into::into).collect(),
        }
    }
}

impl PlannerOracle for ScriptedPlanner {
    fn propose_steps(&self, _state: &GraphState) -> Result<Vec<String>, OracleError> {
        Ok(self.steps.clone())
    }
}

/// Planner double that always fails.
#[derive(Debug, Clone, Default)]
pub struct FailingPlanner;

impl PlannerOracle for FailingPlanner {
    fn propose_steps(&self, _state: &GraphState) -> Result<Vec<String>, OracleError> {
        Err(OracleError::Unavailable("scripted planner failure".to_string()))
    }
}

/// Executor double that pops pre-scripted proposals in order.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    proposals: Mutex<VecDeque<Result<ToolProposal, String>>>,
}

impl ScriptedExecutor {
    /// Queues a proposal.
    #[must_use]
    pub fn then_propose(self, name: impl Into<String>, args: Value) -> Self {
        let args = match args {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            },
        };
        self.proposals
            .lock()
            .expect("lock poisoned")
            .push_back(Ok(ToolProposal {
                name: name.into(),
                args,
            }));
        self
    }

    /// Queues an oracle failure.
    #[must_use]
    pub fn then_fail(self, message: impl Into<String>) -> Self {
        self.proposals
            .lock()
            .expect("lock poisoned")
            .push_back(Err(message.into()));
        self
    }
}

impl ExecutorOracle for ScriptedExecutor {
    fn propose_tool(&self, _state: &GraphState) -> Result<ToolProposal, OracleError> {
        match self.proposals.lock().expect("lock poisoned").pop_front() {
            Some(Ok(proposal)) => Ok(proposal),
            Some(Err(message)) => Err(OracleError::Malformed(message)),
            None => Err(OracleError::Unavailable("executor script exhausted".to_string())),
        }
    }
}

/// Invoker double that pops pre-scripted outcomes and records every call.
#[derive(Debug, Default)]
pub struct ScriptedInvoker {
    outcomes: Mutex<VecDeque<Result<ToolOutcome, ToolError>>>,
    calls: Mutex<Vec<(String, Map<String, Value>)>>,
}

impl ScriptedInvoker {
    /// Queues a successful outcome.
    #[must_use]
    pub fn then_succeed(self, output: impl Into<String>) -> Self {
        self.outcomes
            .lock()
            .expect("lock poisoned")
            .push_back(Ok(ToolOutcome::success(output)));
        self
    }

    /// Queues a failed outcome.
    #[must_use]
    pub fn then_fail(self, output: impl Into<String>) -> Self {
        self.outcomes
            .lock()
            .expect("lock poisoned")
            .push_back(Ok(ToolOutcome::failed(output)));
        self
    }

    /// Queues a transport error.
    #[must_use]
    pub fn then_error(self, message: impl Into<String>) -> Self {
        self.outcomes
            .lock()
            .expect("lock poisoned")
            .push_back(Err(ToolError::Transport(message.into())));
        self
    }

    /// The calls received so far, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned (indicates a thread panic).
    #[must_use]
    pub fn calls(&self) -> Vec<(String, Map<String, Value>)> {
        self.calls.lock().expect("lock poisoned").clone()
    }
}

impl ToolInvoker for ScriptedInvoker {
    fn invoke(&self, name: &str, args: &Map<String, Value>) -> Result<ToolOutcome, ToolError> {
        self.calls
            .lock()
            .expect("lock poisoned")
            .push((name.to_string(), args.clone()));
        match self.outcomes.lock().expect("lock poisoned").pop_front() {
            Some(outcome) => outcome,
            None => Err(ToolError::Transport("invoker script exhausted".to_string())),
        }
    }
}
