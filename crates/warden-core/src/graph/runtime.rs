//! Node implementations and the dispatch loop.

use std::sync::{Arc, OnceLock};

use rand::Rng;
use regex::Regex;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{GraphBuildError, GraphError, MAX_TRANSITIONS, NodeId, TurnOutcome};
use crate::audit::{AuditEntry, AuditLog};
use crate::canonical::{canonicalize_args, sha256_hex};
use crate::clock::Clock;
use crate::config::RuntimeConfig;
use crate::dlp::DlpScanner;
use crate::eviction::EvictionStore;
use crate::oracle::{ExecutorOracle, PlannerOracle, ToolInvoker};
use crate::risk::{RiskEngine, Verdict};
use crate::state::{
    AuditRecord, GraphState, Intent, ProposedTool, Role, StateStore, StepStatus, ToolResult,
    ToolStatus,
};
use crate::token::TokenManager;

/// Audit kind: the planner produced a plan.
pub const KIND_PLAN_CREATED: &str = "plan_created";
/// Audit kind: a reasoning oracle returned unusable output.
pub const KIND_ORACLE_FAILURE: &str = "oracle_failure";
/// Audit kind: the executor populated a proposal.
pub const KIND_TOOL_PROPOSED: &str = "tool_proposed";
/// Audit kind: the risk gate refused a proposal whose integrity fields
/// diverged from the recomputed ones.
pub const KIND_INTEGRITY_MISMATCH: &str = "integrity_mismatch";
/// Audit kind: the risk engine evaluated a proposal.
pub const KIND_RISK_EVALUATED: &str = "risk_evaluated";
/// Audit kind: an approval token verified and was consumed.
pub const KIND_APPROVAL_GRANTED: &str = "approval_granted";
/// Audit kind: the user rejected the pending approval.
pub const KIND_APPROVAL_REJECTED: &str = "approval_rejected";
/// Audit kind: the pending approval expired before a valid reply.
pub const KIND_APPROVAL_EXPIRED: &str = "approval_expired";
/// Audit kind: an approval reply failed validation.
pub const KIND_APPROVAL_INVALID: &str = "approval_invalid";
/// Audit kind: a non-approval message superseded the pending challenge.
pub const KIND_APPROVAL_SUPERSEDED: &str = "approval_superseded";
/// Audit kind: the tool substrate was invoked.
pub const KIND_TOOL_EXECUTED: &str = "tool_executed";
/// Audit kind: the interpreter closed out a step.
pub const KIND_RESULT_INTERPRETED: &str = "result_interpreted";
/// Audit kind: a step exhausted its retry budget.
pub const KIND_STEP_FAILED: &str = "step_failed";
/// Audit kind: the egress scan found secrets in tool output.
pub const KIND_DLP_EGRESS_FINDING: &str = "dlp_egress_finding";

/// Failure reason recorded when integrity verification fails.
pub const REASON_INTEGRITY_MISMATCH: &str = "IntegrityMismatch";
/// Failure reason recorded when the user rejects an approval.
pub const REASON_USER_REJECTED: &str = "UserRejected";
/// Failure reason recorded when an approval expires.
pub const REASON_APPROVAL_EXPIRED: &str = "ApprovalExpired";
/// Failure reason recorded when an approval reply fails validation.
pub const REASON_APPROVAL_INVALID: &str = "ApprovalInvalid";
/// Failure reason recorded when a new message supersedes a pending
/// approval.
pub const REASON_APPROVAL_SUPERSEDED: &str = "ApprovalSuperseded";

/// Length of generated approval ids.
const APPROVAL_ID_LEN: usize = 16;

/// Url-safe alphabet for approval ids.
const URL_SAFE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

fn approve_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Case-sensitive, anchored, single spaces; the token alphabet includes
    // '.' because the token format is dot-separated.
    RE.get_or_init(|| {
        Regex::new(r"^APROBAR ([A-Za-z0-9_-]{6,}) ([A-Za-z0-9._-]{10,})$").expect("valid regex")
    })
}

fn reject_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^RECHAZAR ([A-Za-z0-9_-]{6,})$").expect("valid regex"))
}

/// Whether `text` is an approval-protocol command (`APROBAR ...` /
/// `RECHAZAR ...`).
///
/// Ingress layers must match these verbatim and exempt them from content
/// transformations: redacting a digit run inside the token's signature
/// would break the cryptographic binding.
#[must_use]
pub fn is_approval_command(text: &str) -> bool {
    let text = text.trim();
    approve_re().is_match(text) || reject_re().is_match(text)
}

/// The graph runtime: components plus oracle seams.
///
/// A runtime is immutable and shareable; all per-thread state lives in
/// [`GraphState`].
pub struct GraphRuntime {
    config: Arc<RuntimeConfig>,
    clock: Arc<dyn Clock>,
    tokens: Arc<TokenManager>,
    risk: RiskEngine,
    audit: Arc<AuditLog>,
    eviction: EvictionStore,
    dlp: DlpScanner,
    planner: Arc<dyn PlannerOracle>,
    executor: Arc<dyn ExecutorOracle>,
    invoker: Arc<dyn ToolInvoker>,
}

impl std::fmt::Debug for GraphRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphRuntime")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Builder for [`GraphRuntime`].
pub struct GraphRuntimeBuilder {
    config: Arc<RuntimeConfig>,
    clock: Arc<dyn Clock>,
    tokens: Option<Arc<TokenManager>>,
    audit: Option<Arc<AuditLog>>,
    planner: Option<Arc<dyn PlannerOracle>>,
    executor: Option<Arc<dyn ExecutorOracle>>,
    invoker: Option<Arc<dyn ToolInvoker>>,
}

impl GraphRuntimeBuilder {
    /// Sets the planner oracle.
    #[must_use]
    pub fn planner(mut self, planner: Arc<dyn PlannerOracle>) -> Self {
        self.planner = Some(planner);
        self
    }

    /// Sets the executor oracle.
    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn ExecutorOracle>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Sets the tool invoker.
    #[must_use]
    pub fn invoker(mut self, invoker: Arc<dyn ToolInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    /// Provides a shared token manager (otherwise one is built from the
    /// configured secret).
    #[must_use]
    pub fn tokens(mut self, tokens: Arc<TokenManager>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Provides a shared audit log (otherwise one is opened at the
    /// configured path).
    #[must_use]
    pub fn audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Builds the runtime.
    ///
    /// # Errors
    ///
    /// Returns [`GraphBuildError`] if an oracle is missing, the secret is
    /// rejected, or the audit log cannot be opened.
    pub fn build(self) -> Result<GraphRuntime, GraphBuildError> {
        let planner = self.planner.ok_or(GraphBuildError::MissingOracle("planner"))?;
        let executor = self.executor.ok_or(GraphBuildError::MissingOracle("executor"))?;
        let invoker = self.invoker.ok_or(GraphBuildError::MissingOracle("tool invoker"))?;

        let tokens = match self.tokens {
            Some(tokens) => tokens,
            None => {
                let secret = self.config.hmac_secret.clone();
                let manager = if self.config.dev_mode {
                    TokenManager::new_lenient(secret, self.clock.clone())?
                } else {
                    TokenManager::new(secret, self.clock.clone())?
                };
                Arc::new(manager)
            },
        };

        let audit = match self.audit {
            Some(audit) => audit,
            None => Arc::new(AuditLog::open(&self.config.audit_log_path)?),
        };

        let risk = RiskEngine::from_config(self.config.clone())?;
        let dlp = risk.scanner().clone();

        Ok(GraphRuntime {
            risk,
            dlp,
            eviction: EvictionStore::new(self.config.eviction_root.clone()),
            config: self.config,
            clock: self.clock,
            tokens,
            audit,
            planner,
            executor,
            invoker,
        })
    }
}

impl GraphRuntime {
    /// Starts a builder.
    #[must_use]
    pub fn builder(config: Arc<RuntimeConfig>, clock: Arc<dyn Clock>) -> GraphRuntimeBuilder {
        GraphRuntimeBuilder {
            config,
            clock,
            tokens: None,
            audit: None,
            planner: None,
            executor: None,
            invoker: None,
        }
    }

    /// The runtime configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The token manager (shared with out-of-band approval channels).
    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// The audit log.
    #[must_use]
    pub fn audit_log(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Drives one turn from Router to END, persisting after every node.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError`] only on infrastructure failure (audit sink,
    /// state store, loop guard); policy failures become failed tool results
    /// and the turn continues.
    pub fn run_turn(
        &self,
        state: &mut GraphState,
        store: &dyn StateStore,
    ) -> Result<TurnOutcome, GraphError> {
        let baseline = state.messages.len();
        let mut node = NodeId::Router;
        let mut transitions = 0usize;

        while node != NodeId::End {
            transitions += 1;
            if transitions > MAX_TRANSITIONS {
                return Err(GraphError::TransitionBudget {
                    limit: MAX_TRANSITIONS,
                });
            }
            debug!(
                node = node.as_str(),
                thread_id = %state.thread_id,
                transition = transitions,
                "dispatching node"
            );
            node = self.dispatch(node, state)?;
            store.save(state)?;
        }

        Ok(TurnOutcome {
            messages: state.messages[baseline..]
                .iter()
                .filter(|m| m.role == Role::Assistant)
                .map(|m| m.content.clone())
                .collect(),
            awaiting_approval: state.awaiting_approval,
        })
    }

    fn dispatch(&self, node: NodeId, state: &mut GraphState) -> Result<NodeId, GraphError> {
        match node {
            NodeId::Router => self.router(state),
            NodeId::Planner => self.planner_node(state),
            NodeId::Supervisor => self.supervisor(state),
            NodeId::Executor => self.executor_node(state),
            NodeId::RiskGate => self.risk_gate(state),
            NodeId::AwaitApproval => Ok(self.await_approval(state)),
            NodeId::ApprovalHandler => self.approval_handler(state),
            NodeId::Tools => self.tools(state),
            NodeId::Interpreter => self.interpreter(state),
            NodeId::Finalizer => Ok(self.finalizer(state)),
            NodeId::End => Ok(NodeId::End),
        }
    }

    // ------------------------------------------------------------------
    // Router
    // ------------------------------------------------------------------

    /// Routing decision table, evaluated top to bottom.
    fn router(&self, state: &mut GraphState) -> Result<NodeId, GraphError> {
        if state.awaiting_approval {
            let text = state
                .last_user_message()
                .map(|m| m.content.trim().to_string())
                .unwrap_or_default();
            if approve_re().is_match(&text) || reject_re().is_match(&text) {
                return Ok(NodeId::ApprovalHandler);
            }
            // Anything else abandons the pending challenge: the proposal
            // must not survive outside the approval path (a live proposal
            // is only legal en route to the gate, the pause, the handler,
            // or the tools).
            self.clear_approval(state);
            state.last_tool_result = Some(ToolResult::failed(REASON_APPROVAL_SUPERSEDED));
            let entry = self.entry(state, KIND_APPROVAL_SUPERSEDED)
                .with_reason(REASON_APPROVAL_SUPERSEDED);
            self.record(state, entry)?;
            return Ok(NodeId::Supervisor);
        }

        Ok(match state.intent {
            Intent::Conversation => NodeId::Finalizer,
            Intent::Task if state.plan.is_empty() => NodeId::Planner,
            Intent::Task => NodeId::Supervisor,
        })
    }

    // ------------------------------------------------------------------
    // Planner
    // ------------------------------------------------------------------

    fn planner_node(&self, state: &mut GraphState) -> Result<NodeId, GraphError> {
        match self.planner.propose_steps(state) {
            Ok(steps) => {
                let steps: Vec<String> = steps
                    .into_iter()
                    .take(self.config.max_plan_steps)
                    .collect();
                if steps.is_empty() {
                    return Ok(NodeId::Finalizer);
                }

                state.step_status = (0..steps.len()).map(|i| (i, StepStatus::Pending)).collect();
                state.tries = (0..steps.len()).map(|i| (i, 0)).collect();
                state.current_step = 0;
                state.plan = steps;

                let entry = self.entry(state, KIND_PLAN_CREATED)
                    .with_extra(json!({ "steps": state.plan.len() }));
                self.record(state, entry)?;
                Ok(NodeId::Supervisor)
            },
            Err(err) => {
                warn!(thread_id = %state.thread_id, error = %err, "planner oracle failed");
                state.last_tool_result = Some(ToolResult::failed(format!("OracleFailure: {err}")));
                let entry = self.entry(state, KIND_ORACLE_FAILURE)
                    .with_reason("planner");
                self.record(state, entry)?;
                Ok(NodeId::Finalizer)
            },
        }
    }

    // ------------------------------------------------------------------
    // Supervisor
    // ------------------------------------------------------------------

    fn supervisor(&self, state: &mut GraphState) -> Result<NodeId, GraphError> {
        if state.plan.is_empty() || state.current_step >= state.plan.len() {
            return Ok(NodeId::Finalizer);
        }

        let idx = state.current_step;
        let status = state
            .step_status
            .get(&idx)
            .copied()
            .unwrap_or(StepStatus::Pending);

        if status == StepStatus::Done {
            state.current_step += 1;
            if state.current_step >= state.plan.len() {
                return Ok(NodeId::Finalizer);
            }
            return Ok(NodeId::Supervisor);
        }

        let tries = state.tries.get(&idx).copied().unwrap_or(0);
        if tries >= self.config.max_tries {
            state.step_status.insert(idx, StepStatus::Failed);
            let entry = self.entry(state, KIND_STEP_FAILED)
                .with_reason("MAX_TRIES_EXCEEDED")
                .with_extra(json!({ "step": idx, "tries": tries }));
            self.record(state, entry)?;
            return Ok(NodeId::Finalizer);
        }

        state.tries.insert(idx, tries + 1);
        state.step_status.insert(idx, StepStatus::Running);
        Ok(NodeId::Executor)
    }

    // ------------------------------------------------------------------
    // Executor
    // ------------------------------------------------------------------

    /// Calls the executor oracle and populates the proposal. The integrity
    /// fields are computed **here**, never accepted from the oracle.
    fn executor_node(&self, state: &mut GraphState) -> Result<NodeId, GraphError> {
        let proposal = match self.executor.propose_tool(state) {
            Ok(proposal) => proposal,
            Err(err) => {
                warn!(thread_id = %state.thread_id, error = %err, "executor oracle failed");
                state.last_tool_result = Some(ToolResult::failed(format!("OracleFailure: {err}")));
                let entry = self.entry(state, KIND_ORACLE_FAILURE)
                    .with_reason("executor");
                self.record(state, entry)?;
                return Ok(NodeId::Interpreter);
            },
        };

        let canonical_args = match canonicalize_args(&proposal.args) {
            Ok(canonical) => canonical,
            Err(err) => {
                state.last_tool_result =
                    Some(ToolResult::failed(format!("OracleFailure: {err}")));
                let entry = self.entry(state, KIND_ORACLE_FAILURE)
                    .with_tool(&proposal.name)
                    .with_reason("uncanonicalizable arguments");
                self.record(state, entry)?;
                return Ok(NodeId::Interpreter);
            },
        };
        let args_hash = sha256_hex(&canonical_args);

        let tool = ProposedTool {
            name: proposal.name,
            args: proposal.args,
            canonical_args,
            args_hash,
            tool_call_id: Uuid::new_v4().to_string(),
            step_idx: state.current_step,
            created_at: self.clock.now_unix(),
        };

        let entry = self
            .entry(state, KIND_TOOL_PROPOSED)
            .with_tool(&tool.name)
            .with_args_hash(&tool.args_hash)
            .with_extra(json!({ "tool_call_id": tool.tool_call_id, "step": tool.step_idx }));
        state.proposed_tool = Some(tool);
        self.record(state, entry)?;

        Ok(NodeId::RiskGate)
    }

    // ------------------------------------------------------------------
    // RiskGate
    // ------------------------------------------------------------------

    /// The chokepoint. Recomputes the canonical form and hash from the raw
    /// arguments and refuses on any divergence, then applies risk policy.
    fn risk_gate(&self, state: &mut GraphState) -> Result<NodeId, GraphError> {
        let Some(tool) = state.proposed_tool.clone() else {
            state.last_tool_result = Some(ToolResult::failed("no proposal at risk gate"));
            let entry = self.entry(state, KIND_INTEGRITY_MISMATCH)
                .with_reason("missing proposal");
            self.record(state, entry)?;
            return Ok(NodeId::Interpreter);
        };

        // 1-2. Integrity: trust nothing from upstream.
        let recomputed = canonicalize_args(&tool.args)
            .ok()
            .map(|canonical| (sha256_hex(&canonical), canonical));
        let verified = recomputed.as_ref().is_some_and(|(hash, canonical)| {
            *canonical == tool.canonical_args && *hash == tool.args_hash
        });
        if !verified {
            warn!(
                thread_id = %state.thread_id,
                tool = %tool.name,
                "integrity mismatch: proposal refused"
            );
            state.proposed_tool = None;
            state.last_tool_result = Some(ToolResult::failed(REASON_INTEGRITY_MISMATCH));
            let entry = self.entry(state, KIND_INTEGRITY_MISMATCH)
                .with_tool(&tool.name)
                .with_args_hash(&tool.args_hash)
                .with_reason(REASON_INTEGRITY_MISMATCH);
            self.record(state, entry)?;
            return Ok(NodeId::Interpreter);
        }
        let (hash, canonical) = recomputed.expect("verified above");

        // 3. Risk policy over the recomputed canonical form.
        let decision = self.risk.evaluate(&tool.name, &canonical);
        let mut entry = self
            .entry(state, KIND_RISK_EVALUATED)
            .with_tool(&tool.name)
            .with_args_hash(&hash)
            .with_decision(decision.decision.as_str())
            .with_reason(&decision.reason)
            .with_extra(json!({ "level": decision.level.as_str() }));
        if decision.is_critical_block() {
            entry = entry.critical();
        }
        self.record(state, entry)?;

        match decision.decision {
            Verdict::Blocked => {
                info!(
                    thread_id = %state.thread_id,
                    tool = %tool.name,
                    reason = %decision.reason,
                    "proposal blocked"
                );
                state.proposed_tool = None;
                state.last_tool_result =
                    Some(ToolResult::failed(format!("PolicyBlocked: {}", decision.reason)));
                Ok(NodeId::Interpreter)
            },
            Verdict::AuthRequired => {
                state.approval_id = Some(fresh_approval_id());
                state.approval_hash = Some(hash);
                state.approval_expires_at =
                    Some(self.clock.now_unix() + self.config.approval_ttl_seconds);
                state.awaiting_approval = true;
                Ok(NodeId::AwaitApproval)
            },
            Verdict::Allow => Ok(NodeId::Tools),
        }
    }

    // ------------------------------------------------------------------
    // AwaitApproval
    // ------------------------------------------------------------------

    /// Emits the approval challenge and suspends the turn. State was
    /// already updated (and audited) by the risk gate; the next user
    /// message resumes through the router.
    fn await_approval(&self, state: &mut GraphState) -> NodeId {
        let approval_id = state.approval_id.clone().unwrap_or_default();
        let tool_name = state
            .proposed_tool
            .as_ref()
            .map_or_else(|| "unknown".to_string(), |t| t.name.clone());

        let message = if self.config.dev_mode {
            // Dev convenience only. In production the token arrives via an
            // out-of-band trusted channel and never from the reasoning
            // oracle.
            let token = self.tokens.sign(&approval_payload(state));
            format!(
                "Authorization required for tool '{tool_name}'.\n\
                 To approve, reply: APROBAR {approval_id} {token}\n\
                 To reject, reply: RECHAZAR {approval_id}"
            )
        } else {
            format!(
                "Authorization required for tool '{tool_name}'.\n\
                 Reply 'APROBAR {approval_id} <token>' with the token from your \
                 approval channel, or 'RECHAZAR {approval_id}' to reject."
            )
        };
        state.push_assistant_message(message);
        NodeId::End
    }

    // ------------------------------------------------------------------
    // ApprovalHandler
    // ------------------------------------------------------------------

    /// Validates an approval or rejection reply.
    ///
    /// Every failure clears the challenge *and* the proposal: a proposal
    /// may only stay alive on the path to execution.
    fn approval_handler(&self, state: &mut GraphState) -> Result<NodeId, GraphError> {
        let text = state
            .last_user_message()
            .map(|m| m.content.trim().to_string())
            .unwrap_or_default();

        if let Some(captures) = reject_re().captures(&text) {
            let id = &captures[1];
            if Some(id) == state.approval_id.as_deref() {
                self.clear_approval(state);
                state.proposed_tool = None;
                state.last_tool_result = Some(ToolResult::failed(REASON_USER_REJECTED));
                let entry = self.entry(state, KIND_APPROVAL_REJECTED)
                    .with_reason(REASON_USER_REJECTED);
                self.record(state, entry)?;
                return Ok(NodeId::Supervisor);
            }
            return self.fail_approval(state, "rejection id mismatch");
        }

        let Some(captures) = approve_re().captures(&text) else {
            // The router only sends matching messages here; treat anything
            // else as an invalid reply.
            return self.fail_approval(state, "unparseable approval reply");
        };
        let (id, token) = (&captures[1], &captures[2]);

        // 1. Challenge id must match.
        if Some(id) != state.approval_id.as_deref() {
            return self.fail_approval(state, "approval id mismatch");
        }

        // 2. Challenge must not have expired.
        let now = self.clock.now_unix();
        if now > state.approval_expires_at.unwrap_or(0) {
            self.clear_approval(state);
            state.proposed_tool = None;
            state.last_tool_result = Some(ToolResult::failed(REASON_APPROVAL_EXPIRED));
            let entry = self.entry(state, KIND_APPROVAL_EXPIRED)
                .with_reason(REASON_APPROVAL_EXPIRED);
            self.record(state, entry)?;
            return Ok(NodeId::Supervisor);
        }

        // 3-4. Reconstruct the composite payload and verify-and-consume:
        // signature, freshness, and anti-replay in one atomic call.
        let payload = approval_payload(state);
        if !self
            .tokens
            .verify_and_consume(token, &payload, self.config.approval_ttl_seconds)
        {
            return self.fail_approval(state, "token verification failed");
        }

        // 5. Success: release the pause, keep the proposal for execution.
        state.awaiting_approval = false;
        state.approval_id = None;
        state.approval_expires_at = None;
        let tool_name = state.proposed_tool.as_ref().map(|t| t.name.clone());
        let mut entry = self.entry(state, KIND_APPROVAL_GRANTED);
        if let Some(name) = tool_name {
            entry = entry.with_tool(name);
        }
        self.record(state, entry)?;
        Ok(NodeId::Tools)
    }

    fn fail_approval(
        &self,
        state: &mut GraphState,
        detail: &str,
    ) -> Result<NodeId, GraphError> {
        info!(thread_id = %state.thread_id, detail, "approval reply rejected");
        self.clear_approval(state);
        state.proposed_tool = None;
        state.last_tool_result = Some(ToolResult::failed(REASON_APPROVAL_INVALID));
        let entry = self.entry(state, KIND_APPROVAL_INVALID)
            .with_reason(REASON_APPROVAL_INVALID)
            .with_extra(json!({ "detail": detail }));
        self.record(state, entry)?;
        Ok(NodeId::Supervisor)
    }

    fn clear_approval(&self, state: &mut GraphState) {
        state.awaiting_approval = false;
        state.approval_id = None;
        state.approval_hash = None;
        state.approval_expires_at = None;
        state.proposed_tool = None;
    }

    // ------------------------------------------------------------------
    // Tools
    // ------------------------------------------------------------------

    fn tools(&self, state: &mut GraphState) -> Result<NodeId, GraphError> {
        let Some(tool) = state.proposed_tool.clone() else {
            state.last_tool_result = Some(ToolResult::failed("no proposal at tool execution"));
            return Ok(NodeId::Interpreter);
        };

        let result = match self.invoker.invoke(&tool.name, &tool.args) {
            Ok(outcome) => ToolResult {
                status: outcome.status,
                output: outcome.output,
                evicted: false,
                pointer: None,
                size_chars: 0,
                rehydration_allowed: true,
                summary: None,
            },
            Err(err) => {
                warn!(thread_id = %state.thread_id, tool = %tool.name, error = %err, "tool execution failed");
                ToolResult::failed(format!("ToolExecutionError: {err}"))
            },
        };
        let status = result.status;
        state.last_tool_result = Some(result);

        let entry = self
            .entry(state, KIND_TOOL_EXECUTED)
            .with_tool(&tool.name)
            .with_args_hash(&tool.args_hash)
            .with_decision(match status {
                ToolStatus::Success => "success",
                ToolStatus::Failed => "failed",
            })
            .with_extra(json!({ "tool_call_id": tool.tool_call_id }));
        self.record(state, entry)?;

        Ok(NodeId::Interpreter)
    }

    // ------------------------------------------------------------------
    // Interpreter
    // ------------------------------------------------------------------

    /// Applies the eviction policy, closes out the step, and clears the
    /// proposal so nothing can execute twice.
    fn interpreter(&self, state: &mut GraphState) -> Result<NodeId, GraphError> {
        let mut result = state
            .last_tool_result
            .take()
            .unwrap_or_else(|| ToolResult::failed("no tool result to interpret"));

        let size = result.output.len();
        result.size_chars = size;

        // Egress observation: secrets in successful tool output are worth
        // an audit entry even though enforcement happens at the argument
        // boundary.
        if result.status == ToolStatus::Success {
            let findings = self.dlp.scan_secrets(&result.output);
            if !findings.is_empty() {
                let entry = self.entry(state, KIND_DLP_EGRESS_FINDING)
                    .with_reason(&findings[0].kind)
                    .with_extra(json!({ "findings": findings.len() }));
                self.record(state, entry)?;
            }
        }

        if size > self.config.eviction_threshold {
            match self.eviction.save(&state.thread_id, &result.output) {
                Ok(pointer) => {
                    result.summary = Some(result.output.chars().take(500).collect());
                    result.output = format!("[EVICTED size={size}] {pointer}");
                    result.evicted = true;
                    result.pointer = Some(pointer);
                    result.rehydration_allowed = size <= self.config.rehydration_limit;
                },
                Err(err) => {
                    warn!(thread_id = %state.thread_id, error = %err, "eviction failed");
                    result = ToolResult::failed(format!("EvictionFailed: {err}"));
                    result.size_chars = size;
                },
            }
        } else {
            result.evicted = false;
            result.rehydration_allowed = true;
        }

        let idx = state.current_step;
        let step_status = if result.status == ToolStatus::Success {
            StepStatus::Done
        } else {
            StepStatus::Failed
        };
        state.step_status.insert(idx, step_status);

        let entry = self
            .entry(state, KIND_RESULT_INTERPRETED)
            .with_decision(match result.status {
                ToolStatus::Success => "success",
                ToolStatus::Failed => "failed",
            })
            .with_extra(json!({
                "step": idx,
                "evicted": result.evicted,
                "size_chars": result.size_chars,
            }));

        state.last_tool_result = Some(result);
        // Double-execution prevention: the proposal dies here, always.
        state.proposed_tool = None;
        state.approval_hash = None;
        self.record(state, entry)?;

        Ok(NodeId::Supervisor)
    }

    // ------------------------------------------------------------------
    // Finalizer
    // ------------------------------------------------------------------

    /// Composes the closing assistant message from accumulated results.
    fn finalizer(&self, state: &mut GraphState) -> NodeId {
        let message = match state.intent {
            Intent::Conversation => {
                "Nothing to execute - describe a task to get started.".to_string()
            },
            Intent::Task => self.compose_task_summary(state),
        };
        state.push_assistant_message(message);
        NodeId::End
    }

    fn compose_task_summary(&self, state: &GraphState) -> String {
        // A step that exhausted its budget dominates the summary.
        let exhausted = state.plan.iter().enumerate().find(|(idx, _)| {
            state.step_status.get(idx) == Some(&StepStatus::Failed)
                && state.tries.get(idx).copied().unwrap_or(0) >= self.config.max_tries
        });
        if let Some((idx, step)) = exhausted {
            let detail = state
                .last_tool_result
                .as_ref()
                .map(|r| truncate_chars(&r.output, 200))
                .unwrap_or_default();
            return format!(
                "Step {} of {} ('{}') did not complete after {} attempts. Last failure: {}",
                idx + 1,
                state.plan.len(),
                step,
                self.config.max_tries,
                detail
            );
        }

        if state.plan.is_empty() {
            return if state
                .last_tool_result
                .as_ref()
                .is_some_and(|r| r.status == ToolStatus::Failed)
            {
                "The request could not be processed.".to_string()
            } else {
                "No actionable steps were identified.".to_string()
            };
        }

        let done = state
            .step_status
            .values()
            .filter(|s| **s == StepStatus::Done)
            .count();
        if done == state.plan.len() {
            let output = state
                .last_tool_result
                .as_ref()
                .map(|r| r.output.clone())
                .unwrap_or_default();
            if output.is_empty() {
                format!("Completed {done} step(s).")
            } else {
                format!("Completed {done} step(s).\n{output}")
            }
        } else {
            format!("Progress: {done} of {} step(s) complete.", state.plan.len())
        }
    }

    // ------------------------------------------------------------------
    // Audit plumbing
    // ------------------------------------------------------------------

    fn entry(&self, state: &GraphState, kind: &str) -> AuditEntry {
        AuditEntry::new(self.clock.now_unix(), &state.thread_id, &state.user_id, kind)
    }

    /// Appends to the persistent log and mirrors compactly into state.
    fn record(&self, state: &mut GraphState, entry: AuditEntry) -> Result<(), GraphError> {
        self.audit.append(&entry)?;
        state.push_audit_record(AuditRecord {
            ts: entry.ts,
            kind: entry.kind.clone(),
            decision: entry.decision.clone(),
            reason: entry.reason.clone(),
        });
        Ok(())
    }
}

/// The composite payload binding a token to `(thread, user, proposal)`.
/// Changing this composition is a breaking change.
fn approval_payload(state: &GraphState) -> String {
    format!(
        "{}:{}:{}",
        state.thread_id,
        state.user_id,
        state.approval_hash.as_deref().unwrap_or_default()
    )
}

fn fresh_approval_id() -> String {
    let mut rng = rand::thread_rng();
    (0..APPROVAL_ID_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..URL_SAFE_ALPHABET.len());
            URL_SAFE_ALPHABET[idx] as char
        })
        .collect()
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
