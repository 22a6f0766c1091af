//! End-to-end scenarios for the execution graph, driven exclusively through
//! the public API: scripted oracles in, persisted state and audit JSONL out.

use std::sync::Arc;

use serde_json::json;
use warden_core::audit::AuditEntry;
use warden_core::canonical::{canonicalize_args, sha256_hex};
use warden_core::clock::{Clock, ManualClock};
use warden_core::config::RuntimeConfig;
use warden_core::graph::GraphRuntime;
use warden_core::oracle::{ScriptedExecutor, ScriptedInvoker, ScriptedPlanner};
use warden_core::state::{GraphState, Intent, SqliteStateStore, StateStore, StepStatus, ToolStatus};

struct Scenario {
    runtime: GraphRuntime,
    store: SqliteStateStore,
    clock: Arc<ManualClock>,
    invoker: Arc<ScriptedInvoker>,
    audit_path: std::path::PathBuf,
    _tmp: tempfile::TempDir,
}

fn scenario(
    planner: ScriptedPlanner,
    executor: ScriptedExecutor,
    invoker: ScriptedInvoker,
) -> Scenario {
    let tmp = tempfile::tempdir().unwrap();
    let audit_path = tmp.path().join("audit.jsonl");
    let config = Arc::new(RuntimeConfig {
        workspace_root: tmp.path().join("workspace"),
        eviction_root: tmp.path().join("evictions"),
        audit_log_path: audit_path.clone(),
        dev_mode: true,
        ..RuntimeConfig::default()
    });
    let clock = Arc::new(ManualClock::at(1_700_000_000));
    let invoker = Arc::new(invoker);
    let runtime = GraphRuntime::builder(config, clock.clone())
        .planner(Arc::new(planner))
        .executor(Arc::new(executor))
        .invoker(invoker.clone())
        .build()
        .unwrap();
    Scenario {
        runtime,
        store: SqliteStateStore::open_in_memory().unwrap(),
        clock,
        invoker,
        audit_path,
        _tmp: tmp,
    }
}

fn audit_entries(path: &std::path::Path) -> Vec<AuditEntry> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn approval_command(message: &str) -> String {
    message
        .lines()
        .find_map(|l| l.trim().strip_prefix("To approve, reply: "))
        .expect("pause message carries the dev-mode approval command")
        .to_string()
}

/// Scenario 1: a low-risk read flows straight through to the finalizer.
#[test]
fn happy_path_read_within_workspace() {
    let s = scenario(
        ScriptedPlanner::new(["read README.md"]),
        ScriptedExecutor::default().then_propose("read_file", json!({"path": "README.md"})),
        ScriptedInvoker::default().then_succeed("# Title\nThis is the readme."),
    );

    let mut state = GraphState::new("thread-1", "user-1", Intent::Task);
    state.push_user_message("Read README.md");
    let outcome = s.runtime.run_turn(&mut state, &s.store).unwrap();

    assert!(!outcome.awaiting_approval);
    assert!(outcome.messages.last().unwrap().contains("# Title"));
    assert_eq!(state.step_status.get(&0), Some(&StepStatus::Done));
    assert!(state.proposed_tool.is_none(), "proposal cleared after interpretation");

    let result = state.last_tool_result.as_ref().unwrap();
    assert_eq!(result.status, ToolStatus::Success);
    assert!(!result.evicted);

    let entries = audit_entries(&s.audit_path);
    let risk = entries.iter().find(|e| e.kind == "risk_evaluated").unwrap();
    assert_eq!(risk.decision.as_deref(), Some("allow"));
    assert!(entries.iter().any(|e| e.kind == "tool_executed"));
}

/// Scenario 2: a high-risk send pauses for approval and resumes across a
/// simulated process restart once the token arrives.
#[test]
fn hitl_approval_resumes_across_restart() {
    let s = scenario(
        ScriptedPlanner::new(["send the email"]),
        ScriptedExecutor::default()
            .then_propose("send_email", json!({"to": "boss@acme.com", "body": "hi"})),
        ScriptedInvoker::default().then_succeed("email sent"),
    );

    let mut state = GraphState::new("thread-1", "user-1", Intent::Task);
    state.push_user_message("Send email to the boss");
    let outcome = s.runtime.run_turn(&mut state, &s.store).unwrap();

    assert!(outcome.awaiting_approval);
    assert!(s.invoker.calls().is_empty(), "nothing executes before approval");
    let command = approval_command(outcome.messages.last().unwrap());

    // Simulate a restart: reload the paused thread from the store.
    let mut restored = s.store.load("thread-1").unwrap().unwrap();
    assert!(restored.awaiting_approval);
    assert!(restored.proposed_tool.is_some());

    restored.push_user_message(command);
    let outcome = s.runtime.run_turn(&mut restored, &s.store).unwrap();

    assert!(!outcome.awaiting_approval);
    assert_eq!(s.invoker.calls().len(), 1);
    assert_eq!(restored.step_status.get(&0), Some(&StepStatus::Done));

    let entries = audit_entries(&s.audit_path);
    assert!(entries.iter().any(|e| e.kind == "approval_granted"));
}

/// Scenario 3: the same approval command never executes twice.
#[test]
fn replayed_approval_never_executes_twice() {
    let s = scenario(
        ScriptedPlanner::new(["send the email"]),
        ScriptedExecutor::default()
            .then_propose("send_email", json!({"to": "boss@acme.com", "body": "hi"})),
        ScriptedInvoker::default().then_succeed("email sent").then_succeed("never"),
    );

    let mut state = GraphState::new("thread-1", "user-1", Intent::Task);
    state.push_user_message("Send email to the boss");
    let outcome = s.runtime.run_turn(&mut state, &s.store).unwrap();
    let command = approval_command(outcome.messages.last().unwrap());
    let challenge_id = state.approval_id.clone().unwrap();
    let challenge_hash = state.approval_hash.clone().unwrap();

    state.push_user_message(command.clone());
    s.runtime.run_turn(&mut state, &s.store).unwrap();
    assert_eq!(s.invoker.calls().len(), 1);

    // An attacker re-arms the pause and replays the consumed token.
    state.awaiting_approval = true;
    state.approval_id = Some(challenge_id);
    state.approval_hash = Some(challenge_hash);
    state.approval_expires_at = Some(s.clock.now_unix() + 300);
    state.push_user_message(command);
    s.runtime.run_turn(&mut state, &s.store).unwrap();

    assert_eq!(s.invoker.calls().len(), 1, "replay must not execute");
    let entries = audit_entries(&s.audit_path);
    assert!(entries.iter().any(|e| e.kind == "approval_invalid"));
}

/// Scenario 4 (integrity property): every executed proposal's audited hash
/// is exactly the hash of the canonicalized arguments the tool received.
#[test]
fn executed_hash_matches_recomputed_canonical() {
    let s = scenario(
        ScriptedPlanner::new(["read a", "read b"]),
        ScriptedExecutor::default()
            .then_propose("read_file", json!({"path": "a.txt", "limit": 10}))
            .then_propose("read_file", json!({"b": 1, "a": {"z": true, "m": [1, 2]}})),
        ScriptedInvoker::default().then_succeed("a").then_succeed("b"),
    );

    let mut state = GraphState::new("thread-1", "user-1", Intent::Task);
    state.push_user_message("read both");
    s.runtime.run_turn(&mut state, &s.store).unwrap();

    let entries = audit_entries(&s.audit_path);
    let executed: Vec<&AuditEntry> = entries.iter().filter(|e| e.kind == "tool_executed").collect();
    assert_eq!(executed.len(), 2);

    for (entry, (_, args)) in executed.iter().zip(s.invoker.calls()) {
        let recomputed = sha256_hex(&canonicalize_args(&args).unwrap());
        assert_eq!(entry.args_hash.as_deref(), Some(recomputed.as_str()));
    }
}

/// Scenario 5: honeyfile access is blocked critical and never touches the
/// tool substrate.
#[test]
fn honeyfile_blocked_and_audited_critical() {
    let s = scenario(
        ScriptedPlanner::new(["read the backup"]),
        ScriptedExecutor::default()
            .then_propose("read_file", json!({"path": "admin_backup.json"}))
            .then_propose("read_file", json!({"path": "admin_backup.json"}))
            .then_propose("read_file", json!({"path": "admin_backup.json"})),
        ScriptedInvoker::default().then_succeed("never"),
    );

    let mut state = GraphState::new("thread-1", "user-1", Intent::Task);
    state.push_user_message("Read admin_backup.json");
    s.runtime.run_turn(&mut state, &s.store).unwrap();

    assert!(s.invoker.calls().is_empty(), "honeyfile must never be read");

    let entries = audit_entries(&s.audit_path);
    let trap = entries
        .iter()
        .find(|e| {
            e.kind == "risk_evaluated"
                && e.reason
                    .as_deref()
                    .is_some_and(|r| r.starts_with("HONEYTOKEN_TRIGGERED"))
        })
        .expect("honeytoken decision audited");
    assert_eq!(trap.decision.as_deref(), Some("blocked"));
    assert_eq!(trap.severity.as_deref(), Some("critical"));
}

/// Scenario 6: traversal out of the workspace is blocked with a path-escape
/// reason.
#[test]
fn path_escape_blocked_and_audited() {
    let s = scenario(
        ScriptedPlanner::new(["read passwd"]),
        ScriptedExecutor::default()
            .then_propose("read_file", json!({"path": "../../etc/passwd"}))
            .then_propose("read_file", json!({"path": "../../etc/passwd"}))
            .then_propose("read_file", json!({"path": "../../etc/passwd"})),
        ScriptedInvoker::default().then_succeed("never"),
    );

    let mut state = GraphState::new("thread-1", "user-1", Intent::Task);
    state.push_user_message("Read /etc/passwd please");
    let outcome = s.runtime.run_turn(&mut state, &s.store).unwrap();

    assert!(s.invoker.calls().is_empty());
    assert!(outcome.messages.last().unwrap().contains("did not complete"));

    let entries = audit_entries(&s.audit_path);
    assert!(entries.iter().any(|e| {
        e.kind == "risk_evaluated"
            && e.reason.as_deref().is_some_and(|r| r.starts_with("PATH_ESCAPE"))
            && e.decision.as_deref() == Some("blocked")
    }));
}

/// Audit ordering within a thread follows the node sequence exactly.
#[test]
fn audit_entries_totally_ordered_within_thread() {
    let s = scenario(
        ScriptedPlanner::new(["read README.md"]),
        ScriptedExecutor::default().then_propose("read_file", json!({"path": "README.md"})),
        ScriptedInvoker::default().then_succeed("content"),
    );

    let mut state = GraphState::new("thread-1", "user-1", Intent::Task);
    state.push_user_message("Read README.md");
    s.runtime.run_turn(&mut state, &s.store).unwrap();

    let kinds: Vec<String> = audit_entries(&s.audit_path)
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            "plan_created",
            "tool_proposed",
            "risk_evaluated",
            "tool_executed",
            "result_interpreted",
        ]
    );
}

/// A paused approval expires naturally: after the TTL the token is useless
/// and the supervisor issues a fresh challenge.
#[test]
fn expired_pause_yields_fresh_challenge() {
    let s = scenario(
        ScriptedPlanner::new(["send the email"]),
        ScriptedExecutor::default()
            .then_propose("send_email", json!({"to": "a@b.com", "body": "hi"}))
            .then_propose("send_email", json!({"to": "a@b.com", "body": "hi"})),
        ScriptedInvoker::default().then_succeed("sent"),
    );

    let mut state = GraphState::new("thread-1", "user-1", Intent::Task);
    state.push_user_message("Send the email");
    let outcome = s.runtime.run_turn(&mut state, &s.store).unwrap();
    let command = approval_command(outcome.messages.last().unwrap());
    let first_id = state.approval_id.clone().unwrap();

    s.clock.advance(301);
    state.push_user_message(command);
    let outcome = s.runtime.run_turn(&mut state, &s.store).unwrap();

    assert!(s.invoker.calls().is_empty());
    assert!(outcome.awaiting_approval, "retry issues a fresh challenge");
    assert_ne!(state.approval_id.as_deref(), Some(first_id.as_str()));
    assert!(audit_entries(&s.audit_path)
        .iter()
        .any(|e| e.kind == "approval_expired"));
}
