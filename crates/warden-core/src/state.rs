//! Graph state model and snapshot stores.
//!
//! [`GraphState`] is the snapshot unit: everything a thread needs to resume
//! across process restarts, serialized to self-describing JSON. A
//! [`StateStore`] persists one snapshot per `thread_id`; the SQLite-backed
//! store is the production implementation and the in-memory store backs
//! tests and dev mode.
//!
//! A snapshot that fails validation on load surfaces
//! [`StateError::Corrupted`]; the service layer then quarantines the thread
//! so no further turns run against damaged state.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Cap on the in-state audit mirror; the JSONL file holds the full record.
pub const AUDIT_TRAIL_CAP: usize = 256;

/// Routing hint supplied by ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Small talk or questions; no plan, no tools.
    Conversation,
    /// Work that requires planning and tool execution.
    Task,
}

/// Author of a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The end user.
    User,
    /// The runtime speaking for the agent.
    Assistant,
    /// Operator or system notices.
    System,
}

/// One transcript entry. The transcript is append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message author.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl Message {
    /// Creates a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Creates an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    /// Creates a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Execution status of one plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet attempted.
    Pending,
    /// Currently being attempted.
    Running,
    /// Completed successfully.
    Done,
    /// Failed (retryable until the try budget is spent).
    Failed,
    /// Halted by policy or operator; treated like `Failed` by the
    /// supervisor.
    Blocked,
}

/// Outcome of a physical tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    /// The tool ran and produced output.
    Success,
    /// The tool failed, was blocked, or never ran.
    Failed,
}

/// A tool invocation proposed by the executor, pending integrity and policy
/// checks. Must never be executed without passing the risk gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedTool {
    /// Tool identifier.
    pub name: String,
    /// Raw arguments as proposed.
    pub args: serde_json::Map<String, Value>,
    /// Canonical serialization of `args`, computed by the runtime.
    pub canonical_args: String,
    /// SHA-256 hex of `canonical_args`, computed by the runtime.
    pub args_hash: String,
    /// Unique id for this proposal (idempotency key).
    pub tool_call_id: String,
    /// Plan step this proposal services.
    pub step_idx: usize,
    /// Unix seconds at proposal time.
    pub created_at: i64,
}

/// Result of a tool execution after interpretation (eviction applied).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Success or failure.
    pub status: ToolStatus,
    /// Inline output, or the eviction notice when `evicted`.
    pub output: String,
    /// Whether the original output was moved to the eviction store.
    pub evicted: bool,
    /// Storage pointer, present iff `evicted`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pointer: Option<String>,
    /// UTF-8 byte length of the original output before eviction.
    pub size_chars: usize,
    /// Whether the evicted content may be rehydrated into context.
    pub rehydration_allowed: bool,
    /// First 500 characters of the original output, when evicted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl ToolResult {
    /// Builds a failed result with the given reason as output.
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            status: ToolStatus::Failed,
            output: reason,
            evicted: false,
            pointer: None,
            size_chars: 0,
            rehydration_allowed: true,
            summary: None,
        }
    }

    /// Builds a successful raw result; eviction fields are filled in by the
    /// interpreter.
    #[must_use]
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Success,
            output: output.into(),
            evicted: false,
            pointer: None,
            size_chars: 0,
            rehydration_allowed: true,
            summary: None,
        }
    }
}

/// Compact in-state mirror of an audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Unix seconds.
    pub ts: i64,
    /// Decision kind.
    pub kind: String,
    /// Decision outcome, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    /// Reason code, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Full execution state of one thread; the snapshot unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphState {
    /// Stable conversation identity; primary state key.
    pub thread_id: String,
    /// Principal driving the thread.
    pub user_id: String,
    /// Routing hint from ingress.
    pub intent: Intent,
    /// Append-only transcript.
    pub messages: Vec<Message>,
    /// Ordered step descriptors; empty until the planner runs.
    pub plan: Vec<String>,
    /// Index of the step being worked.
    pub current_step: usize,
    /// Per-step execution status.
    pub step_status: BTreeMap<usize, StepStatus>,
    /// Per-step attempt counter.
    pub tries: BTreeMap<usize, u32>,
    /// Pending proposal; present only between executor and interpreter.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub proposed_tool: Option<ProposedTool>,
    /// Last physical execution outcome.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_tool_result: Option<ToolResult>,
    /// True while paused on human approval.
    pub awaiting_approval: bool,
    /// HITL challenge id.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub approval_id: Option<String>,
    /// Integrity hash bound into the approval token payload.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub approval_hash: Option<String>,
    /// Unix seconds when the pending approval expires.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub approval_expires_at: Option<i64>,
    /// Compact mirror of the persisted audit log.
    pub audit_trail: Vec<AuditRecord>,
    /// True after administrative cancellation; no further routing occurs.
    #[serde(default)]
    pub cancelled: bool,
}

impl GraphState {
    /// Creates fresh state for a new thread.
    #[must_use]
    pub fn new(
        thread_id: impl Into<String>,
        user_id: impl Into<String>,
        intent: Intent,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            user_id: user_id.into(),
            intent,
            messages: Vec::new(),
            plan: Vec::new(),
            current_step: 0,
            step_status: BTreeMap::new(),
            tries: BTreeMap::new(),
            proposed_tool: None,
            last_tool_result: None,
            awaiting_approval: false,
            approval_id: None,
            approval_hash: None,
            approval_expires_at: None,
            audit_trail: Vec::new(),
            cancelled: false,
        }
    }

    /// Appends a user message to the transcript.
    pub fn push_user_message(&mut self, content: impl Into<String>) {
        self.messages.push(Message::user(content));
    }

    /// Appends an assistant message to the transcript.
    pub fn push_assistant_message(&mut self, content: impl Into<String>) {
        self.messages.push(Message::assistant(content));
    }

    /// The most recent user message, if any.
    #[must_use]
    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }

    /// Records a compact audit mirror entry, keeping the trail bounded.
    pub fn push_audit_record(&mut self, record: AuditRecord) {
        self.audit_trail.push(record);
        if self.audit_trail.len() > AUDIT_TRAIL_CAP {
            let excess = self.audit_trail.len() - AUDIT_TRAIL_CAP;
            self.audit_trail.drain(..excess);
        }
    }
}

/// Errors from snapshot stores.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StateError {
    /// A stored snapshot failed schema validation.
    #[error("corrupted state snapshot for thread {thread_id}: {message}")]
    Corrupted {
        /// Thread whose snapshot is damaged.
        thread_id: String,
        /// Validation failure detail (operator-facing).
        message: String,
    },

    /// Snapshot serialization failed.
    #[error("failed to serialize state snapshot: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The backing database failed.
    #[error("state store backend error: {0}")]
    Backend(#[from] rusqlite::Error),

    /// The store path could not be prepared.
    #[error("state store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Snapshot/restore of full execution graph state, keyed by thread.
///
/// Implementations must be safe to share across threads; callers serialize
/// access per `thread_id` with the service layer's advisory lock.
pub trait StateStore: Send + Sync {
    /// Persists a snapshot, replacing any previous one for the thread.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on serialization or backend failure.
    fn save(&self, state: &GraphState) -> Result<(), StateError>;

    /// Loads the snapshot for `thread_id`, or `None` for an unknown thread.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Corrupted`] if a snapshot exists but fails
    /// validation, or [`StateError`] on backend failure.
    fn load(&self, thread_id: &str) -> Result<Option<GraphState>, StateError>;

    /// Destroys the snapshot for `thread_id`. Unknown threads are a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on backend failure.
    fn delete(&self, thread_id: &str) -> Result<(), StateError>;

    /// Flags the thread so no further turns run against it.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on backend failure.
    fn quarantine(&self, thread_id: &str) -> Result<(), StateError>;

    /// Whether the thread is quarantined.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on backend failure.
    fn is_quarantined(&self, thread_id: &str) -> Result<bool, StateError>;
}

/// SQLite-backed snapshot store. One row per thread.
#[derive(Debug)]
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Opens (creating if necessary) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the database cannot be opened or the
    /// schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StateError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Opens an in-memory database (tests).
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, StateError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StateError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS threads (
                 thread_id   TEXT PRIMARY KEY,
                 snapshot    TEXT NOT NULL,
                 quarantined INTEGER NOT NULL DEFAULT 0,
                 updated_at  INTEGER NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl StateStore for SqliteStateStore {
    fn save(&self, state: &GraphState) -> Result<(), StateError> {
        let snapshot = serde_json::to_string(state)?;
        let updated_at = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().expect("lock poisoned");
        conn.execute(
            "INSERT INTO threads (thread_id, snapshot, quarantined, updated_at)
             VALUES (?1, ?2, 0, ?3)
             ON CONFLICT(thread_id) DO UPDATE SET
                 snapshot = excluded.snapshot,
                 updated_at = excluded.updated_at",
            params![state.thread_id, snapshot, updated_at],
        )?;
        Ok(())
    }

    fn load(&self, thread_id: &str) -> Result<Option<GraphState>, StateError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let snapshot: Option<String> = conn
            .query_row(
                "SELECT snapshot FROM threads WHERE thread_id = ?1",
                params![thread_id],
                |row| row.get(0),
            )
            .optional()?;

        match snapshot {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| {
                StateError::Corrupted {
                    thread_id: thread_id.to_string(),
                    message: e.to_string(),
                }
            }),
        }
    }

    fn delete(&self, thread_id: &str) -> Result<(), StateError> {
        let conn = self.conn.lock().expect("lock poisoned");
        conn.execute("DELETE FROM threads WHERE thread_id = ?1", params![thread_id])?;
        Ok(())
    }

    fn quarantine(&self, thread_id: &str) -> Result<(), StateError> {
        let conn = self.conn.lock().expect("lock poisoned");
        conn.execute(
            "UPDATE threads SET quarantined = 1 WHERE thread_id = ?1",
            params![thread_id],
        )?;
        Ok(())
    }

    fn is_quarantined(&self, thread_id: &str) -> Result<bool, StateError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let flag: Option<i64> = conn
            .query_row(
                "SELECT quarantined FROM threads WHERE thread_id = ?1",
                params![thread_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(flag.unwrap_or(0) != 0)
    }
}

/// In-memory snapshot store for tests and dev mode.
///
/// Snapshots pass through the same JSON serialization as the SQLite store,
/// so corruption handling is exercised identically.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<HashMap<String, MemoryRow>>,
}

#[derive(Debug, Clone)]
struct MemoryRow {
    snapshot: String,
    quarantined: bool,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Injects a raw snapshot, bypassing serialization. Test hook for
    /// corruption scenarios.
    pub fn insert_raw(&self, thread_id: impl Into<String>, snapshot: impl Into<String>) {
        self.inner.lock().expect("lock poisoned").insert(
            thread_id.into(),
            MemoryRow {
                snapshot: snapshot.into(),
                quarantined: false,
            },
        );
    }
}

impl StateStore for MemoryStateStore {
    fn save(&self, state: &GraphState) -> Result<(), StateError> {
        let snapshot = serde_json::to_string(state)?;
        let mut inner = self.inner.lock().expect("lock poisoned");
        let quarantined = inner
            .get(&state.thread_id)
            .is_some_and(|row| row.quarantined);
        inner.insert(
            state.thread_id.clone(),
            MemoryRow {
                snapshot,
                quarantined,
            },
        );
        Ok(())
    }

    fn load(&self, thread_id: &str) -> Result<Option<GraphState>, StateError> {
        let inner = self.inner.lock().expect("lock poisoned");
        match inner.get(thread_id) {
            None => Ok(None),
            Some(row) => serde_json::from_str(&row.snapshot).map(Some).map_err(|e| {
                StateError::Corrupted {
                    thread_id: thread_id.to_string(),
                    message: e.to_string(),
                }
            }),
        }
    }

    fn delete(&self, thread_id: &str) -> Result<(), StateError> {
        self.inner.lock().expect("lock poisoned").remove(thread_id);
        Ok(())
    }

    fn quarantine(&self, thread_id: &str) -> Result<(), StateError> {
        if let Some(row) = self.inner.lock().expect("lock poisoned").get_mut(thread_id) {
            row.quarantined = true;
        }
        Ok(())
    }

    fn is_quarantined(&self, thread_id: &str) -> Result<bool, StateError> {
        Ok(self
            .inner
            .lock()
            .expect("lock poisoned")
            .get(thread_id)
            .is_some_and(|row| row.quarantined))
    }
}
