//! Append-only audit log.
//!
//! Every security-relevant decision — proposal, risk evaluation, approval,
//! rejection, execution, eviction, quarantine — lands here as one JSON
//! object per line (UTF-8, LF). Writes are flushed and fsynced on every
//! append; a single open handle per process is serialized by a mutex. Log
//! rotation is an operator concern.
//!
//! Honeytoken and blocked-secret entries additionally carry
//! `severity: "critical"`.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Severity marker for honeytoken and blocked-secret entries.
pub const SEVERITY_CRITICAL: &str = "critical";

/// Errors from audit log operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuditError {
    /// The log file could not be opened or created.
    #[error("failed to open audit log at {}: {source}", path.display())]
    OpenFailed {
        /// The log path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An append failed.
    #[error("failed to append audit entry: {0}")]
    AppendFailed(#[from] std::io::Error),

    /// The entry could not be serialized.
    #[error("failed to serialize audit entry: {0}")]
    SerializeFailed(#[from] serde_json::Error),
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unix timestamp in seconds.
    pub ts: i64,

    /// Thread the decision belongs to.
    pub thread_id: String,

    /// Principal driving the thread.
    pub user_id: String,

    /// Decision kind, e.g. `risk_evaluated` or `approval_granted`.
    pub kind: String,

    /// Tool name, when the decision concerns a tool.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    /// Integrity hash of the canonical arguments, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args_hash: Option<String>,

    /// Decision outcome, e.g. `allow`, `auth_required`, `blocked`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,

    /// Machine-readable reason code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// `critical` for honeytoken and blocked-secret entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,

    /// Free-form structured context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl AuditEntry {
    /// Creates an entry with the required fields.
    #[must_use]
    pub fn new(
        ts: i64,
        thread_id: impl Into<String>,
        user_id: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            ts,
            thread_id: thread_id.into(),
            user_id: user_id.into(),
            kind: kind.into(),
            tool_name: None,
            args_hash: None,
            decision: None,
            reason: None,
            severity: None,
            extra: None,
        }
    }

    /// Attaches the tool name.
    #[must_use]
    pub fn with_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    /// Attaches the integrity hash.
    #[must_use]
    pub fn with_args_hash(mut self, args_hash: impl Into<String>) -> Self {
        self.args_hash = Some(args_hash.into());
        self
    }

    /// Attaches the decision outcome.
    #[must_use]
    pub fn with_decision(mut self, decision: impl Into<String>) -> Self {
        self.decision = Some(decision.into());
        self
    }

    /// Attaches the reason code.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Marks the entry critical.
    #[must_use]
    pub fn critical(mut self) -> Self {
        self.severity = Some(SEVERITY_CRITICAL.to_string());
        self
    }

    /// Attaches free-form structured context.
    #[must_use]
    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

/// Append-only JSONL audit sink.
#[derive(Debug)]
pub struct AuditLog {
    file: Mutex<File>,
    path: PathBuf,
}

impl AuditLog {
    /// Opens (creating if necessary) the audit log at `path` in append mode.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::OpenFailed`] if the file or its parent
    /// directory cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| AuditError::OpenFailed {
                    path: path.clone(),
                    source,
                })?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| AuditError::OpenFailed {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    /// Appends one entry, flushing and fsyncing before returning.
    ///
    /// Entries appended from different threads interleave in file append
    /// order; entries from one thread are totally ordered.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] on serialization or I/O failure.
    pub fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = self.file.lock().expect("lock poisoned");
        file.write_all(line.as_bytes())?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    /// The log file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_entries(path: &Path) -> Vec<AuditEntry> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::open(&path).unwrap();

        log.append(
            &AuditEntry::new(1_000, "t1", "u1", "risk_evaluated")
                .with_tool("read_file")
                .with_args_hash("abc123")
                .with_decision("allow")
                .with_reason("TOOL_TIER"),
        )
        .unwrap();
        log.append(&AuditEntry::new(1_001, "t1", "u1", "tool_executed")).unwrap();

        let entries = read_entries(&path);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, "risk_evaluated");
        assert_eq!(entries[0].tool_name.as_deref(), Some("read_file"));
        assert_eq!(entries[0].decision.as_deref(), Some("allow"));
        assert_eq!(entries[1].kind, "tool_executed");
        assert!(entries[1].tool_name.is_none());
    }

    #[test]
    fn test_critical_severity_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::open(&path).unwrap();

        log.append(
            &AuditEntry::new(1_000, "t1", "u1", "risk_evaluated")
                .with_decision("blocked")
                .with_reason("HONEYTOKEN_TRIGGERED")
                .critical(),
        )
        .unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains(r#""severity":"critical""#));
    }

    #[test]
    fn test_optional_fields_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::open(&path).unwrap();

        log.append(&AuditEntry::new(1_000, "t1", "u1", "plan_created")).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("tool_name"));
        assert!(!raw.contains("severity"));
        assert!(!raw.contains("extra"));
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        {
            let log = AuditLog::open(&path).unwrap();
            log.append(&AuditEntry::new(1, "t1", "u1", "first")).unwrap();
        }
        {
            let log = AuditLog::open(&path).unwrap();
            log.append(&AuditEntry::new(2, "t1", "u1", "second")).unwrap();
        }

        let entries = read_entries(&path);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, "first");
        assert_eq!(entries[1].kind, "second");
    }

    #[test]
    fn test_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/audit.jsonl");
        let log = AuditLog::open(&path).unwrap();
        log.append(&AuditEntry::new(1, "t1", "u1", "kind")).unwrap();
        assert!(path.exists());
    }
}
