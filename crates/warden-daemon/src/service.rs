//! The agent service: one graph turn at a time per thread.
//!
//! Each `thread_id` is a logical serial execution: an advisory lock is held
//! across load, turn, and persistence, so at most one turn per thread is
//! ever in flight while different threads run in parallel. The service also
//! enforces the thread lifecycle rules the graph itself cannot see:
//! quarantine after snapshot corruption, refusal after cancellation, and
//! administrative deletion (which also removes the thread's evicted files).
//!
//! Ingress text passes through DLP redaction *before* it enters the
//! transcript, so PII never reaches the reasoning core or the snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use warden_core::audit::{AuditEntry, AuditError};
use warden_core::dlp::DlpScanner;
use warden_core::eviction::{EvictionError, EvictionStore};
use warden_core::graph::{GraphError, GraphRuntime, is_approval_command};
use warden_core::state::{GraphState, Intent, Message, StateError, StateStore};

/// Thread ids accepted by the service (and the eviction store).
const THREAD_ID_MAX_LEN: usize = 128;

/// Errors surfaced to the ingress collaborator.
///
/// Display strings are user-safe: no secrets, no stack detail.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServiceError {
    /// The thread id is not in the accepted alphabet.
    #[error("invalid thread id")]
    InvalidThreadId,

    /// The thread does not exist.
    #[error("unknown thread")]
    UnknownThread,

    /// The thread is quarantined after state corruption.
    #[error("this thread is unavailable; an operator has been notified")]
    Quarantined,

    /// The thread was administratively cancelled.
    #[error("this thread has been cancelled")]
    Cancelled,

    /// Snapshot store failure.
    #[error("state store failure")]
    State(#[from] StateError),

    /// Graph infrastructure failure.
    #[error("execution failure")]
    Graph(#[from] GraphError),

    /// Audit sink failure.
    #[error("audit failure")]
    Audit(#[from] AuditError),

    /// Eviction store failure during thread deletion.
    #[error("eviction store failure")]
    Eviction(#[from] EvictionError),
}

/// Result of one `invoke` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeOutcome {
    /// Assistant messages produced by the turn, in order.
    pub messages: Vec<String>,
    /// Whether the thread is paused on human approval.
    pub awaiting_approval: bool,
}

/// Service facade over the graph runtime and the process-wide stores.
pub struct AgentService {
    runtime: GraphRuntime,
    store: Arc<dyn StateStore>,
    eviction: EvictionStore,
    dlp: DlpScanner,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    started_at: DateTime<Utc>,
}

impl AgentService {
    /// Creates a service over the given runtime and store.
    #[must_use]
    pub fn new(runtime: GraphRuntime, store: Arc<dyn StateStore>) -> Self {
        let eviction = EvictionStore::new(runtime.config().eviction_root.clone());
        Self {
            runtime,
            store,
            eviction,
            dlp: DlpScanner::new(),
            locks: Mutex::new(HashMap::new()),
            started_at: Utc::now(),
        }
    }

    /// Drives one graph turn for `thread_id` to completion or to the next
    /// suspension point.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] for lifecycle refusals (quarantine,
    /// cancellation, bad thread id) and infrastructure failures. Policy
    /// failures inside the turn are not errors; they surface in the
    /// returned messages.
    pub fn invoke(
        &self,
        thread_id: &str,
        user_id: &str,
        message: &str,
        intent: Intent,
    ) -> Result<InvokeOutcome, ServiceError> {
        validate_thread_id(thread_id)?;
        let lock = self.thread_lock(thread_id);
        let _guard = lock.lock().expect("lock poisoned");

        if self.store.is_quarantined(thread_id)? {
            return Err(ServiceError::Quarantined);
        }

        let mut state = match self.store.load(thread_id) {
            Ok(Some(state)) => state,
            Ok(None) => GraphState::new(thread_id, user_id, intent),
            Err(StateError::Corrupted { thread_id, message }) => {
                warn!(thread_id = %thread_id, %message, "snapshot corrupted; quarantining thread");
                self.store.quarantine(&thread_id)?;
                self.audit_admin(&thread_id, user_id, "thread_quarantined", &message)?;
                return Err(ServiceError::Quarantined);
            },
            Err(err) => return Err(err.into()),
        };

        if state.cancelled {
            return Err(ServiceError::Cancelled);
        }

        // Each message carries a fresh routing hint from ingress.
        state.intent = intent;

        // Approval-protocol commands are matched verbatim downstream;
        // redacting digits inside a token signature would break it.
        let (sanitized, findings) = if is_approval_command(message) {
            (message.trim().to_string(), Vec::new())
        } else {
            self.dlp.sanitize_ingress(message)
        };
        if !findings.is_empty() {
            info!(
                thread_id,
                redactions = findings.len(),
                "PII redacted from ingress message"
            );
            self.audit_admin(thread_id, user_id, "dlp_ingress_redacted", &format!(
                "{} finding(s)",
                findings.len()
            ))?;
        }
        state.push_user_message(sanitized);

        let outcome = self.runtime.run_turn(&mut state, self.store.as_ref())?;
        Ok(InvokeOutcome {
            messages: outcome.messages,
            awaiting_approval: outcome.awaiting_approval,
        })
    }

    /// Administratively cancels a thread. The in-flight turn (if any)
    /// finishes its current node under the thread lock; afterwards no
    /// further routing occurs. Pending approvals expire naturally.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::UnknownThread`] for missing threads, or
    /// store failures.
    pub fn cancel(&self, thread_id: &str) -> Result<(), ServiceError> {
        validate_thread_id(thread_id)?;
        let lock = self.thread_lock(thread_id);
        let _guard = lock.lock().expect("lock poisoned");

        let mut state = self
            .store
            .load(thread_id)?
            .ok_or(ServiceError::UnknownThread)?;
        state.cancelled = true;
        self.store.save(&state)?;
        self.audit_admin(thread_id, &state.user_id, "thread_cancelled", "administrative")?;
        info!(thread_id, "thread cancelled");
        Ok(())
    }

    /// Returns the ordered transcript for a thread.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::UnknownThread`] for missing threads, or
    /// store failures.
    pub fn history(&self, thread_id: &str) -> Result<Vec<Message>, ServiceError> {
        validate_thread_id(thread_id)?;
        let lock = self.thread_lock(thread_id);
        let _guard = lock.lock().expect("lock poisoned");

        let state = self
            .store
            .load(thread_id)?
            .ok_or(ServiceError::UnknownThread)?;
        Ok(state.messages)
    }

    /// Destroys a thread: snapshot and evicted content both.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] on store or eviction failure.
    pub fn delete_thread(&self, thread_id: &str) -> Result<(), ServiceError> {
        validate_thread_id(thread_id)?;
        let lock = self.thread_lock(thread_id);
        let _guard = lock.lock().expect("lock poisoned");

        let user_id = self
            .store
            .load(thread_id)
            .ok()
            .flatten()
            .map_or_else(|| "operator".to_string(), |s| s.user_id);
        self.store.delete(thread_id)?;
        self.eviction.remove_thread(thread_id)?;
        self.audit_admin(thread_id, &user_id, "thread_deleted", "administrative")?;
        info!(thread_id, "thread deleted");
        Ok(())
    }

    /// Seconds since the service started.
    #[must_use]
    #[allow(clippy::cast_sign_loss)] // max(0) ensures non-negative
    pub fn uptime_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }

    /// The underlying runtime (for out-of-band token minting).
    #[must_use]
    pub fn runtime(&self) -> &GraphRuntime {
        &self.runtime
    }

    fn thread_lock(&self, thread_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock poisoned");
        locks
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn audit_admin(
        &self,
        thread_id: &str,
        user_id: &str,
        kind: &str,
        reason: &str,
    ) -> Result<(), AuditError> {
        self.runtime.audit_log().append(
            &AuditEntry::new(Utc::now().timestamp(), thread_id, user_id, kind)
                .with_reason(reason),
        )
    }
}

fn validate_thread_id(thread_id: &str) -> Result<(), ServiceError> {
    let ok = !thread_id.is_empty()
        && thread_id.len() <= THREAD_ID_MAX_LEN
        && thread_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(ServiceError::InvalidThreadId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_thread_id() {
        assert!(validate_thread_id("thread-1").is_ok());
        assert!(validate_thread_id("A_b-9").is_ok());
        assert!(validate_thread_id("").is_err());
        assert!(validate_thread_id("a/b").is_err());
        assert!(validate_thread_id("a b").is_err());
        assert!(validate_thread_id(&"x".repeat(129)).is_err());
    }
}
