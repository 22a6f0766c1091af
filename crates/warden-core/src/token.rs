//! HMAC-SHA256 approval tokens.
//!
//! Tokens authorize exactly one gated tool execution. The format is
//! `v1.<timestamp>.<nonce>.<signature>` where `timestamp` is unix seconds,
//! `nonce` is 16 hex characters (64 bits of entropy), and `signature` is
//! HMAC-SHA256 over `"<timestamp>:<nonce>:<payload>"` rendered as lowercase
//! hex.
//!
//! The `payload` is the composite binding string
//! `thread_id ":" user_id ":" approval_hash`, so a token minted for one
//! proposal cannot approve a different proposal, thread, or user.
//!
//! # Security Properties
//!
//! - **Constant-time comparison**: signatures compare via
//!   [`subtle::ConstantTimeEq`]
//! - **Anti-replay**: `(nonce, timestamp)` pairs are consumed atomically and
//!   retained until they would have expired anyway
//! - **Freshness**: a token at age exactly `max_age` is valid; one second
//!   older is not; tokens from the future are rejected
//!
//! The consumed-token store is an in-process mutex-guarded map, sufficient
//! for single-node deployments. Multi-node deployments substitute a store
//! with atomic set-if-absent semantics and a TTL equal to the approval TTL.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use hmac::{Hmac, Mac};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::clock::Clock;

type HmacSha256 = Hmac<Sha256>;

/// Token format version.
pub const TOKEN_VERSION: &str = "v1";

/// Default maximum token age in seconds.
pub const DEFAULT_MAX_AGE_SECS: i64 = 300;

/// Minimum secret length in bytes outside dev mode.
pub const MIN_SECRET_LEN: usize = 32;

/// Length of the hex-encoded nonce.
const NONCE_LEN: usize = 16;

/// Length of the hex-encoded HMAC-SHA256 signature.
const SIGNATURE_LEN: usize = 64;

/// Errors raised when constructing a token manager.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TokenError {
    /// The signing secret is empty.
    #[error("token manager requires a non-empty secret")]
    EmptySecret,

    /// The signing secret is shorter than [`MIN_SECRET_LEN`] bytes.
    #[error("token secret too weak: {len} bytes, minimum is {min} (generate with a CSPRNG)")]
    WeakSecret {
        /// Actual secret length in bytes.
        len: usize,
        /// Required minimum length in bytes.
        min: usize,
    },
}

/// Signs and verifies single-use approval tokens.
pub struct TokenManager {
    secret: SecretString,
    clock: Arc<dyn Clock>,
    /// Consumed `(nonce, timestamp)` pairs mapped to their retention
    /// deadline. Guarded by a mutex so check-and-insert is atomic.
    consumed: Mutex<HashMap<(String, i64), i64>>,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("secret", &"[REDACTED]")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    /// Creates a token manager, enforcing secret strength.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::EmptySecret`] or [`TokenError::WeakSecret`] if
    /// the secret is missing or shorter than [`MIN_SECRET_LEN`] bytes.
    pub fn new(secret: SecretString, clock: Arc<dyn Clock>) -> Result<Self, TokenError> {
        let len = secret.expose_secret().len();
        if len == 0 {
            return Err(TokenError::EmptySecret);
        }
        if len < MIN_SECRET_LEN {
            return Err(TokenError::WeakSecret {
                len,
                min: MIN_SECRET_LEN,
            });
        }
        Ok(Self::unchecked(secret, clock))
    }

    /// Creates a token manager without the secret-strength check.
    ///
    /// Dev mode only; never accept a short secret in production.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::EmptySecret`] if the secret is empty.
    pub fn new_lenient(secret: SecretString, clock: Arc<dyn Clock>) -> Result<Self, TokenError> {
        if secret.expose_secret().is_empty() {
            return Err(TokenError::EmptySecret);
        }
        Ok(Self::unchecked(secret, clock))
    }

    fn unchecked(secret: SecretString, clock: Arc<dyn Clock>) -> Self {
        Self {
            secret,
            clock,
            consumed: Mutex::new(HashMap::new()),
        }
    }

    /// Signs `payload` with a fresh timestamp and nonce.
    ///
    /// The payload must be the canonical binding string
    /// (`thread_id:user_id:approval_hash`), never raw tool arguments.
    #[must_use]
    pub fn sign(&self, payload: &str) -> String {
        let timestamp = self.clock.now_unix();
        let nonce = fresh_nonce();
        let signature = self.signature(timestamp, &nonce, payload);
        format!("{TOKEN_VERSION}.{timestamp}.{nonce}.{signature}")
    }

    /// Verifies `token` against `payload` and consumes it, atomically.
    ///
    /// Returns true iff the version is `v1`, the timestamp is within
    /// `[now - max_age_secs, now]`, the signature matches (constant-time),
    /// and the `(nonce, timestamp)` pair has never been consumed. On success
    /// the pair is recorded as consumed; on any failure there is no side
    /// effect on the replay store.
    pub fn verify_and_consume(&self, token: &str, payload: &str, max_age_secs: i64) -> bool {
        let Some(parts) = TokenParts::parse(token) else {
            return false;
        };

        let now = self.clock.now_unix();
        let age = now - parts.timestamp;
        if age < 0 || age > max_age_secs {
            return false;
        }

        let expected = self.signature(parts.timestamp, parts.nonce, payload);
        if !bool::from(expected.as_bytes().ct_eq(parts.signature.as_bytes())) {
            return false;
        }

        let mut consumed = self.consumed.lock().expect("lock poisoned");
        // Sweep entries past their retention deadline so the store stays
        // bounded by the number of tokens issued per TTL window.
        consumed.retain(|_, retain_until| *retain_until >= now);

        let key = (parts.nonce.to_string(), parts.timestamp);
        if consumed.contains_key(&key) {
            return false;
        }
        consumed.insert(key, parts.timestamp + max_age_secs);
        true
    }

    /// Number of live entries in the replay store.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned (indicates a thread panic).
    #[must_use]
    pub fn consumed_len(&self) -> usize {
        self.consumed.lock().expect("lock poisoned").len()
    }

    fn signature(&self, timestamp: i64, nonce: &str, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(format!("{timestamp}:{nonce}:{payload}").as_bytes());
        hex_encode(&mac.finalize().into_bytes())
    }
}

/// The four dot-separated fields of a well-formed token.
struct TokenParts<'a> {
    timestamp: i64,
    nonce: &'a str,
    signature: &'a str,
}

impl<'a> TokenParts<'a> {
    /// Parses and shape-validates a token. Returns `None` on any structural
    /// defect; callers treat that as verification failure.
    fn parse(token: &'a str) -> Option<Self> {
        let mut parts = token.split('.');
        let version = parts.next()?;
        let timestamp = parts.next()?;
        let nonce = parts.next()?;
        let signature = parts.next()?;
        if parts.next().is_some() || version != TOKEN_VERSION {
            return None;
        }

        let timestamp: i64 = timestamp.parse().ok()?;
        if nonce.len() != NONCE_LEN || !is_lower_hex(nonce) {
            return None;
        }
        if signature.len() != SIGNATURE_LEN || !is_lower_hex(signature) {
            return None;
        }

        Some(Self {
            timestamp,
            nonce,
            signature,
        })
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn fresh_nonce() -> String {
    let mut bytes = [0u8; NONCE_LEN / 2];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut acc, b| {
            let _ = write!(acc, "{b:02x}");
            acc
        })
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;
    use crate::clock::ManualClock;

    const SECRET: &str = "test-secret-key-0123456789abcdef";
    const PAYLOAD: &str = "thread-1:user-1:deadbeef";

    fn manager_at(now: i64) -> (TokenManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at(now));
        let manager =
            TokenManager::new(SecretString::from(SECRET), clock.clone()).expect("strong secret");
        (manager, clock)
    }

    #[test]
    fn test_sign_then_consume_once() {
        let (manager, _clock) = manager_at(1_000_000);
        let token = manager.sign(PAYLOAD);
        assert!(manager.verify_and_consume(&token, PAYLOAD, 300));
    }

    #[test]
    fn test_replay_rejected() {
        let (manager, _clock) = manager_at(1_000_000);
        let token = manager.sign(PAYLOAD);
        assert!(manager.verify_and_consume(&token, PAYLOAD, 300));
        assert!(!manager.verify_and_consume(&token, PAYLOAD, 300));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let (manager, _clock) = manager_at(1_000_000);
        let token = manager.sign(PAYLOAD);
        let tampered = format!("{PAYLOAD} ");
        assert!(!manager.verify_and_consume(&token, &tampered, 300));
        // The failed attempt must not consume the token.
        assert!(manager.verify_and_consume(&token, PAYLOAD, 300));
    }

    #[test]
    fn test_tampered_token_rejected() {
        let (manager, _clock) = manager_at(1_000_000);
        let token = manager.sign(PAYLOAD);
        let mut tampered = token.clone();
        // Flip the last signature nibble.
        let last = tampered.pop().unwrap();
        tampered.push(if last == 'a' { 'b' } else { 'a' });
        assert!(!manager.verify_and_consume(&tampered, PAYLOAD, 300));
    }

    #[test]
    fn test_age_boundary() {
        let (manager, clock) = manager_at(1_000_000);
        let token = manager.sign(PAYLOAD);

        clock.advance(300);
        let (fresh_manager, _) = manager_at(1_000_000);
        // Age exactly max_age is valid.
        assert!(manager.verify_and_consume(&token, PAYLOAD, 300));

        // Age max_age + 1 is not.
        let token2 = fresh_manager.sign(PAYLOAD);
        clock.advance(1);
        let late = TokenManager::new(SecretString::from(SECRET), clock.clone()).unwrap();
        assert!(!late.verify_and_consume(&token2, PAYLOAD, 300));
    }

    #[test]
    fn test_future_token_rejected() {
        let clock = Arc::new(ManualClock::at(2_000));
        let manager = TokenManager::new(SecretString::from(SECRET), clock.clone()).unwrap();
        let token = manager.sign(PAYLOAD);

        clock.set(1_000);
        assert!(!manager.verify_and_consume(&token, PAYLOAD, 300));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let clock = Arc::new(ManualClock::at(1_000_000));
        let signer = TokenManager::new(
            SecretString::from("attacker-controlled-secret-012345"),
            clock.clone(),
        )
        .unwrap();
        let verifier = TokenManager::new(SecretString::from(SECRET), clock).unwrap();

        let forged = signer.sign(PAYLOAD);
        assert!(!verifier.verify_and_consume(&forged, PAYLOAD, 300));
    }

    #[test]
    fn test_malformed_tokens_rejected() {
        let (manager, _clock) = manager_at(1_000_000);
        for bad in [
            "",
            "v1.1000000.abcd",
            "v2.1000000.0123456789abcdef.0000000000000000000000000000000000000000000000000000000000000000",
            "v1.not-a-number.0123456789abcdef.0000000000000000000000000000000000000000000000000000000000000000",
            "v1.1000000.SHORT.0000000000000000000000000000000000000000000000000000000000000000",
            "v1.1000000.0123456789abcdef.nothex",
            "v1.1000000.0123456789abcdef.0000.extra",
        ] {
            assert!(
                !manager.verify_and_consume(bad, PAYLOAD, 300),
                "accepted malformed token: {bad}"
            );
        }
    }

    #[test]
    fn test_token_format() {
        let (manager, _clock) = manager_at(1_234_567);
        let token = manager.sign(PAYLOAD);
        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "v1");
        assert_eq!(parts[1], "1234567");
        assert_eq!(parts[2].len(), 16);
        assert_eq!(parts[3].len(), 64);
    }

    #[test]
    fn test_consumed_store_sweeps_expired() {
        let (manager, clock) = manager_at(1_000_000);
        let token = manager.sign(PAYLOAD);
        assert!(manager.verify_and_consume(&token, PAYLOAD, 300));
        assert_eq!(manager.consumed_len(), 1);

        // Past the retention deadline, the next verification sweeps it.
        clock.advance(301);
        let token2 = manager.sign(PAYLOAD);
        assert!(manager.verify_and_consume(&token2, PAYLOAD, 300));
        assert_eq!(manager.consumed_len(), 1);
    }

    #[test]
    fn test_weak_secret_rejected() {
        let clock = Arc::new(ManualClock::at(0));
        let result = TokenManager::new(SecretString::from("short"), clock.clone());
        assert!(matches!(result, Err(TokenError::WeakSecret { .. })));

        let result = TokenManager::new(SecretString::from(""), clock.clone());
        assert!(matches!(result, Err(TokenError::EmptySecret)));

        // Lenient construction accepts short (but not empty) secrets.
        assert!(TokenManager::new_lenient(SecretString::from("short"), clock).is_ok());
    }
}
