//! Runtime configuration.
//!
//! All policy knobs live here: the workspace sandbox, eviction thresholds,
//! approval TTL, retry budget, the tool registry, honeypot sets, and the
//! HMAC secret. Loaded from TOML with serde defaults so a minimal file (or
//! none at all, in dev mode) is enough to start.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::token::MIN_SECRET_LEN;

/// Default eviction threshold in bytes; outputs strictly larger are evicted.
pub const DEFAULT_EVICTION_THRESHOLD: usize = 10_000;

/// Default rehydration limit in bytes.
pub const DEFAULT_REHYDRATION_LIMIT: usize = 50_000;

/// Default approval time-to-live in seconds.
pub const DEFAULT_APPROVAL_TTL_SECS: i64 = 300;

/// Default per-step retry budget.
pub const DEFAULT_MAX_TRIES: u32 = 3;

/// Default cap on plan length.
pub const DEFAULT_MAX_PLAN_STEPS: usize = 32;

/// Default per-tool execution timeout in seconds.
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;

/// Placeholder secret accepted only in dev mode.
pub const DEV_SECRET: &str = "warden-dev-secret-key-0123456789abcdef";

/// Risk tier of a tool, and the level attached to decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Safe to execute without approval.
    Low,
    /// Requires human approval.
    Medium,
    /// Requires human approval; elevated scrutiny.
    High,
    /// Requires human approval; highest scrutiny. Honeytoken hits are
    /// always critical.
    Critical,
}

impl RiskLevel {
    /// Lowercase name used in audit entries.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// What a tool does with its arguments, for policy purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Reads data from paths inside the workspace.
    FileRead,
    /// Writes data to paths inside the workspace (egress to disk).
    FileWrite,
    /// Executes a process.
    ProcessExec,
    /// Sends data off the host (mail, HTTP, ...).
    NetworkSend,
    /// Anything else.
    Other,
}

impl ToolKind {
    /// Whether arguments of this tool carry data out of the runtime.
    #[must_use]
    pub const fn is_write_capable(self) -> bool {
        matches!(self, Self::FileWrite | Self::NetworkSend)
    }

    /// Whether this tool operates on filesystem paths.
    #[must_use]
    pub const fn operates_on_paths(self) -> bool {
        matches!(self, Self::FileRead | Self::FileWrite)
    }
}

/// Registry entry for one tool. New tools are added via configuration; no
/// runtime code loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Base risk tier.
    pub tier: RiskLevel,
    /// Capability class.
    pub kind: ToolKind,
}

/// A deployment-specific egress secret pattern, appended to the built-in
/// detection rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretPattern {
    /// Secret family reported in findings.
    pub kind: String,
    /// Regular expression matching the secret.
    pub pattern: String,
}

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config at {}: {source}", path.display())]
    ReadFailed {
        /// The config path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file failed to parse.
    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),

    /// The HMAC secret is too weak for production.
    #[error(
        "hmac_secret too weak for production: need at least {MIN_SECRET_LEN} bytes from a CSPRNG"
    )]
    WeakSecret,

    /// A sandbox root is not an absolute path.
    #[error("{field} must be an absolute path, got {}", path.display())]
    RelativeRoot {
        /// Name of the offending field.
        field: &'static str,
        /// The rejected path.
        path: PathBuf,
    },

    /// The eviction threshold exceeds the rehydration limit.
    #[error("eviction_threshold ({threshold}) must not exceed rehydration_limit ({limit})")]
    ThresholdAboveLimit {
        /// Configured eviction threshold.
        threshold: usize,
        /// Configured rehydration limit.
        limit: usize,
    },

    /// A configured secret pattern failed to compile.
    #[error("secret pattern for family {kind:?} is not a valid regex")]
    InvalidSecretPattern {
        /// The secret family whose pattern is broken.
        kind: String,
    },
}

/// Full runtime configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Sandbox root; path-bearing tool arguments must resolve inside it.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    /// Root directory of the eviction store.
    #[serde(default = "default_eviction_root")]
    pub eviction_root: PathBuf,

    /// Audit log file.
    #[serde(default = "default_audit_log_path")]
    pub audit_log_path: PathBuf,

    /// SQLite snapshot database.
    #[serde(default = "default_state_db_path")]
    pub state_db_path: PathBuf,

    /// Outputs strictly larger than this many bytes are evicted.
    #[serde(default = "default_eviction_threshold")]
    pub eviction_threshold: usize,

    /// Evicted outputs up to this many bytes may be rehydrated.
    #[serde(default = "default_rehydration_limit")]
    pub rehydration_limit: usize,

    /// Seconds an approval challenge (and its token) stays valid.
    #[serde(default = "default_approval_ttl")]
    pub approval_ttl_seconds: i64,

    /// Per-step attempt budget before escalation.
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,

    /// Cap on planner output length.
    #[serde(default = "default_max_plan_steps")]
    pub max_plan_steps: usize,

    /// Per-tool execution timeout, enforced by the tool invoker.
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_seconds: u64,

    /// Tool registry: name to descriptor. Unknown tools default to
    /// medium-tier auth-required.
    #[serde(default = "default_tool_registry")]
    pub tools: BTreeMap<String, ToolDescriptor>,

    /// Decoy paths; any tool call referencing one is blocked critical.
    #[serde(default = "default_honeyfiles")]
    pub honeyfiles: Vec<String>,

    /// Decoy values; any appearance in arguments is blocked critical.
    #[serde(default = "default_honeytokens")]
    pub honeytokens: Vec<String>,

    /// Extra egress secret patterns, appended to the built-in rule set.
    #[serde(default)]
    pub secret_patterns: Vec<SecretPattern>,

    /// HMAC-SHA256 signing secret for approval tokens.
    #[serde(default = "default_hmac_secret")]
    pub hmac_secret: SecretString,

    /// Dev mode: relaxes secret checks and surfaces approval tokens in
    /// pause messages. Never enable in production.
    #[serde(default)]
    pub dev_mode: bool,
}

impl RuntimeConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed. Call
    /// [`validate`](Self::validate) afterwards.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&raw)?)
    }

    /// A permissive configuration for tests and local development:
    /// dev mode on, roots under the system temp directory.
    #[must_use]
    pub fn for_dev() -> Self {
        let base = std::env::temp_dir().join("warden-dev");
        Self {
            workspace_root: base.join("workspace"),
            eviction_root: base.join("evictions"),
            audit_log_path: base.join("audit.jsonl"),
            state_db_path: base.join("state.db"),
            dev_mode: true,
            ..Self::default()
        }
    }

    /// Validates invariants that serde defaults cannot express.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::WeakSecret`] outside dev mode when the secret is
    ///   short or the known dev placeholder
    /// - [`ConfigError::RelativeRoot`] when a sandbox root is relative
    /// - [`ConfigError::ThresholdAboveLimit`] when eviction and rehydration
    ///   bounds are inverted
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.dev_mode {
            let secret = self.hmac_secret.expose_secret();
            if secret.len() < MIN_SECRET_LEN || secret == DEV_SECRET {
                return Err(ConfigError::WeakSecret);
            }
        }
        if !self.workspace_root.is_absolute() {
            return Err(ConfigError::RelativeRoot {
                field: "workspace_root",
                path: self.workspace_root.clone(),
            });
        }
        if !self.eviction_root.is_absolute() {
            return Err(ConfigError::RelativeRoot {
                field: "eviction_root",
                path: self.eviction_root.clone(),
            });
        }
        if self.eviction_threshold > self.rehydration_limit {
            return Err(ConfigError::ThresholdAboveLimit {
                threshold: self.eviction_threshold,
                limit: self.rehydration_limit,
            });
        }
        for pattern in &self.secret_patterns {
            if regex::Regex::new(&pattern.pattern).is_err() {
                return Err(ConfigError::InvalidSecretPattern {
                    kind: pattern.kind.clone(),
                });
            }
        }
        Ok(())
    }

    /// Looks up a tool descriptor.
    #[must_use]
    pub fn tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            eviction_root: default_eviction_root(),
            audit_log_path: default_audit_log_path(),
            state_db_path: default_state_db_path(),
            eviction_threshold: default_eviction_threshold(),
            rehydration_limit: default_rehydration_limit(),
            approval_ttl_seconds: default_approval_ttl(),
            max_tries: default_max_tries(),
            max_plan_steps: default_max_plan_steps(),
            tool_timeout_seconds: default_tool_timeout(),
            tools: default_tool_registry(),
            honeyfiles: default_honeyfiles(),
            honeytokens: default_honeytokens(),
            secret_patterns: Vec::new(),
            hmac_secret: default_hmac_secret(),
            dev_mode: false,
        }
    }
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("/srv/warden/workspace")
}

fn default_eviction_root() -> PathBuf {
    PathBuf::from("/srv/warden/evictions")
}

fn default_audit_log_path() -> PathBuf {
    PathBuf::from("/srv/warden/audit.jsonl")
}

fn default_state_db_path() -> PathBuf {
    PathBuf::from("/srv/warden/state.db")
}

const fn default_eviction_threshold() -> usize {
    DEFAULT_EVICTION_THRESHOLD
}

const fn default_rehydration_limit() -> usize {
    DEFAULT_REHYDRATION_LIMIT
}

const fn default_approval_ttl() -> i64 {
    DEFAULT_APPROVAL_TTL_SECS
}

const fn default_max_tries() -> u32 {
    DEFAULT_MAX_TRIES
}

const fn default_max_plan_steps() -> usize {
    DEFAULT_MAX_PLAN_STEPS
}

const fn default_tool_timeout() -> u64 {
    DEFAULT_TOOL_TIMEOUT_SECS
}

fn default_hmac_secret() -> SecretString {
    SecretString::from(DEV_SECRET)
}

/// Baseline tier table; overridable per deployment.
fn default_tool_registry() -> BTreeMap<String, ToolDescriptor> {
    let entry = |tier, kind| ToolDescriptor { tier, kind };
    BTreeMap::from([
        ("read_file".to_string(), entry(RiskLevel::Low, ToolKind::FileRead)),
        ("list_dir".to_string(), entry(RiskLevel::Low, ToolKind::FileRead)),
        ("echo".to_string(), entry(RiskLevel::Low, ToolKind::Other)),
        ("write_file".to_string(), entry(RiskLevel::Medium, ToolKind::FileWrite)),
        ("send_email".to_string(), entry(RiskLevel::High, ToolKind::NetworkSend)),
        ("run_command".to_string(), entry(RiskLevel::High, ToolKind::ProcessExec)),
        (
            "deploy_production".to_string(),
            entry(RiskLevel::Critical, ToolKind::ProcessExec),
        ),
    ])
}

fn default_honeyfiles() -> Vec<String> {
    vec![
        "admin_backup.json".to_string(),
        "prod_db_credentials.yaml".to_string(),
        ".aws/credentials.bak".to_string(),
    ]
}

fn default_honeytokens() -> Vec<String> {
    vec![
        "sk-admin-canary-token-999".to_string(),
        "ghp_fake_github_token_for_trap".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.eviction_threshold, 10_000);
        assert_eq!(config.rehydration_limit, 50_000);
        assert_eq!(config.approval_ttl_seconds, 300);
        assert_eq!(config.max_tries, 3);
        assert!(!config.dev_mode);
        assert_eq!(config.tool("read_file").unwrap().tier, RiskLevel::Low);
        assert_eq!(
            config.tool("deploy_production").unwrap().tier,
            RiskLevel::Critical
        );
        assert!(config.tool("unknown_tool").is_none());
    }

    #[test]
    fn test_minimal_toml() {
        let config: RuntimeConfig = toml::from_str("").unwrap();
        assert_eq!(config.eviction_threshold, DEFAULT_EVICTION_THRESHOLD);
        assert!(!config.honeyfiles.is_empty());
    }

    #[test]
    fn test_toml_overrides() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            workspace_root = "/srv/work"
            eviction_threshold = 2000
            honeytokens = ["trap-1"]
            dev_mode = true

            [tools.my_tool]
            tier = "high"
            kind = "process_exec"
            "#,
        )
        .unwrap();

        assert_eq!(config.workspace_root, PathBuf::from("/srv/work"));
        assert_eq!(config.eviction_threshold, 2000);
        assert_eq!(config.honeytokens, vec!["trap-1".to_string()]);
        assert_eq!(config.tool("my_tool").unwrap().tier, RiskLevel::High);
        // Overriding [tools] replaces the registry wholesale.
        assert!(config.tool("read_file").is_none());
    }

    #[test]
    fn test_validate_rejects_dev_secret_in_prod() {
        let config = RuntimeConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::WeakSecret)));
    }

    #[test]
    fn test_validate_accepts_strong_secret() {
        let config = RuntimeConfig {
            hmac_secret: SecretString::from("a-strong-secret-with-enough-bytes-00"),
            ..RuntimeConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_dev_mode_relaxes_secret() {
        let config = RuntimeConfig {
            dev_mode: true,
            ..RuntimeConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_relative_roots() {
        let config = RuntimeConfig {
            dev_mode: true,
            workspace_root: PathBuf::from("relative/path"),
            ..RuntimeConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RelativeRoot { field: "workspace_root", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let config = RuntimeConfig {
            dev_mode: true,
            eviction_threshold: 60_000,
            rehydration_limit: 50_000,
            ..RuntimeConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ThresholdAboveLimit { .. })
        ));
    }

    #[test]
    fn test_tool_kind_capabilities() {
        assert!(ToolKind::FileWrite.is_write_capable());
        assert!(ToolKind::NetworkSend.is_write_capable());
        assert!(!ToolKind::FileRead.is_write_capable());
        assert!(ToolKind::FileRead.operates_on_paths());
        assert!(ToolKind::FileWrite.operates_on_paths());
        assert!(!ToolKind::NetworkSend.operates_on_paths());
    }

    #[test]
    fn test_for_dev_is_valid() {
        RuntimeConfig::for_dev().validate().unwrap();
    }
}
