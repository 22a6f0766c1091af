//! Dev-mode collaborators.
//!
//! In production the planner and executor oracles are the remote reasoning
//! core and the tool invoker is the tool substrate; all three arrive via
//! configuration of the ingress collaborator. Dev mode substitutes small
//! deterministic implementations so the daemon can be exercised end to end
//! from a terminal:
//!
//! - [`LinePlanner`] turns each non-empty line of the user message into one
//!   plan step.
//! - [`KeywordExecutor`] maps a step like `read notes.txt` onto a concrete
//!   tool proposal.
//! - [`FsToolHost`] executes `read_file`, `write_file`, `list_dir`, and
//!   `echo`, sandboxed to the workspace root.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde_json::{Map, Value, json};
use tracing::debug;

use warden_core::oracle::{
    ExecutorOracle, OracleError, PlannerOracle, ToolError, ToolInvoker, ToolOutcome, ToolProposal,
};
use warden_core::state::GraphState;

/// One plan step per non-empty line of the latest user message.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinePlanner;

impl PlannerOracle for LinePlanner {
    fn propose_steps(&self, state: &GraphState) -> Result<Vec<String>, OracleError> {
        let message = state
            .last_user_message()
            .ok_or_else(|| OracleError::Unavailable("no user message to plan from".to_string()))?;
        let steps: Vec<String> = message
            .content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect();
        if steps.is_empty() {
            return Err(OracleError::Malformed("message had no content".to_string()));
        }
        Ok(steps)
    }
}

/// Maps the current plan step onto a tool proposal by leading keyword:
/// `read <path>`, `write <path> <content...>`, `list <dir>`, `run <cmd...>`,
/// `email <to> <body...>`; anything else becomes `echo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordExecutor;

impl ExecutorOracle for KeywordExecutor {
    fn propose_tool(&self, state: &GraphState) -> Result<ToolProposal, OracleError> {
        let step = state
            .plan
            .get(state.current_step)
            .ok_or_else(|| OracleError::Malformed("no current step".to_string()))?;

        let (keyword, rest) = step.split_once(' ').unwrap_or((step.as_str(), ""));
        let proposal = match keyword {
            "read" => ToolProposal {
                name: "read_file".to_string(),
                args: object(json!({ "path": rest.trim() })),
            },
            "list" => ToolProposal {
                name: "list_dir".to_string(),
                args: object(json!({ "path": rest.trim() })),
            },
            "write" => {
                let (path, content) = rest.trim().split_once(' ').unwrap_or((rest.trim(), ""));
                ToolProposal {
                    name: "write_file".to_string(),
                    args: object(json!({ "path": path, "content": content })),
                }
            },
            "run" => ToolProposal {
                name: "run_command".to_string(),
                args: object(json!({ "command": rest.trim() })),
            },
            "email" => {
                let (to, body) = rest.trim().split_once(' ').unwrap_or((rest.trim(), ""));
                ToolProposal {
                    name: "send_email".to_string(),
                    args: object(json!({ "to": to, "body": body })),
                }
            },
            _ => ToolProposal {
                name: "echo".to_string(),
                args: object(json!({ "text": step })),
            },
        };
        Ok(proposal)
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Filesystem tool host sandboxed to a workspace root.
///
/// Defense in depth: the risk gate already rejects escaping paths, but the
/// host re-checks containment at execution time (and, because files exist
/// here, through symlinks as well).
#[derive(Debug, Clone)]
pub struct FsToolHost {
    workspace_root: PathBuf,
}

impl FsToolHost {
    /// Creates a host rooted at `workspace_root`, creating the directory if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::Execution`] if the root cannot be created.
    pub fn new(workspace_root: impl Into<PathBuf>) -> Result<Self, ToolError> {
        let workspace_root = workspace_root.into();
        fs::create_dir_all(&workspace_root)
            .map_err(|e| ToolError::Execution(format!("cannot create workspace root: {e}")))?;
        Ok(Self { workspace_root })
    }

    /// Resolves `path` inside the workspace, refusing escapes.
    fn resolve(&self, path: &str) -> Result<PathBuf, ToolError> {
        let candidate = Path::new(path);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.workspace_root.join(candidate)
        };
        let resolved = lexical_normalize(&joined);
        let root = lexical_normalize(&self.workspace_root);
        if !resolved.starts_with(&root) {
            return Err(ToolError::Execution(format!(
                "path {path:?} escapes the workspace"
            )));
        }

        // Canonicalize the nearest existing ancestor to catch symlink
        // escapes on files that exist.
        if let Ok(canonical) = resolved.canonicalize() {
            let canonical_root = root.canonicalize().unwrap_or(root);
            if !canonical.starts_with(&canonical_root) {
                return Err(ToolError::Execution(format!(
                    "path {path:?} escapes the workspace via symlink"
                )));
            }
            return Ok(canonical);
        }
        Ok(resolved)
    }

    fn arg<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str, ToolError> {
        args.get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::Execution(format!("missing string argument '{key}'")))
    }

    fn read_file(&self, args: &Map<String, Value>) -> Result<ToolOutcome, ToolError> {
        let path = self.resolve(Self::arg(args, "path")?)?;
        debug!(path = %path.display(), "dev host: read_file");
        match fs::read_to_string(&path) {
            Ok(content) => Ok(ToolOutcome::success(content)),
            Err(e) => Ok(ToolOutcome::failed(map_io_error("read", &e))),
        }
    }

    fn write_file(&self, args: &Map<String, Value>) -> Result<ToolOutcome, ToolError> {
        let path = self.resolve(Self::arg(args, "path")?)?;
        let content = Self::arg(args, "content")?;
        debug!(path = %path.display(), bytes = content.len(), "dev host: write_file");
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                return Ok(ToolOutcome::failed(map_io_error("write", &e)));
            }
        }
        match fs::write(&path, content) {
            Ok(()) => Ok(ToolOutcome::success(format!(
                "wrote {} bytes to {}",
                content.len(),
                path.display()
            ))),
            Err(e) => Ok(ToolOutcome::failed(map_io_error("write", &e))),
        }
    }

    fn list_dir(&self, args: &Map<String, Value>) -> Result<ToolOutcome, ToolError> {
        let path = self.resolve(Self::arg(args, "path").unwrap_or("."))?;
        debug!(path = %path.display(), "dev host: list_dir");
        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(e) => return Ok(ToolOutcome::failed(map_io_error("list", &e))),
        };
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(ToolOutcome::success(names.join("\n")))
    }
}

impl ToolInvoker for FsToolHost {
    fn invoke(&self, name: &str, args: &Map<String, Value>) -> Result<ToolOutcome, ToolError> {
        match name {
            "read_file" => self.read_file(args),
            "write_file" => self.write_file(args),
            "list_dir" => self.list_dir(args),
            "echo" => Ok(ToolOutcome::success(
                args.get("text").and_then(Value::as_str).unwrap_or_default(),
            )),
            other => Err(ToolError::UnknownTool {
                name: other.to_string(),
            }),
        }
    }
}

fn map_io_error(op: &str, err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => format!("{op} failed: file not found"),
        io::ErrorKind::PermissionDenied => format!("{op} failed: permission denied"),
        _ => format!("{op} failed: {err}"),
    }
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {},
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component.as_os_str());
                }
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}
