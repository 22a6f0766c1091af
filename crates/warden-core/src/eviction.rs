//! Content-addressed overflow store for oversized tool outputs.
//!
//! When a tool output exceeds the eviction threshold, the interpreter
//! replaces it in graph state with a pointer into this store. Files are
//! written once under `<root>/<thread_id>/<hash>.bin` where `hash` is the
//! first 16 hex characters of the content's SHA-256 — identical content
//! dedupes to the same file, and no two writers ever target the same
//! filename with different bytes.
//!
//! # Security
//!
//! Every resolved path is normalized and verified to remain under the
//! store root (and, for saves, under the thread's own directory); anything
//! else fails with [`EvictionError::PathEscape`]. Thread ids are restricted
//! to a url-safe alphabet before they touch the filesystem.
//!
//! Writes go through a temp file in the target directory followed by an
//! atomic rename, so readers never observe partial content.

use std::fs;
use std::io::Write as _;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::canonical::sha256_hex;

/// Hex characters of the content hash used in filenames.
const POINTER_HASH_LEN: usize = 16;

/// Errors from eviction store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EvictionError {
    /// A resolved path escaped the store sandbox.
    #[error("path escapes eviction store root: {}", path.display())]
    PathEscape {
        /// The offending path.
        path: PathBuf,
    },

    /// The thread id contains characters outside the url-safe alphabet.
    #[error("invalid thread id: {thread_id:?}")]
    InvalidThreadId {
        /// The rejected thread id.
        thread_id: String,
    },

    /// No content exists at the given pointer.
    #[error("no evicted content at {pointer}")]
    NotFound {
        /// The pointer that missed.
        pointer: String,
    },

    /// An I/O error occurred.
    #[error("eviction store I/O error during {context}: {source}")]
    Io {
        /// Description of the failed operation.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl EvictionError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Content-addressed file store rooted at a single directory.
#[derive(Debug, Clone)]
pub struct EvictionStore {
    root: PathBuf,
}

impl EvictionStore {
    /// Creates a store rooted at `root`. The directory is created lazily on
    /// first save.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Saves `content` for `thread_id`, returning the pointer (the absolute
    /// path of the stored file).
    ///
    /// Identical content for the same thread returns the same pointer
    /// without rewriting.
    ///
    /// # Errors
    ///
    /// - [`EvictionError::InvalidThreadId`] for ids outside `[A-Za-z0-9_-]`
    /// - [`EvictionError::PathEscape`] if the resolved path leaves the
    ///   thread's directory
    /// - [`EvictionError::Io`] on filesystem failure
    pub fn save(&self, thread_id: &str, content: &str) -> Result<String, EvictionError> {
        validate_thread_id(thread_id)?;

        let thread_dir = normalize(&self.root.join(thread_id));
        let hash = sha256_hex(content);
        let path = normalize(&thread_dir.join(format!("{}.bin", &hash[..POINTER_HASH_LEN])));

        if !path.starts_with(&thread_dir) {
            return Err(EvictionError::PathEscape { path });
        }

        if path.exists() {
            // Content-addressed: same hash, same bytes.
            return Ok(path.display().to_string());
        }

        fs::create_dir_all(&thread_dir)
            .map_err(|e| EvictionError::io("create thread directory", e))?;

        // Temp file + rename keeps the write atomic within the directory.
        let mut tmp = tempfile::NamedTempFile::new_in(&thread_dir)
            .map_err(|e| EvictionError::io("create temp file", e))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| EvictionError::io("write content", e))?;
        tmp.flush().map_err(|e| EvictionError::io("flush content", e))?;
        tmp.persist(&path)
            .map_err(|e| EvictionError::io("persist content", e.error))?;

        Ok(path.display().to_string())
    }

    /// Loads the content at `pointer`.
    ///
    /// # Errors
    ///
    /// - [`EvictionError::PathEscape`] if the pointer resolves outside the
    ///   store root
    /// - [`EvictionError::NotFound`] if nothing is stored there
    /// - [`EvictionError::Io`] on filesystem failure
    pub fn load(&self, pointer: &str) -> Result<String, EvictionError> {
        let path = normalize(Path::new(pointer));
        let root = normalize(&self.root);
        if !path.starts_with(&root) {
            return Err(EvictionError::PathEscape { path });
        }

        match fs::read_to_string(&path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(EvictionError::NotFound {
                pointer: pointer.to_string(),
            }),
            Err(e) => Err(EvictionError::io("read content", e)),
        }
    }

    /// Removes all evicted content for `thread_id`.
    ///
    /// Part of administrative thread deletion; eviction files otherwise
    /// persist for the life of the thread.
    ///
    /// # Errors
    ///
    /// Returns [`EvictionError`] on invalid thread id or filesystem failure.
    /// A missing directory is not an error.
    pub fn remove_thread(&self, thread_id: &str) -> Result<(), EvictionError> {
        validate_thread_id(thread_id)?;
        let thread_dir = normalize(&self.root.join(thread_id));
        match fs::remove_dir_all(&thread_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EvictionError::io("remove thread directory", e)),
        }
    }
}

fn validate_thread_id(thread_id: &str) -> Result<(), EvictionError> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("valid regex"));
    if re.is_match(thread_id) {
        Ok(())
    } else {
        Err(EvictionError::InvalidThreadId {
            thread_id: thread_id.to_string(),
        })
    }
}

/// Lexically normalizes a path: `.` components drop, `..` pops, and popping
/// past the start is preserved so a later prefix check fails.
///
/// Deliberately does not hit the filesystem — eviction paths may not exist
/// yet and the check must be deterministic.
fn normalize(path: &Path) -> PathBuf {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, EvictionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = EvictionStore::new(dir.path().join("evictions"));
        (dir, store)
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let (_dir, store) = store();
        let content = "x".repeat(20_000);
        let pointer = store.save("thread-1", &content).unwrap();
        assert!(pointer.ends_with(".bin"));
        assert!(pointer.contains("thread-1"));

        let loaded = store.load(&pointer).unwrap();
        assert_eq!(loaded, content);
    }

    #[test]
    fn test_identical_content_dedupes() {
        let (_dir, store) = store();
        let p1 = store.save("thread-1", "same content").unwrap();
        let p2 = store.save("thread-1", "same content").unwrap();
        assert_eq!(p1, p2);
    }

    #[test]
    fn test_different_content_different_pointer() {
        let (_dir, store) = store();
        let p1 = store.save("thread-1", "content a").unwrap();
        let p2 = store.save("thread-1", "content b").unwrap();
        assert_ne!(p1, p2);
    }

    #[test]
    fn test_pointer_is_content_hash() {
        let (_dir, store) = store();
        let pointer = store.save("thread-1", "hello").unwrap();
        let expected = &sha256_hex("hello")[..POINTER_HASH_LEN];
        assert!(pointer.contains(expected));
    }

    #[test]
    fn test_invalid_thread_id_rejected() {
        let (_dir, store) = store();
        for bad in ["../escape", "a/b", "", "thread 1", "x".repeat(129).as_str()] {
            assert!(matches!(
                store.save(bad, "content"),
                Err(EvictionError::InvalidThreadId { .. })
            ));
        }
    }

    #[test]
    fn test_load_outside_root_rejected() {
        let (_dir, store) = store();
        store.save("thread-1", "content").unwrap();
        let result = store.load("/etc/passwd");
        assert!(matches!(result, Err(EvictionError::PathEscape { .. })));
    }

    #[test]
    fn test_load_traversal_rejected() {
        let (_dir, store) = store();
        let pointer = store.save("thread-1", "content").unwrap();
        let sneaky = format!("{pointer}/../../../../etc/passwd");
        let result = store.load(&sneaky);
        assert!(matches!(result, Err(EvictionError::PathEscape { .. })));
    }

    #[test]
    fn test_load_missing_pointer() {
        let (_dir, store) = store();
        let missing = store.root().join("thread-1/0000000000000000.bin");
        let result = store.load(&missing.display().to_string());
        assert!(matches!(result, Err(EvictionError::NotFound { .. })));
    }

    #[test]
    fn test_remove_thread() {
        let (_dir, store) = store();
        let pointer = store.save("thread-1", "content").unwrap();
        store.remove_thread("thread-1").unwrap();
        assert!(matches!(
            store.load(&pointer),
            Err(EvictionError::NotFound { .. })
        ));

        // Removing again is not an error.
        store.remove_thread("thread-1").unwrap();
    }

    #[test]
    fn test_threads_are_isolated() {
        let (_dir, store) = store();
        let p1 = store.save("thread-1", "shared").unwrap();
        let p2 = store.save("thread-2", "shared").unwrap();
        assert_ne!(p1, p2);

        store.remove_thread("thread-1").unwrap();
        assert!(store.load(&p2).is_ok());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/b/../c")), PathBuf::from("/a/c"));
        assert_eq!(normalize(Path::new("/a/./b")), PathBuf::from("/a/b"));
        assert_eq!(normalize(Path::new("/a/b/c/../../..")), PathBuf::from("/"));
    }
}
