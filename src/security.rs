//! Path and session-id validation, per §6's PathSecurity collaborator.
//!
//! This is exposed as a capability trait so tests (and, later, embedders)
//! can swap in a stricter or looser implementation without the rest of the
//! crate caring which one is wired up.

use std::path::{Component, Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{EngineError, EngineResult};

static SESSION_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]{1,100}$").unwrap());

pub trait PathSecurity: Send + Sync {
    /// Fails if `path` (after lexical `..` resolution) would resolve outside `root`.
    fn validate_path_in_bounds(&self, path: &Path, root: &Path) -> EngineResult<PathBuf>;

    fn validate_session_id(&self, id: &str) -> EngineResult<()>;

    /// Strip any substring beginning with `root` from `message`.
    fn sanitize_error_for_user(&self, message: &str, root: &Path) -> String;
}

/// Default implementation: lexical `..`/absolute-segment resolution (no
/// symlink expansion is attempted here, since the session roots in this
/// crate's test and reference usage are ordinary directories — an embedder
/// wrapping a filesystem with untrusted symlinks should supply its own
/// `PathSecurity` that also canonicalizes).
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPathSecurity;

impl PathSecurity for DefaultPathSecurity {
    fn validate_path_in_bounds(&self, path: &Path, root: &Path) -> EngineResult<PathBuf> {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        };
        let cleaned = clean_lexical(&joined);
        let clean_root = clean_lexical(root);
        if !cleaned.starts_with(&clean_root) {
            return Err(EngineError::security_violation(format!(
                "path {} escapes root {}",
                path.display(),
                root.display()
            )));
        }
        Ok(cleaned)
    }

    fn validate_session_id(&self, id: &str) -> EngineResult<()> {
        if SESSION_ID_RE.is_match(id) {
            Ok(())
        } else {
            Err(EngineError::security_violation(format!(
                "invalid session id: {id:?}"
            )))
        }
    }

    fn sanitize_error_for_user(&self, message: &str, root: &Path) -> String {
        let root_str = root.to_string_lossy();
        if root_str.is_empty() {
            return message.to_string();
        }
        message.replace(root_str.as_ref(), "<root>")
    }
}

/// Lexically collapse `.`/`..`/repeated separators without touching the
/// filesystem (no symlink resolution, no existence check).
fn clean_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// `true` iff `id` satisfies the session-id character class and length
/// invariant from §3 ("non-empty, ≤100 chars, path-safe character class").
pub fn is_valid_session_id(id: &str) -> bool {
    SESSION_ID_RE.is_match(id)
}

/// Resolve a session id to the JSON state file it owns, falling back to a
/// sentinel path for ids that fail validation so a malicious id can never
/// compute a path containing `..` or an absolute segment.
pub fn state_file_for_session(store_root: &Path, session_id: &str) -> PathBuf {
    if is_valid_session_id(session_id) {
        store_root.join(format!("{session_id}.json"))
    } else {
        store_root.join("invalid.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_session_id_with_dotdot() {
        assert!(!is_valid_session_id(".."));
        assert!(!is_valid_session_id("a/../b"));
        assert!(!is_valid_session_id(""));
    }

    #[test]
    fn accepts_plain_session_id() {
        assert!(is_valid_session_id("session-abc_123"));
    }

    #[test]
    fn rejects_session_id_over_100_chars() {
        let id = "a".repeat(101);
        assert!(!is_valid_session_id(&id));
    }

    #[test]
    fn invalid_session_id_resolves_to_sentinel() {
        let root = Path::new("/tmp/store");
        let path = state_file_for_session(root, "../../etc/passwd");
        assert_eq!(path, root.join("invalid.json"));
    }

    #[test]
    fn path_in_bounds_rejects_escape() {
        let sec = DefaultPathSecurity;
        let root = Path::new("/tmp/root");
        let err = sec
            .validate_path_in_bounds(Path::new("../escape.txt"), root)
            .unwrap_err();
        assert!(matches!(err, EngineError::SecurityViolation { .. }));
    }

    #[test]
    fn path_in_bounds_accepts_nested_path() {
        let sec = DefaultPathSecurity;
        let root = Path::new("/tmp/root");
        let resolved = sec.validate_path_in_bounds(Path::new("a/b.txt"), root).unwrap();
        assert_eq!(resolved, PathBuf::from("/tmp/root/a/b.txt"));
    }

    #[test]
    fn sanitize_strips_root_substring() {
        let sec = DefaultPathSecurity;
        let root = Path::new("/home/alice/root");
        let msg = sec.sanitize_error_for_user("open /home/alice/root/secret.txt failed", root);
        assert!(!msg.contains("/home/alice/root"));
    }
}
