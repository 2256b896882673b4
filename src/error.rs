use std::fmt;

use thiserror::Error;

/// The error taxonomy every public component contract returns at its boundary.
///
/// Internal code is free to propagate with `anyhow` the way the rest of this
/// crate does; conversion into one of these kinds happens only where a
/// component hands a result back across its public contract.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("io error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("corrupt state: {message}")]
    CorruptState { message: String },

    #[error("transient remote error: {message}")]
    TransientRemote { message: String },

    #[error("conflict at {path}")]
    Conflict { path: String },

    #[error("security violation: {message}")]
    SecurityViolation { message: String },

    #[error("queue full: {queue}")]
    QueueFull { queue: String },

    #[error("fatal: {message}")]
    Fatal { message: String },
}

impl EngineError {
    pub fn io(err: std::io::Error) -> Self {
        EngineError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }

    pub fn io_msg(message: impl Into<String>) -> Self {
        EngineError::Io {
            message: message.into(),
            source: None,
        }
    }

    pub fn corrupt_state(message: impl Into<String>) -> Self {
        EngineError::CorruptState {
            message: message.into(),
        }
    }

    pub fn transient_remote(message: impl Into<String>) -> Self {
        EngineError::TransientRemote {
            message: message.into(),
        }
    }

    pub fn security_violation(message: impl Into<String>) -> Self {
        EngineError::SecurityViolation {
            message: message.into(),
        }
    }

    pub fn queue_full(queue: impl Into<String>) -> Self {
        EngineError::QueueFull {
            queue: queue.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        EngineError::Fatal {
            message: message.into(),
        }
    }

    /// `true` for kinds that the sync engine's worker pool should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransientRemote { .. } | EngineError::QueueFull { .. })
    }

    /// Strip any substring of `root` out of the message, matching the
    /// PathSecurity collaborator's `sanitize_error_for_user` contract.
    pub fn sanitized(self, root: &std::path::Path) -> Self {
        let root_str = root.to_string_lossy();
        if root_str.is_empty() {
            return self;
        }
        let scrub = |m: String| m.replace(root_str.as_ref(), "<root>");
        match self {
            EngineError::Io { message, source } => EngineError::Io {
                message: scrub(message),
                source,
            },
            EngineError::CorruptState { message } => EngineError::CorruptState {
                message: scrub(message),
            },
            EngineError::TransientRemote { message } => EngineError::TransientRemote {
                message: scrub(message),
            },
            EngineError::SecurityViolation { message } => EngineError::SecurityViolation {
                message: scrub(message),
            },
            EngineError::QueueFull { queue } => EngineError::QueueFull { queue: scrub(queue) },
            EngineError::Fatal { message } => EngineError::Fatal {
                message: scrub(message),
            },
            other @ EngineError::Conflict { .. } => other,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::io(err)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::corrupt_state(err.to_string())
    }
}

/// Shorthand result alias used throughout the public component contracts.
pub type EngineResult<T> = Result<T, EngineError>;

/// A kind-only projection of [`EngineError`], useful for stats and for
/// matching in tests without constructing a full error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    CorruptState,
    TransientRemote,
    Conflict,
    SecurityViolation,
    QueueFull,
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Io => "io",
            ErrorKind::CorruptState => "corrupt_state",
            ErrorKind::TransientRemote => "transient_remote",
            ErrorKind::Conflict => "conflict",
            ErrorKind::SecurityViolation => "security_violation",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Io { .. } => ErrorKind::Io,
            EngineError::CorruptState { .. } => ErrorKind::CorruptState,
            EngineError::TransientRemote { .. } => ErrorKind::TransientRemote,
            EngineError::Conflict { .. } => ErrorKind::Conflict,
            EngineError::SecurityViolation { .. } => ErrorKind::SecurityViolation,
            EngineError::QueueFull { .. } => ErrorKind::QueueFull,
            EngineError::Fatal { .. } => ErrorKind::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_root_substring() {
        let root = std::path::Path::new("/home/alice/secret-root");
        let err = EngineError::security_violation("path /home/alice/secret-root/../etc escapes root");
        let sanitized = err.sanitized(root);
        match sanitized {
            EngineError::SecurityViolation { message } => {
                assert!(!message.contains("/home/alice/secret-root"));
                assert!(message.contains("<root>"));
            }
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn transient_remote_is_retryable() {
        assert!(EngineError::transient_remote("timeout").is_retryable());
        assert!(!EngineError::fatal("boom").is_retryable());
    }
}
