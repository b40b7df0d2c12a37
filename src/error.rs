//! Error types for each boundary of the core.
//!
//! Every runtime failure degrades to "skip and retry later"; only [`ConfigError`] is meant to stop
//! a process, and only while it is starting up.
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::rate_limit::EventKind;

/// Failure of an external collaborator: item fetch, destination lookup, or notification dispatch.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The remote could not be reached or the request timed out.
    #[error("transport error: {0}")]
    Transport(String),
    /// The remote answered with a non-success status.
    #[error("unexpected status {status} from {endpoint}")]
    Status { endpoint: String, status: u16 },
    /// The remote answered but the body could not be understood.
    #[error("malformed response from {endpoint}: {reason}")]
    Malformed { endpoint: String, reason: String },
    /// Notification channel rejected the message.
    #[error("dispatch rejected: {0}")]
    Rejected(String),
}

impl SourceError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    /// Worth retrying within the same request (connect errors, 429, 5xx).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status == 429 || (500..600).contains(status),
            Self::Malformed { .. } | Self::Rejected(_) => false,
        }
    }
}

/// Durable snapshot write failure. Logged and superseded by the next successful persist.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PersistError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

/// Snapshot could not be read at startup. Never fatal: the store falls back to empty state.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt snapshot at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Invalid configuration detected while building runtime types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no rate policy configured for event kind `{0}`")]
    MissingPolicy(EventKind),
    #[error("rate policy for `{kind}`: {reason}")]
    InvalidPolicy { kind: EventKind, reason: String },
    #[error("invalid poll backoff: {0}")]
    Backoff(#[from] crate::backoff::BackoffError),
    #[error("poll tick must be greater than zero")]
    ZeroTick,
    #[error("dispatchable status set is empty")]
    NoDispatchableStatus,
    #[error("deferred worker pool needs at least one worker")]
    ZeroWorkers,
    #[error("duplicate window must be greater than zero (got {0:?})")]
    ZeroDuplicateWindow(Duration),
    #[error("failed to read settings from {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        let status = |status| SourceError::Status { endpoint: "items".into(), status };
        assert!(status(429).is_retryable());
        assert!(status(503).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(SourceError::transport("reset").is_retryable());
        assert!(!SourceError::Rejected("blocked".into()).is_retryable());
    }

    #[test]
    fn config_error_names_the_kind() {
        let msg = ConfigError::MissingPolicy(EventKind::Action).to_string();
        assert!(msg.contains("action"));
    }
}
