//! Error types for chatlane.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Channel-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send response on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),
}

/// Failure of a single worker run.
///
/// The supervisor decides between retry and abandonment with
/// [`WorkerError::is_retryable`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("worker failed to start: {reason}")]
    Start { reason: String },

    #[error("worker failed: {reason}")]
    Runtime { reason: String },

    #[error("worker produced no result within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("worker rejected the request: {reason}")]
    Terminal { reason: String },

    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<WorkerError>,
    },

    #[error("worker terminated during shutdown")]
    Cancelled,
}

impl WorkerError {
    /// Start failures, crashes and timeouts are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Start { .. } | Self::Runtime { .. } | Self::Timeout { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Which counter a release was aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseScope {
    Lane,
    Global,
}

impl std::fmt::Display for ReleaseScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReleaseScope::Lane => write!(f, "lane"),
            ReleaseScope::Global => write!(f, "global"),
        }
    }
}

/// Scheduler invariant violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("double release of {scope} slot (group {group_id:?})")]
    DoubleRelease {
        scope: ReleaseScope,
        group_id: Option<String>,
    },

    #[error("queue is shutting down")]
    ShuttingDown,
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(WorkerError::Start { reason: "spawn".into() }.is_retryable());
        assert!(WorkerError::Runtime { reason: "crash".into() }.is_retryable());
        assert!(
            WorkerError::Timeout {
                timeout: Duration::from_secs(1)
            }
            .is_retryable()
        );
        assert!(!WorkerError::Terminal { reason: "bad input".into() }.is_retryable());
        assert!(!WorkerError::Cancelled.is_retryable());
        assert!(
            !WorkerError::RetriesExhausted {
                attempts: 4,
                last: Box::new(WorkerError::Runtime { reason: "x".into() }),
            }
            .is_retryable()
        );
    }

    #[test]
    fn double_release_message_names_scope() {
        let err = QueueError::DoubleRelease {
            scope: ReleaseScope::Global,
            group_id: None,
        };
        assert!(err.to_string().contains("global"));
    }
}
