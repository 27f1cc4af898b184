//! Error types for neo4j-connect
//!
//! Provides structured error handling for both the connector runtime and the
//! per-record translation layer.

use crate::pattern::PatternError;
use std::fmt;
use thiserror::Error;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, ConnectError>;

/// Result type alias for per-record translation
pub type SinkResult<T> = std::result::Result<T, SinkError>;

/// Main error type for the connector runtime
#[derive(Error, Debug)]
pub enum ConnectError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Pattern DSL error surfaced at configuration time
    #[error(transparent)]
    Pattern(#[from] PatternError),

    /// Parameter conversion error (record value cannot be expressed as a
    /// driver value)
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Broker interaction error
    #[error("broker error: {0}")]
    Broker(String),

    /// Transient driver failure that survived every retry attempt
    #[error("transient driver error after {attempts} attempts: {message}")]
    TransientDriver { message: String, attempts: u32 },

    /// Permanent driver failure (constraint violation, syntax, type mismatch)
    #[error("permanent driver error: {0}")]
    PermanentDriver(String),

    /// Publishing to the dead-letter topic failed
    #[error("dead letter publish failed: {0}")]
    DeadLetterPublishFailed(String),

    /// Shutdown requested
    #[error("shutdown requested")]
    Shutdown,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Per-record translation error escalated by the `fail` policy
    #[error(transparent)]
    Record(#[from] SinkError),
}

impl ConnectError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a broker error
    pub fn broker(msg: impl Into<String>) -> Self {
        Self::Broker(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientDriver { .. } | Self::Broker(_))
    }

    /// Check if this is a shutdown error
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

/// Errors raised while translating a single record into query events
///
/// These are routed through the configured error tolerance policy instead of
/// failing the whole batch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// No handler is mapped for the record's topic
    #[error("no strategy mapped for topic '{0}'")]
    UnmappedTopic(String),

    /// The record payload does not match the shape the strategy expects
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// The strategy demands a constraint the event does not carry
    #[error("missing constraint: {0}")]
    MissingConstraint(String),
}

impl SinkError {
    /// Create a malformed record error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedRecord(msg.into())
    }

    /// Stable identifier for logs and dead-letter headers
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnmappedTopic(_) => "unmapped_topic",
            Self::MalformedRecord(_) => "malformed_record",
            Self::MissingConstraint(_) => "missing_constraint",
        }
    }
}

/// Connector status for health reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorStatus {
    /// Starting up
    Starting,
    /// Running normally
    Running,
    /// Temporarily unhealthy (reconnecting, retrying)
    Unhealthy,
    /// Stopped
    Stopped,
    /// Failed permanently
    Failed,
}

impl fmt::Display for ConnectorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SinkError::UnmappedTopic("orders".to_string());
        assert_eq!(err.to_string(), "no strategy mapped for topic 'orders'");
    }

    #[test]
    fn test_retryable_check() {
        assert!(ConnectError::broker("timeout").is_retryable());
        assert!(ConnectError::TransientDriver {
            message: "deadlock".to_string(),
            attempts: 3,
        }
        .is_retryable());
        assert!(!ConnectError::config("bad config").is_retryable());
        assert!(!ConnectError::PermanentDriver("syntax".to_string()).is_retryable());
    }

    #[test]
    fn test_shutdown_check() {
        assert!(ConnectError::Shutdown.is_shutdown());
        assert!(!ConnectError::broker("test").is_shutdown());
    }

    #[test]
    fn test_sink_error_kind() {
        assert_eq!(SinkError::malformed("x").kind(), "malformed_record");
        assert_eq!(
            SinkError::MissingConstraint("x".to_string()).kind(),
            "missing_constraint"
        );
    }
}
