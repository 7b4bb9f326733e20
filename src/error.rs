/// Unified error handling for the shardgate router
///
/// This module provides the error taxonomy shared by the partition directory,
/// the connection pool, the operation router and the shard transports.
use std::fmt;
use std::io;

use thiserror::Error;

use crate::core::ShardId;

/// Main error type for router operations
#[derive(Debug, Error)]
pub enum RouterError {
    /// The metadata store could not be reached and no usable snapshot exists
    #[error("Metadata unavailable: {message}")]
    MetadataUnavailable { message: String },

    /// A loaded partition map failed validation
    #[error("Invalid partition map: {message}")]
    InvalidPartitionMap { message: String },

    /// The namespace has no database entry in the partition map
    #[error("Namespace not found: {namespace}")]
    NamespaceNotFound { namespace: String },

    /// Connection to a shard could not be established or broke mid-operation
    #[error("Shard {shard} unreachable: {message}")]
    ShardUnreachable { shard: ShardId, message: String },

    /// Bounded wait exceeded while connecting to or talking with a shard
    #[error("Shard {shard} timed out during {operation}")]
    ShardTimeout { shard: ShardId, operation: String },

    /// Shard was reachable and rejected the write
    #[error("Write rejected by shard {shard}: {details}")]
    ExplicitWriteError { shard: ShardId, details: String },

    /// The outcome of the write cannot be determined
    #[error("Write outcome unknown on shard {shard}")]
    UnknownWriteOutcome { shard: ShardId },

    /// Shard was reachable and rejected a read
    #[error("Shard {shard} returned error: {message}")]
    RemoteError { shard: ShardId, message: String },

    /// The session was closed and can no longer be used
    #[error("Session {session} is closed")]
    SessionClosed { session: String },

    /// No write is being tracked for acknowledgment
    #[error("No write pending acknowledgment")]
    NoPendingWrite,

    /// Document cannot be routed
    #[error("Invalid document: {message}")]
    InvalidDocument { message: String },

    /// Frame codec errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for router operations
pub type RouterResult<T> = Result<T, RouterError>;

/// Convenience methods for creating specific error types
impl RouterError {
    pub fn metadata_unavailable<S: Into<String>>(message: S) -> Self {
        RouterError::MetadataUnavailable {
            message: message.into(),
        }
    }

    pub fn invalid_partition_map<S: Into<String>>(message: S) -> Self {
        RouterError::InvalidPartitionMap {
            message: message.into(),
        }
    }

    pub fn namespace_not_found<S: Into<String>>(namespace: S) -> Self {
        RouterError::NamespaceNotFound {
            namespace: namespace.into(),
        }
    }

    pub fn shard_unreachable<S: Into<String>>(shard: &ShardId, message: S) -> Self {
        RouterError::ShardUnreachable {
            shard: shard.clone(),
            message: message.into(),
        }
    }

    pub fn shard_timeout<S: Into<String>>(shard: &ShardId, operation: S) -> Self {
        RouterError::ShardTimeout {
            shard: shard.clone(),
            operation: operation.into(),
        }
    }

    pub fn invalid_document<S: Into<String>>(message: S) -> Self {
        RouterError::InvalidDocument {
            message: message.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        RouterError::Protocol(message.into())
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        RouterError::Internal {
            message: message.into(),
        }
    }

    /// The shard this error is attributed to, if any
    pub fn shard(&self) -> Option<&ShardId> {
        match self {
            RouterError::ShardUnreachable { shard, .. }
            | RouterError::ShardTimeout { shard, .. }
            | RouterError::ExplicitWriteError { shard, .. }
            | RouterError::UnknownWriteOutcome { shard }
            | RouterError::RemoteError { shard, .. } => Some(shard),
            _ => None,
        }
    }

    /// Check if this error is recoverable (a later attempt may succeed).
    ///
    /// `UnknownWriteOutcome` is not: repeating the write may apply it twice.
    pub fn is_recoverable(&self) -> bool {
        match self {
            RouterError::Network(_) => true,
            RouterError::MetadataUnavailable { .. } => true,
            RouterError::ShardUnreachable { .. } => true,
            RouterError::ShardTimeout { .. } => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RouterError::Config(_) => ErrorSeverity::Critical,
            RouterError::Internal { .. } => ErrorSeverity::Critical,
            RouterError::InvalidPartitionMap { .. } => ErrorSeverity::Critical,
            RouterError::Network(_) => ErrorSeverity::Warning,
            RouterError::ShardUnreachable { .. } => ErrorSeverity::Warning,
            RouterError::ShardTimeout { .. } => ErrorSeverity::Warning,
            RouterError::MetadataUnavailable { .. } => ErrorSeverity::Warning,
            RouterError::NoPendingWrite => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let shard = ShardId::new("shard0001");
        let error = RouterError::shard_unreachable(&shard, "connection refused");
        assert!(matches!(error, RouterError::ShardUnreachable { .. }));
        assert_eq!(
            error.to_string(),
            "Shard shard0001 unreachable: connection refused"
        );
        assert_eq!(error.shard(), Some(&shard));
    }

    #[test]
    fn test_error_severity() {
        let config_error = RouterError::Config(ConfigError::ValidationError("test".to_string()));
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);

        let network_error =
            RouterError::Network(io::Error::new(io::ErrorKind::ConnectionRefused, "test"));
        assert_eq!(network_error.severity(), ErrorSeverity::Warning);
        assert_eq!(RouterError::NoPendingWrite.severity(), ErrorSeverity::Info);
    }

    #[test]
    fn test_error_recoverability() {
        let shard = ShardId::new("shard0000");
        assert!(RouterError::shard_timeout(&shard, "connect").is_recoverable());
        assert!(RouterError::metadata_unavailable("down").is_recoverable());

        let unknown = RouterError::UnknownWriteOutcome { shard };
        assert!(!unknown.is_recoverable());

        let config_error = RouterError::Config(ConfigError::ValidationError("test".to_string()));
        assert!(!config_error.is_recoverable());
    }

    #[test]
    fn test_shard_attribution() {
        assert!(RouterError::NoPendingWrite.shard().is_none());
        assert!(RouterError::namespace_not_found("a.b").shard().is_none());
    }
}
