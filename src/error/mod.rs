//! Error types for tycho.

use thiserror::Error;

/// Primary error type for all proxy operations.
#[derive(Error, Debug)]
pub enum TychoError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error for backend '{backend}': {message}")]
    Connection { backend: String, message: String },

    #[error("Routing error: no backend resolves '{0}'")]
    Routing(String),

    #[error("Namespace conflict: '{0}' is published by more than one entry")]
    NamespaceConflict(String),

    #[error("Cleanup error for backend '{backend}': {message}")]
    Cleanup { backend: String, message: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl TychoError {
    /// Create a connection error for a named backend.
    pub fn connection(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a cleanup error for a named backend.
    pub fn cleanup(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Cleanup {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the failed operation could plausibly succeed.
    ///
    /// Configuration and routing problems are permanent until the inputs
    /// change; transport-level failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Io(_) | Self::Timeout(_)
        )
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, TychoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_retryable() {
        assert!(TychoError::connection("search", "pipe closed").is_retryable());
        assert!(TychoError::Timeout(5000).is_retryable());
    }

    #[test]
    fn configuration_and_routing_errors_are_not_retryable() {
        assert!(!TychoError::Configuration("stdio transport requires a command".into())
            .is_retryable());
        assert!(!TychoError::Routing("weather".into()).is_retryable());
        assert!(!TychoError::NamespaceConflict("a:search".into()).is_retryable());
    }

    #[test]
    fn messages_name_the_backend() {
        let err = TychoError::cleanup("files", "broken pipe");
        assert!(err.to_string().contains("files"));
        assert!(err.to_string().contains("broken pipe"));
    }
}
