//! # Agent Error Types
//!
//! Unified error handling for the agent runtime and CLI operations.

use bastio_proto::{FramingError, MessageError};
use thiserror::Error;

/// Agent operation result type
pub type AgentResult<T> = Result<T, AgentError>;

/// Error kinds for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("task error: {0}")]
    Task(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("account error: {0}")]
    Account(String),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("message error: {0}")]
    Message(#[from] MessageError),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a worker-pool misuse error
    pub fn task(message: impl Into<String>) -> Self {
        Self::Task(message.into())
    }

    /// Create a key-handling error
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto(message.into())
    }

    /// Create a backend transport error
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// Create an enrollment error
    pub fn account(message: impl Into<String>) -> Self {
        Self::Account(message.into())
    }

    /// Check if error is recoverable (worth retrying a connection for)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            AgentError::Backend(_) | AgentError::Io(_) => true,
            AgentError::Framing(e) => matches!(e, FramingError::Eof),
            AgentError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        assert!(matches!(AgentError::config("x"), AgentError::Config(m) if m == "x"));
        assert!(matches!(AgentError::task("x"), AgentError::Task(m) if m == "x"));
        assert!(matches!(AgentError::crypto("x"), AgentError::Crypto(m) if m == "x"));
        assert!(matches!(AgentError::backend("x"), AgentError::Backend(m) if m == "x"));
        assert!(matches!(AgentError::account("x"), AgentError::Account(m) if m == "x"));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            format!("{}", AgentError::backend("authentication with backend failed")),
            "backend error: authentication with backend failed"
        );
        assert_eq!(
            format!("{}", AgentError::config("missing api key")),
            "configuration error: missing api key"
        );
    }

    #[test]
    fn test_backend_is_recoverable() {
        assert!(AgentError::backend("connection refused").is_recoverable());
    }

    #[test]
    fn test_eof_is_recoverable() {
        assert!(AgentError::from(FramingError::Eof).is_recoverable());
    }

    #[test]
    fn test_corrupt_frame_not_recoverable() {
        assert!(!AgentError::from(FramingError::NonDigitLength).is_recoverable());
    }

    #[test]
    fn test_config_not_recoverable() {
        assert!(!AgentError::config("bad port").is_recoverable());
    }

    #[test]
    fn test_from_message_error() {
        let err = bastio_proto::ProtocolMessage::from_json(b"{bad").unwrap_err();
        let err: AgentError = err.into();
        assert!(matches!(err, AgentError::Message(_)));
        assert!(!err.is_recoverable());
    }
}
