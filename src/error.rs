use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::ExecutionMode;

/// Classification of a failed remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// Network failures, 5xx responses
    Transient,
    /// Throttled by the remote side
    RateLimited,
    /// Session token no longer accepted
    AuthExpired,
    /// Call exceeded its deadline
    Timeout,
    /// The remote understood the request and refused it
    Rejected,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemoteErrorKind::Transient => "transient",
            RemoteErrorKind::RateLimited => "rate-limited",
            RemoteErrorKind::AuthExpired => "auth-expired",
            RemoteErrorKind::Timeout => "timeout",
            RemoteErrorKind::Rejected => "rejected",
        };
        write!(f, "{}", name)
    }
}

/// Main error type for the execution engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Remote call failed ({kind}): {message}")]
    Remote {
        kind: RemoteErrorKind,
        message: String,
    },

    #[error("Circuit breaker open for operation class {0}")]
    CircuitOpen(String),

    #[error("Invalid order state: {0}")]
    InvalidState(String),

    #[error("Execution mode mismatch: manager is {manager}, order is {order}")]
    ModeMismatch {
        manager: ExecutionMode,
        order: ExecutionMode,
    },

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Feed error: {0}")]
    Feed(String),

    #[error("Push feed reconnection exhausted after {0} attempts")]
    ReconnectExhausted(u32),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn remote(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        EngineError::Remote {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::remote(RemoteErrorKind::Transient, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::remote(RemoteErrorKind::RateLimited, message)
    }

    pub fn auth_expired(message: impl Into<String>) -> Self {
        Self::remote(RemoteErrorKind::AuthExpired, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::remote(RemoteErrorKind::Timeout, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::remote(RemoteErrorKind::Rejected, message)
    }

    /// Kind of remote failure, if this is one
    pub fn remote_kind(&self) -> Option<RemoteErrorKind> {
        match self {
            EngineError::Remote { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.remote_kind() == Some(RemoteErrorKind::RateLimited)
    }

    pub fn is_auth_expired(&self) -> bool {
        self.remote_kind() == Some(RemoteErrorKind::AuthExpired)
    }

    /// Whether the supervisor should retry this failure with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.remote_kind(),
            Some(RemoteErrorKind::Transient)
                | Some(RemoteErrorKind::RateLimited)
                | Some(RemoteErrorKind::Timeout)
        )
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return EngineError::timeout(error.to_string());
        }

        if let Some(status) = error.status() {
            return EngineError::remote(classify_http_status(status.as_u16()), error.to_string());
        }

        if error.is_decode() {
            return EngineError::rejected(format!("Malformed response: {}", error));
        }

        EngineError::transient(error.to_string())
    }
}

/// Map an HTTP status code onto the remote failure taxonomy
pub fn classify_http_status(status: u16) -> RemoteErrorKind {
    match status {
        429 => RemoteErrorKind::RateLimited,
        401 | 403 => RemoteErrorKind::AuthExpired,
        408 | 504 => RemoteErrorKind::Timeout,
        500..=599 => RemoteErrorKind::Transient,
        _ => RemoteErrorKind::Rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::transient("boom").is_retryable());
        assert!(EngineError::rate_limited("slow down").is_retryable());
        assert!(EngineError::timeout("late").is_retryable());
        assert!(!EngineError::auth_expired("token").is_retryable());
        assert!(!EngineError::rejected("no margin").is_retryable());
        assert!(!EngineError::CircuitOpen("orders".to_string()).is_retryable());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(classify_http_status(429), RemoteErrorKind::RateLimited);
        assert_eq!(classify_http_status(403), RemoteErrorKind::AuthExpired);
        assert_eq!(classify_http_status(503), RemoteErrorKind::Transient);
        assert_eq!(classify_http_status(504), RemoteErrorKind::Timeout);
        assert_eq!(classify_http_status(400), RemoteErrorKind::Rejected);
    }

    #[test]
    fn test_display_includes_kind() {
        let err = EngineError::rate_limited("too many requests");
        assert_eq!(
            err.to_string(),
            "Remote call failed (rate-limited): too many requests"
        );
    }
}
