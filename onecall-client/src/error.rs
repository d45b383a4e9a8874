//! Client error types.

use onecall_protocol::RequestId;
use serde_json::Value;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] onecall_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timeout")]
    Timeout,

    /// The reply did not have the shape the protocol requires.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The method failed with its declared error.
    #[error("application error: {error}")]
    Application { error: Value },

    /// The server reported an unexpected failure.
    #[error("server defect: {0}")]
    Defect(String),

    #[error("request interrupted")]
    Interrupted,

    /// The reply ended without an exit for this request.
    #[error("no exit received for request {0}")]
    MissingExit(RequestId),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_) | ClientError::Timeout | ClientError::Transport(_)
        )
    }

    /// Builds a defect error from a defect value, keeping plain strings unquoted.
    pub fn defect(defect: &Value) -> Self {
        match defect {
            Value::String(s) => ClientError::Defect(s.clone()),
            other => ClientError::Defect(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retryable() {
        assert!(ClientError::Timeout.is_retryable());
        assert!(ClientError::Transport("503".to_string()).is_retryable());
        assert!(!ClientError::Interrupted.is_retryable());
        assert!(!ClientError::ProtocolViolation("object".to_string()).is_retryable());
    }

    #[test]
    fn test_defect_text() {
        assert_eq!(
            ClientError::defect(&json!("boom")).to_string(),
            "server defect: boom"
        );
        assert_eq!(
            ClientError::defect(&json!({"a": 1})).to_string(),
            r#"server defect: {"a":1}"#
        );
    }
}
