//! Server error types.

use crate::registry::SessionId;
use hyper::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] onecall_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("session {session_id} timed out after {timeout:?}")]
    SessionTimeout {
        session_id: SessionId,
        timeout: Duration,
    },

    #[error("session {0} closed before its responses were complete")]
    SessionClosed(SessionId),

    #[error("request body too large: limit is {max} bytes")]
    BodyTooLarge { max: usize },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ServerError {
    /// HTTP status reported to the caller of the front end.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ServerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::SessionTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns whether the caller may retry the whole batch.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServerError::Io(_) | ServerError::SessionTimeout { .. }
        )
    }
}
