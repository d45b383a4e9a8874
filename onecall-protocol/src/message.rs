//! Message envelopes exchanged between the client and server engines.
//!
//! Every message is a JSON object tagged by `_tag`. Payloads, success values,
//! application errors and defects stay opaque [`Value`]s; only the envelope
//! fields (`_tag`, `id`, `requestId`) are interpreted here.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identifier of a logical request, unique for the lifetime of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Wire form of a [`RequestId`].
///
/// Serializers that cannot carry 64-bit integers receive the decimal string
/// form instead of the number. Both forms parse to the same identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireId {
    Int(u64),
    Str(String),
}

impl WireId {
    /// Parses the wire form back into a request identifier.
    pub fn parse(&self) -> Result<RequestId, ProtocolError> {
        match self {
            WireId::Int(id) => Ok(RequestId(*id)),
            WireId::Str(s) => s
                .parse::<u64>()
                .map(RequestId)
                .map_err(|_| ProtocolError::InvalidRequestId(s.clone())),
        }
    }

    /// Replaces a numeric id with its decimal string form.
    pub fn stringify(&mut self) {
        if let WireId::Int(id) = *self {
            *self = WireId::Str(id.to_string());
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, WireId::Str(_))
    }
}

impl From<RequestId> for WireId {
    fn from(id: RequestId) -> Self {
        WireId::Int(id.0)
    }
}

impl fmt::Display for WireId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireId::Int(id) => write!(f, "{}", id),
            WireId::Str(s) => f.write_str(s),
        }
    }
}

/// Messages sent from the client engine to the server engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum FromClient {
    /// Opens a logical call.
    Request {
        id: WireId,
        /// Method name.
        tag: String,
        #[serde(default)]
        payload: Value,
        #[serde(default)]
        headers: Vec<(String, String)>,
    },
    /// Cancels a previously opened request.
    Interrupt {
        #[serde(rename = "requestId")]
        request_id: WireId,
    },
    /// No further client messages arrive in this batch.
    Eof,
    /// Flow-control acknowledgment. Never produced by the one-shot transport.
    Ack {
        #[serde(rename = "requestId")]
        request_id: WireId,
    },
}

impl FromClient {
    pub fn request(id: RequestId, tag: impl Into<String>, payload: Value) -> Self {
        FromClient::Request {
            id: id.into(),
            tag: tag.into(),
            payload,
            headers: Vec::new(),
        }
    }

    pub fn interrupt(id: RequestId) -> Self {
        FromClient::Interrupt {
            request_id: id.into(),
        }
    }

    /// Returns the id this message refers to, if any.
    pub fn request_id(&self) -> Option<&WireId> {
        match self {
            FromClient::Request { id, .. } => Some(id),
            FromClient::Interrupt { request_id } | FromClient::Ack { request_id } => {
                Some(request_id)
            }
            FromClient::Eof => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            FromClient::Request { .. } => "Request",
            FromClient::Interrupt { .. } => "Interrupt",
            FromClient::Eof => "Eof",
            FromClient::Ack { .. } => "Ack",
        }
    }
}

/// Cause of a failed exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum Cause {
    /// Typed application error declared by the method.
    Fail { error: Value },
    /// Unexpected failure.
    Die { defect: Value },
    /// The request was interrupted.
    Interrupt,
}

/// Terminal outcome of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum ExitEncoded {
    Success { value: Value },
    Failure { cause: Cause },
}

impl ExitEncoded {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitEncoded::Success { .. })
    }
}

/// Messages sent from the server engine to the client engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum FromServer {
    /// Incremental items of a streaming response.
    Chunk {
        #[serde(rename = "requestId")]
        request_id: WireId,
        values: Vec<Value>,
    },
    /// Terminal response of a request.
    Exit {
        #[serde(rename = "requestId")]
        request_id: WireId,
        exit: ExitEncoded,
    },
    /// Defect not tied to a single request.
    Defect { defect: Value },
}

impl FromServer {
    pub fn chunk(id: RequestId, values: Vec<Value>) -> Self {
        FromServer::Chunk {
            request_id: id.into(),
            values,
        }
    }

    pub fn success(id: RequestId, value: Value) -> Self {
        FromServer::Exit {
            request_id: id.into(),
            exit: ExitEncoded::Success { value },
        }
    }

    pub fn failure(id: RequestId, error: Value) -> Self {
        FromServer::Exit {
            request_id: id.into(),
            exit: ExitEncoded::Failure {
                cause: Cause::Fail { error },
            },
        }
    }

    pub fn die(id: RequestId, defect: impl Into<Value>) -> Self {
        FromServer::Exit {
            request_id: id.into(),
            exit: ExitEncoded::Failure {
                cause: Cause::Die {
                    defect: defect.into(),
                },
            },
        }
    }

    pub fn interrupted(id: RequestId) -> Self {
        FromServer::Exit {
            request_id: id.into(),
            exit: ExitEncoded::Failure {
                cause: Cause::Interrupt,
            },
        }
    }

    /// Builds a defect response from any displayable cause.
    pub fn defect(cause: impl fmt::Display) -> Self {
        FromServer::Defect {
            defect: Value::String(cause.to_string()),
        }
    }

    /// Returns the id this message refers to, if any.
    pub fn request_id(&self) -> Option<&WireId> {
        match self {
            FromServer::Chunk { request_id, .. } | FromServer::Exit { request_id, .. } => {
                Some(request_id)
            }
            FromServer::Defect { .. } => None,
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, FromServer::Exit { .. })
    }
}
