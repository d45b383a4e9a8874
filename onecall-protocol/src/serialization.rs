//! Pluggable serializers for message batches.
//!
//! A serializer turns a batch of encoded messages ([`Value`]s) into a body
//! and back. Decoding yields a document; [`expect_batch`] accepts it only
//! when it is an array of messages.

use crate::error::{FrameError, ProtocolError};
use crate::frame::Frame;
use bytes::{Bytes, BytesMut};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Encoding capability shared by the client adapter and the multiplexer.
pub trait Serialization: Send + Sync {
    /// MIME type announced on the transport.
    fn content_type(&self) -> &'static str;

    /// Whether 64-bit integers survive the encoding on the peer.
    fn supports_big_int(&self) -> bool;

    /// Encodes a batch of messages into a body.
    fn encode(&self, batch: &[Value]) -> Result<Bytes, ProtocolError>;

    /// Decodes a body into a document.
    fn decode(&self, data: &[u8]) -> Result<Value, ProtocolError>;
}

/// Accepts a decoded document only when it is an array of messages.
pub fn expect_batch(document: Value) -> Result<Vec<Value>, ProtocolError> {
    match document {
        Value::Array(messages) => Ok(messages),
        other => Err(ProtocolError::NotABatch(describe(&other).to_string())),
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A batch is one JSON array document.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json;

impl Serialization for Json {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn supports_big_int(&self) -> bool {
        false
    }

    fn encode(&self, batch: &[Value]) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(batch)?))
    }

    fn decode(&self, data: &[u8]) -> Result<Value, ProtocolError> {
        let text = std::str::from_utf8(data).map_err(|_| ProtocolError::InvalidUtf8)?;
        Ok(serde_json::from_str(text)?)
    }
}

/// One JSON message per line.
#[derive(Debug, Clone, Copy, Default)]
pub struct NdJson;

impl Serialization for NdJson {
    fn content_type(&self) -> &'static str {
        "application/ndjson"
    }

    fn supports_big_int(&self) -> bool {
        false
    }

    fn encode(&self, batch: &[Value]) -> Result<Bytes, ProtocolError> {
        let mut out = Vec::new();
        for message in batch {
            serde_json::to_writer(&mut out, message)?;
            out.push(b'\n');
        }
        Ok(Bytes::from(out))
    }

    fn decode(&self, data: &[u8]) -> Result<Value, ProtocolError> {
        let text = std::str::from_utf8(data).map_err(|_| ProtocolError::InvalidUtf8)?;
        let messages = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(serde_json::from_str)
            .collect::<Result<Vec<Value>, _>>()?;
        Ok(Value::Array(messages))
    }
}

/// One CRC-checked binary frame per message.
///
/// JSON payloads inside frames are produced and consumed by `serde_json`,
/// which keeps `u64` exact, so ids are left numeric.
#[derive(Debug, Clone, Copy, Default)]
pub struct Framed;

impl Serialization for Framed {
    fn content_type(&self) -> &'static str {
        "application/x-onecall-frame"
    }

    fn supports_big_int(&self) -> bool {
        true
    }

    fn encode(&self, batch: &[Value]) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        let last = batch.len().saturating_sub(1);
        for (i, message) in batch.iter().enumerate() {
            let mut frame = Frame::from_json(message)?;
            if i == last {
                frame = frame.with_batch_end();
            }
            frame.encode_into(&mut buf)?;
        }
        Ok(buf.freeze())
    }

    fn decode(&self, data: &[u8]) -> Result<Value, ProtocolError> {
        let mut buf = BytesMut::from(data);
        let mut messages = Vec::new();
        while !buf.is_empty() {
            let frame = match Frame::decode(&mut buf)? {
                Some(frame) => frame,
                None => {
                    return Err(FrameError::Truncated {
                        needed: Frame::missing(&buf),
                    }
                    .into())
                }
            };
            messages.push(serde_json::from_slice(&frame.payload)?);
        }
        Ok(Value::Array(messages))
    }
}

/// Serializer selectable by name in configuration and on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializationKind {
    #[default]
    Json,
    NdJson,
    Framed,
}

impl SerializationKind {
    pub fn build(self) -> Arc<dyn Serialization> {
        match self {
            SerializationKind::Json => Arc::new(Json),
            SerializationKind::NdJson => Arc::new(NdJson),
            SerializationKind::Framed => Arc::new(Framed),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SerializationKind::Json => "json",
            SerializationKind::NdJson => "ndjson",
            SerializationKind::Framed => "framed",
        }
    }
}

impl FromStr for SerializationKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(SerializationKind::Json),
            "ndjson" | "jsonl" => Ok(SerializationKind::NdJson),
            "framed" | "binary" => Ok(SerializationKind::Framed),
            _ => Err(ProtocolError::UnknownSerialization(s.to_string())),
        }
    }
}

impl fmt::Display for SerializationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
