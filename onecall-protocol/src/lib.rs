//! # onecall-protocol
//!
//! Message protocol shared by both halves of the onecall adapter.
//!
//! This crate provides:
//! - Client and server message envelopes tagged by `_tag`
//! - Request identifiers that survive serializers without 64-bit integers
//! - Pluggable serializers (JSON, NDJSON, CRC-framed JSON)
//! - Binary framing with length prefix and CRC32C validation

pub mod error;
pub mod frame;
pub mod message;
pub mod serialization;
pub mod transform;

pub use error::{FrameError, ProtocolError};
pub use frame::{Frame, FrameFlags, FRAME_HEADER_SIZE, MAGIC};
pub use message::{Cause, ExitEncoded, FromClient, FromServer, RequestId, WireId};
pub use serialization::{expect_batch, Framed, Json, NdJson, Serialization, SerializationKind};

/// Protocol version carried in binary frames.
pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;
