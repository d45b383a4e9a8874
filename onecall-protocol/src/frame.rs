//! Binary frame format used by the [`Framed`](crate::serialization::Framed) serializer.
//!
//! One frame carries one JSON-encoded message. A batch is frames laid end to
//! end; the last frame of a batch sets [`FrameFlags::BATCH_END`].
//!
//! ```text
//! +--------+---------+--------+-------------+--------+-------------------+
//! | magic  | version | flags  | payload_len | crc32c | payload           |
//! | 4 bytes| 2 bytes |2 bytes |   4 bytes   | 4 bytes| payload_len bytes |
//! +--------+---------+--------+-------------+--------+-------------------+
//! ```
//!
//! All integers are big-endian. A zero checksum field means "not computed"
//! only when `CRC_PRESENT` is clear.

use crate::error::FrameError;
use crate::{MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;

/// Magic bytes identifying onecall frames.
pub const MAGIC: [u8; 4] = *b"OCLX";

/// Size of the fixed frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 16;

/// Frame flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u16);

impl FrameFlags {
    /// Payload checksum is present.
    pub const CRC_PRESENT: u16 = 0x0001;
    /// Final frame of a batch.
    pub const BATCH_END: u16 = 0x0002;

    const KNOWN: u16 = Self::CRC_PRESENT | Self::BATCH_END;

    pub fn new() -> Self {
        Self::default()
    }

    fn set(self, bit: u16) -> Self {
        Self(self.0 | bit)
    }

    pub fn with_crc(self) -> Self {
        self.set(Self::CRC_PRESENT)
    }

    pub fn with_batch_end(self) -> Self {
        self.set(Self::BATCH_END)
    }

    pub fn has_crc(&self) -> bool {
        self.0 & Self::CRC_PRESENT != 0
    }

    pub fn is_batch_end(&self) -> bool {
        self.0 & Self::BATCH_END != 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Rejects bits this version does not define.
    pub fn from_bits(bits: u16) -> Result<Self, FrameError> {
        match bits & !Self::KNOWN {
            0 => Ok(Self(bits)),
            _ => Err(FrameError::Flags(bits)),
        }
    }
}

/// Fixed-size prefix of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    version: u16,
    flags: FrameFlags,
    payload_len: u32,
    crc: u32,
}

impl FrameHeader {
    /// Parses and validates the header at the front of `buf`.
    ///
    /// Returns `Ok(None)` while fewer than [`FRAME_HEADER_SIZE`] bytes are
    /// available.
    fn parse(mut buf: &[u8]) -> Result<Option<Self>, FrameError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(FrameError::BadMagic(magic));
        }

        let version = buf.get_u16();
        if version != PROTOCOL_VERSION {
            return Err(FrameError::Version(version));
        }

        let flags = FrameFlags::from_bits(buf.get_u16())?;
        let payload_len = buf.get_u32();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(FrameError::Oversized {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(Some(Self {
            version,
            flags,
            payload_len,
            crc: buf.get_u32(),
        }))
    }

    fn frame_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload_len as usize
    }
}

/// A single framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u16,
    pub flags: FrameFlags,
    /// JSON-encoded message.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a checksummed frame around `payload`.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: FrameFlags::new().with_crc(),
            payload: payload.into(),
        }
    }

    pub fn from_json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    pub fn with_batch_end(mut self) -> Self {
        self.flags = self.flags.with_batch_end();
        self
    }

    fn checksum(&self) -> u32 {
        if self.flags.has_crc() {
            crc32c::crc32c(&self.payload)
        } else {
            0
        }
    }

    /// Appends the encoded frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        let payload_len = u32::try_from(self.payload.len())
            .ok()
            .filter(|len| *len <= MAX_PAYLOAD_SIZE)
            .ok_or(FrameError::Oversized {
                size: u32::try_from(self.payload.len()).unwrap_or(u32::MAX),
                max: MAX_PAYLOAD_SIZE,
            })?;

        buf.reserve(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_slice(&MAGIC);
        buf.put_u16(self.version);
        buf.put_u16(self.flags.bits());
        buf.put_u32(payload_len);
        buf.put_u32(self.checksum());
        buf.put_slice(&self.payload);
        Ok(())
    }

    pub fn encode(&self) -> Result<BytesMut, FrameError> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Splits one frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched if it does not yet hold
    /// a complete frame.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, FrameError> {
        let Some(header) = FrameHeader::parse(&buf[..])? else {
            return Ok(None);
        };
        if buf.len() < header.frame_len() {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let frame = Self {
            version: header.version,
            flags: header.flags,
            payload: buf.split_to(header.payload_len as usize).freeze(),
        };

        let actual = frame.checksum();
        if actual != header.crc && frame.flags.has_crc() {
            return Err(FrameError::Checksum {
                expected: header.crc,
                actual,
            });
        }
        Ok(Some(frame))
    }

    /// Bytes still missing before the frame at the front of `buf` is complete.
    pub fn missing(buf: &[u8]) -> usize {
        match FrameHeader::parse(buf) {
            Ok(Some(header)) => header.frame_len().saturating_sub(buf.len()),
            Ok(None) => FRAME_HEADER_SIZE - buf.len(),
            Err(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn header(magic: &[u8; 4], version: u16, flags: u16, len: u32) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_slice(magic);
        buf.put_u16(version);
        buf.put_u16(flags);
        buf.put_u32(len);
        buf.put_u32(0);
        buf
    }

    #[test]
    fn test_decode_consumes_exactly_one_frame() {
        let mut buf = Frame::new(r#"{"_tag":"Eof"}"#).encode().unwrap();
        buf.put_slice(b"tail");

        let frame = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.version, PROTOCOL_VERSION);
        assert!(frame.flags.has_crc());
        assert!(!frame.flags.is_batch_end());
        assert_eq!(frame.payload.as_ref(), br#"{"_tag":"Eof"}"#);
        assert_eq!(buf.as_ref(), b"tail");
    }

    #[test]
    fn test_corrupted_payload_fails_checksum() {
        let mut buf = Frame::new(r#"{"_tag":"Ack"}"#).encode().unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0x20;

        assert!(matches!(
            Frame::decode(&mut buf),
            Err(FrameError::Checksum { .. })
        ));
    }

    #[test]
    fn test_unchecked_frame_skips_checksum() {
        let frame = Frame {
            flags: FrameFlags::new(),
            ..Frame::new("{}")
        };
        let mut buf = frame.encode().unwrap();
        assert_eq!(&buf[12..16], &[0, 0, 0, 0]);
        assert_eq!(Frame::decode(&mut buf).unwrap(), Some(frame));
    }

    #[test]
    fn test_header_rejections() {
        let mut bad_magic = header(b"HTTP", PROTOCOL_VERSION, 0, 0);
        assert_eq!(
            Frame::decode(&mut bad_magic),
            Err(FrameError::BadMagic(*b"HTTP"))
        );

        let mut bad_version = header(&MAGIC, 7, 0, 0);
        assert_eq!(Frame::decode(&mut bad_version), Err(FrameError::Version(7)));

        let mut bad_flags = header(&MAGIC, PROTOCOL_VERSION, 0x0100, 0);
        assert_eq!(Frame::decode(&mut bad_flags), Err(FrameError::Flags(0x0100)));

        let mut oversized = header(&MAGIC, PROTOCOL_VERSION, 0, MAX_PAYLOAD_SIZE + 1);
        assert!(matches!(
            Frame::decode(&mut oversized),
            Err(FrameError::Oversized { .. })
        ));
    }

    #[test]
    fn test_oversized_payload_is_not_encoded() {
        let payload = vec![b' '; MAX_PAYLOAD_SIZE as usize + 1];
        assert!(matches!(
            Frame::new(payload).encode(),
            Err(FrameError::Oversized { .. })
        ));
    }

    #[test]
    fn test_missing_bytes() {
        let encoded = Frame::new(r#"{"a":1}"#).encode().unwrap();
        let partial = &encoded[..encoded.len() - 2];
        assert_eq!(Frame::missing(partial), 2);
        assert_eq!(Frame::missing(&encoded[..5]), FRAME_HEADER_SIZE - 5);
        assert_eq!(Frame::missing(&encoded), 0);
    }

    #[test]
    fn test_batch_end_survives() {
        let mut buf = Frame::new("[]").with_batch_end().encode().unwrap();
        let frame = Frame::decode(&mut buf).unwrap().unwrap();
        assert!(frame.flags.is_batch_end());
        assert!(frame.flags.has_crc());
    }

    proptest! {
        #[test]
        fn prop_truncated_frames_wait_for_more(
            payload in proptest::collection::vec(any::<u8>(), 0..256),
            cut in 1usize..16,
        ) {
            let encoded = Frame::new(payload).encode().unwrap();
            let keep = encoded.len().saturating_sub(cut);
            let mut partial = BytesMut::from(&encoded[..keep]);
            prop_assert!(Frame::decode(&mut partial).unwrap().is_none());
            prop_assert_eq!(partial.len(), keep);
        }
    }
}
