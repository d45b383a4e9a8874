//! Protocol error types.

use thiserror::Error;

/// Errors raised while encoding or decoding a body.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad frame: {0}")]
    Frame(#[from] FrameError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("body is not valid UTF-8")]
    InvalidUtf8,

    #[error("expected an array of messages, got {0}")]
    NotABatch(String),

    #[error("request id is neither an integer nor a decimal string: {0}")]
    InvalidRequestId(String),

    #[error("unknown serialization '{0}' (expected json, ndjson or framed)")]
    UnknownSerialization(String),
}

/// Errors in the binary frame layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("magic {0:?} is not OCLX")]
    BadMagic([u8; 4]),

    #[error("version {0} not supported")]
    Version(u16),

    #[error("payload of {size} bytes exceeds {max}")]
    Oversized { size: u32, max: u32 },

    #[error("checksum {actual:#010x} does not match header {expected:#010x}")]
    Checksum { expected: u32, actual: u32 },

    #[error("reserved flag bits set: {0:#06x}")]
    Flags(u16),

    #[error("body ends {needed} byte(s) short of a frame")]
    Truncated { needed: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_errors_wrap() {
        let err: ProtocolError = FrameError::Truncated { needed: 3 }.into();
        assert!(matches!(
            err,
            ProtocolError::Frame(FrameError::Truncated { needed: 3 })
        ));
        assert_eq!(err.to_string(), "bad frame: body ends 3 byte(s) short of a frame");
    }

    #[test]
    fn test_display() {
        let err = FrameError::Checksum {
            expected: 0xabc,
            actual: 0xdef,
        };
        assert_eq!(
            err.to_string(),
            "checksum 0x00000def does not match header 0x00000abc"
        );
        assert!(ProtocolError::NotABatch("an object".into())
            .to_string()
            .ends_with("got an object"));
        assert!(ProtocolError::UnknownSerialization("xml".into())
            .to_string()
            .contains("'xml'"));
    }
}
