//! Binary codec for network message serialization.
//!
//! A centralized interface for encoding and decoding wire messages with
//! bincode. The bincode configuration lives in exactly one place so every
//! encode and decode in the crate agrees on the byte layout.
//!
//! # Examples
//!
//! ```
//! use rampart_lockstep::network::codec::{encode, decode};
//!
//! let data: u32 = 42;
//! let bytes = encode(&data).expect("encoding should succeed");
//! let (decoded, _bytes_read): (u32, _) = decode(&bytes).expect("decoding should succeed");
//! assert_eq!(data, decoded);
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

// Fixed-size integer encoding keeps message sizes deterministic and spares
// small integers the varint overhead.
fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Errors that can occur during encoding or decoding.
///
/// The underlying bincode errors are opaque; they expose failure reasons only
/// through `Display`. Converting them to `String` preserves the diagnostic
/// text, and codec errors are off the hot path (they mean corrupted data or a
/// protocol mismatch), so the allocation is acceptable.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The encoding operation failed.
    Encode {
        /// The underlying bincode error message.
        message: String,
    },
    /// The decoding operation failed.
    Decode {
        /// The underlying bincode error message.
        message: String,
    },
    /// The provided buffer was too small for encoding.
    BufferTooSmall {
        /// The actual buffer size provided.
        provided: usize,
    },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode { message } => write!(f, "encoding failed: {message}"),
            Self::Decode { message } => write!(f, "decoding failed: {message}"),
            Self::BufferTooSmall { provided } => {
                write!(f, "buffer too small: only {provided} bytes provided")
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a value into a new `Vec<u8>`.
///
/// The simplest encoding function, but it allocates. For hot paths with a
/// reusable buffer, prefer [`encode_into`].
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config()).map_err(|e| CodecError::Encode {
        message: e.to_string(),
    })
}

/// Encodes a value into an existing byte slice, returning the number of
/// bytes written.
///
/// # Errors
///
/// Returns [`CodecError::BufferTooSmall`] if the buffer is not large enough.
pub fn encode_into<T: Serialize>(value: &T, buffer: &mut [u8]) -> CodecResult<usize> {
    bincode::serde::encode_into_slice(value, buffer, config()).map_err(|e| {
        let message = e.to_string();
        if message.contains("UnexpectedEnd") || message.contains("not enough") {
            CodecError::BufferTooSmall {
                provided: buffer.len(),
            }
        } else {
            CodecError::Encode { message }
        }
    })
}

/// Decodes a value from a byte slice, returning the value and the number of
/// bytes consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config()).map_err(|e| CodecError::Decode {
        message: e.to_string(),
    })
}

/// Decodes a value from a byte slice, ignoring the bytes consumed.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    decode(bytes).map(|(value, _)| value)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::network::messages::{Message, MessageBody, MessageHeader};
    use crate::{CommandKind, Frame, NetCommand, PeerId};

    fn message() -> Message {
        let command = NetCommand::new(
            CommandKind::KeepAlive,
            PeerId::new(1),
            Frame::new(0),
            vec![],
        );
        Message {
            header: MessageHeader {
                magic: 0x1234,
                sender: PeerId::new(1),
            },
            body: MessageBody::Command(crate::network::messages::CommandPacket::from_command(
                &command,
            )),
        }
    }

    #[test]
    fn roundtrip_message() {
        let msg = message();
        let bytes = encode(&msg).unwrap();
        let (decoded, len): (Message, _) = decode(&bytes).unwrap();
        assert_eq!(msg, decoded);
        assert_eq!(len, bytes.len());
    }

    #[test]
    fn encode_into_buffer() {
        let msg = message();
        let mut buffer = [0u8; 256];
        let len = encode_into(&msg, &mut buffer).unwrap();
        let decoded: Message = decode_value(&buffer[..len]).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn encode_into_buffer_too_small() {
        let value: u64 = 0x1234_5678_9ABC_DEF0;
        let mut buffer = [0u8; 1];
        let result = encode_into(&value, &mut buffer);
        assert!(matches!(
            result,
            Err(CodecError::BufferTooSmall { .. }) | Err(CodecError::Encode { .. })
        ));
    }

    #[test]
    fn decode_invalid_data_fails() {
        let invalid_bytes = [0xFF, 0xFF, 0xFF];
        let result: CodecResult<(u64, _)> = decode(&invalid_bytes);
        assert!(result.is_err());
    }

    #[test]
    fn encoding_is_deterministic() {
        let msg = message();
        let bytes1 = encode(&msg).unwrap();
        let bytes2 = encode(&msg).unwrap();
        assert_eq!(bytes1, bytes2);
    }

    #[test]
    fn error_display_names_the_direction() {
        let err = CodecError::Encode {
            message: "boom".to_string(),
        };
        assert!(err.to_string().contains("encoding failed"));
        let err = CodecError::BufferTooSmall { provided: 10 };
        assert!(err.to_string().contains("10"));
    }
}
