//! Framing: one frame-type byte, then either a bincode `Message` or raw stream bytes.
//!
//! Messages carry no length prefix; the decoder consumes exactly one serialized
//! value. Stream lengths travel out of band (in a prior `StoreFile` message, or
//! as an 8-byte little-endian size prefix in a GET reply).

use bincode::Options;

use crate::protocol::Message;

/// Length of the little-endian size prefix in a GET reply.
pub const SIZE_PREFIX_LEN: usize = 8;
const MAX_MESSAGE_LEN: u64 = 64 * 1024; // 64 KiB

/// Leading byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Message = 0x00,
    Stream = 0x01,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameDecodeError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            0x00 => Ok(FrameType::Message),
            0x01 => Ok(FrameType::Stream),
            other => Err(FrameDecodeError::UnknownFrameType(other)),
        }
    }
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_MESSAGE_LEN)
}

/// Encode a message body (no frame-type byte).
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    codec().serialize(msg).map_err(|e| {
        if matches!(*e, bincode::ErrorKind::SizeLimit) {
            FrameEncodeError::TooLarge
        } else {
            FrameEncodeError::Encode(e)
        }
    })
}

/// Encode a message into a single frame: frame-type byte + bincode payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = encode_message(msg)?;
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(FrameType::Message as u8);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a message into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("message too large")]
    TooLarge,
}

/// Decode one message body from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if the value is incomplete (caller should retry after more data).
pub fn decode_message(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let mut cursor = bytes;
    match codec().deserialize_from::<_, Message>(&mut cursor) {
        Ok(msg) => Ok((msg, bytes.len() - cursor.len())),
        Err(e) => match e.as_ref() {
            bincode::ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                if bytes.len() as u64 >= MAX_MESSAGE_LEN {
                    Err(FrameDecodeError::TooLarge)
                } else {
                    Err(FrameDecodeError::NeedMore)
                }
            }
            bincode::ErrorKind::SizeLimit => Err(FrameDecodeError::TooLarge),
            _ => Err(FrameDecodeError::Decode(e)),
        },
    }
}

/// Error decoding a frame (need more bytes, too large, unknown type, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("message too large")]
    TooLarge,
    #[error("unknown frame type {0:#04x}")]
    UnknownFrameType(u8),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

/// Size prefix for a GET reply. `FILE_NOT_FOUND` (-1) marks a miss.
pub fn encode_size(size: i64) -> [u8; SIZE_PREFIX_LEN] {
    size.to_le_bytes()
}

pub fn decode_size(bytes: [u8; SIZE_PREFIX_LEN]) -> i64 {
    i64::from_le_bytes(bytes)
}
