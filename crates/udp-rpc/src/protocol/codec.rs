//! Datagram codec: a CRC32 header followed by the bincode-encoded message.

use crate::error::{CodecError, Result};
use crate::protocol::Message;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the checksum header in front of every payload.
pub const CHECKSUM_SIZE: usize = 4;

/// Encode a message into a datagram.
///
/// # Errors
///
/// Returns an error if the message cannot be serialized.
pub fn encode(message: &Message) -> Result<Bytes> {
    let payload = bincode::serialize(message)
        .map_err(|e| CodecError::SerializationFailed(e.to_string()))?;

    let mut buf = BytesMut::with_capacity(CHECKSUM_SIZE + payload.len());
    buf.put_u32(crc32fast::hash(&payload));
    buf.put_slice(&payload);

    Ok(buf.freeze())
}

/// Decode a datagram into a message.
///
/// # Errors
///
/// Returns an error if the datagram is truncated, fails its checksum, or
/// does not hold a valid message.
pub fn decode(datagram: &[u8]) -> Result<Message> {
    if datagram.len() < CHECKSUM_SIZE {
        return Err(CodecError::Truncated {
            len: datagram.len(),
            min: CHECKSUM_SIZE,
        }
        .into());
    }

    let mut header = &datagram[..CHECKSUM_SIZE];
    let payload = &datagram[CHECKSUM_SIZE..];

    let expected = header.get_u32();
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(CodecError::ChecksumMismatch { expected, actual }.into());
    }

    bincode::deserialize(payload)
        .map_err(|e| CodecError::DeserializationFailed(e.to_string()))
        .map_err(Into::into)
}
