//! Error types for the datagram RPC framework.

use crate::protocol::SessionId;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for RPC operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The listening socket could not be bound.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        /// The address we tried to bind.
        addr: SocketAddr,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// Encoded message is larger than the transmit limit.
    #[error("Encoded size {size} exceeds maximum {max}")]
    ContentOverflow {
        /// Size of the encoded message.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// No acknowledgment arrived in time.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The session is not in the table.
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    /// Identifier generation kept colliding with live sessions.
    #[error("No free session id after {attempts} attempts")]
    SessionIdExhausted {
        /// Number of identifiers drawn.
        attempts: usize,
    },

    /// Codec errors during serialization/deserialization.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The endpoint's background tasks are already running.
    #[error("Endpoint already started")]
    AlreadyStarted,
}

/// Codec-related errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),

    /// Deserialization failed.
    #[error("Failed to deserialize: {0}")]
    DeserializationFailed(String),

    /// Checksum mismatch.
    #[error("Checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Checksum carried by the datagram.
        expected: u32,
        /// Checksum computed over the payload.
        actual: u32,
    },

    /// Datagram shorter than the header.
    #[error("Datagram of {len} bytes is shorter than the {min} byte header")]
    Truncated {
        /// Length received.
        len: usize,
        /// Minimum length.
        min: usize,
    },
}
