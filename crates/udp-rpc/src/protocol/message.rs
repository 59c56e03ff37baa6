//! The message unit exchanged between endpoints.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix reserved for protocol-internal control identifiers.
pub const CONTROL_PREFIX: &str = "prt-";

/// Identifier of the acknowledgment control message.
pub const ACK_IDENTIFIER: &str = "prt-ack";

/// Sequence sentinel for messages that expect no correlated reply.
pub const NO_SEQUENCE: i64 = -1;

/// Identifier of a session, chosen by the endpoint that created it.
///
/// The empty id marks a session-establishing message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// The empty session id carried by session-establishing messages.
    #[must_use]
    pub const fn empty() -> Self {
        Self(String::new())
    }

    /// Whether this is the empty (establishing) id.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A single datagram's logical content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Session this message belongs to, empty when establishing one.
    pub session: SessionId,
    /// Application command name, or a reserved control name.
    pub identifier: String,
    /// Correlation sequence, [`NO_SEQUENCE`] for fire-and-forget.
    pub sequence: i64,
    /// Opaque payload.
    pub body: String,
}

impl Message {
    /// Create a new message.
    pub fn new(
        session: SessionId,
        identifier: impl Into<String>,
        sequence: i64,
        body: impl Into<String>,
    ) -> Self {
        Self {
            session,
            identifier: identifier.into(),
            sequence,
            body: body.into(),
        }
    }

    /// Build the acknowledgment answering a request with `sequence`.
    pub fn ack(session: SessionId, sequence: i64, body: impl Into<String>) -> Self {
        Self::new(session, ACK_IDENTIFIER, sequence, body)
    }

    /// Whether this is the acknowledgment control message.
    #[must_use]
    pub fn is_ack(&self) -> bool {
        self.identifier == ACK_IDENTIFIER
    }

    /// Whether this message expects a correlated reply.
    #[must_use]
    pub const fn expects_reply(&self) -> bool {
        self.sequence != NO_SEQUENCE
    }
}

/// Whether `identifier` falls in the reserved control namespace.
#[must_use]
pub fn is_reserved(identifier: &str) -> bool {
    identifier.starts_with(CONTROL_PREFIX)
}
