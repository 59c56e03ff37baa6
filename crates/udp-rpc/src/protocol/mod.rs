//! Protocol layer for the datagram RPC framework.
//!
//! This module contains the wire-level definitions:
//! - The message unit and its reserved identifiers
//! - The datagram codec

pub mod codec;
pub mod message;

pub use message::{ACK_IDENTIFIER, CONTROL_PREFIX, Message, NO_SEQUENCE, SessionId};
