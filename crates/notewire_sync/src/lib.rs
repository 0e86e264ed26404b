//! Notewire wire protocol.
//!
//! Envelopes travel as binary frames:
//! `[kind:1][metadata_len:4 BE][metadata JSON][payload bytes]`.
//! The metadata block is the JSON encoding of a typed per-kind record
//! (a closed tagged union, not an open dictionary). Frames whose
//! first byte is `{` or `[` are legacy plain-JSON messages and are
//! decoded by a separate fallback path for older clients.

pub mod codec;
pub mod envelope;

pub use codec::{ProtocolError, decode, encode};
pub use envelope::{Frame, Metadata, MessageKind, Selection};
