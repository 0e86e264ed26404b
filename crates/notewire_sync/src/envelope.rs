//! Envelope kinds and their typed metadata records.

use serde::{Deserialize, Serialize};

use notewire_core::StateVector;

/// Closed set of message kinds. The discriminant is the first byte of
/// a binary frame; all values stay outside the printable-JSON range so
/// the legacy fallback check (`{` / `[`) can never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    SyncRequest = 0x01,
    SyncResponse = 0x02,
    SyncSnapshot = 0x03,
    Update = 0x04,
    PresenceUpdate = 0x05,
    CursorUpdate = 0x06,
    CursorRemove = 0x07,
    SavedAck = 0x08,
    Join = 0x09,
    Leave = 0x0A,
    Error = 0x0B,
}

impl MessageKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::SyncRequest),
            0x02 => Some(Self::SyncResponse),
            0x03 => Some(Self::SyncSnapshot),
            0x04 => Some(Self::Update),
            0x05 => Some(Self::PresenceUpdate),
            0x06 => Some(Self::CursorUpdate),
            0x07 => Some(Self::CursorRemove),
            0x08 => Some(Self::SavedAck),
            0x09 => Some(Self::Join),
            0x0A => Some(Self::Leave),
            0x0B => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A cursor selection range in visible-character coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: u64,
    pub head: u64,
}

/// Typed metadata, one variant per envelope kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Metadata {
    /// Peer asks for operations it is missing. Answered with
    /// `SyncResponse`.
    SyncRequest {
        document_id: String,
        state_vector: StateVector,
    },
    /// Operations answering a `SyncRequest`; ops travel in the payload.
    SyncResponse { document_id: String },
    /// Legacy compatibility: a whole-document text snapshot instead of
    /// native operations. Converted server-side via the minimal diff.
    SyncSnapshot {
        document_id: String,
        full_text: String,
    },
    /// A native CRDT update; encoded operations travel in the payload.
    Update { document_id: String },
    /// Opaque per-user presence state, last-write-wins, never persisted.
    PresenceUpdate {
        document_id: String,
        user_id: String,
        state: serde_json::Value,
    },
    CursorUpdate {
        document_id: String,
        user_id: String,
        position: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selection: Option<Selection>,
    },
    CursorRemove {
        document_id: String,
        user_id: String,
    },
    /// Durable-save confirmation for a document.
    SavedAck {
        document_id: String,
        saved_at: i64,
    },
    Join { room_id: String },
    Leave { room_id: String },
    Error { message: String },
}

impl Metadata {
    /// The frame kind this metadata belongs to. Binary decode checks
    /// the kind byte against this so a frame cannot smuggle one kind's
    /// record under another's byte.
    pub fn kind(&self) -> MessageKind {
        match self {
            Metadata::SyncRequest { .. } => MessageKind::SyncRequest,
            Metadata::SyncResponse { .. } => MessageKind::SyncResponse,
            Metadata::SyncSnapshot { .. } => MessageKind::SyncSnapshot,
            Metadata::Update { .. } => MessageKind::Update,
            Metadata::PresenceUpdate { .. } => MessageKind::PresenceUpdate,
            Metadata::CursorUpdate { .. } => MessageKind::CursorUpdate,
            Metadata::CursorRemove { .. } => MessageKind::CursorRemove,
            Metadata::SavedAck { .. } => MessageKind::SavedAck,
            Metadata::Join { .. } => MessageKind::Join,
            Metadata::Leave { .. } => MessageKind::Leave,
            Metadata::Error { .. } => MessageKind::Error,
        }
    }
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub room_id: String,
    pub metadata: Metadata,
    /// Raw binary payload (encoded operations for `Update` and
    /// `SyncResponse`; empty for metadata-only kinds).
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(room_id: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            room_id: room_id.into(),
            metadata,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(room_id: impl Into<String>, metadata: Metadata, payload: Vec<u8>) -> Self {
        Self {
            room_id: room_id.into(),
            metadata,
            payload,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.metadata.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_bytes_round_trip() {
        for byte in 0x01..=0x0B {
            let kind = MessageKind::from_byte(byte).unwrap();
            assert_eq!(kind.as_byte(), byte);
        }
        assert!(MessageKind::from_byte(0x00).is_none());
        assert!(MessageKind::from_byte(0x0C).is_none());
        // Legacy JSON starts must never be valid kinds.
        assert!(MessageKind::from_byte(b'{').is_none());
        assert!(MessageKind::from_byte(b'[').is_none());
    }

    #[test]
    fn metadata_tags_are_snake_case() {
        let meta = Metadata::Join {
            room_id: "room-1".into(),
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["type"], "join");
        assert_eq!(json["room_id"], "room-1");
    }

    #[test]
    fn cursor_selection_is_optional() {
        let json = serde_json::json!({
            "type": "cursor_update",
            "document_id": "d",
            "user_id": "u",
            "position": 3,
        });
        let meta: Metadata = serde_json::from_value(json).unwrap();
        assert!(matches!(
            meta,
            Metadata::CursorUpdate { selection: None, .. }
        ));
    }
}
