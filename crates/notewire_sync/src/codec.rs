//! Binary frame codec with the legacy JSON fallback.
//!
//! Frame layout: `[kind:1][metadata_len:4 BE][metadata][payload]`.
//! The payload length is implicit (frame length minus header minus
//! metadata length), so the only client-supplied length field is the
//! metadata length, which is validated against the remaining buffer
//! before anything is sliced. Decoding fails closed: anything that is
//! not a well-formed binary frame or a parseable legacy JSON message
//! is a `ProtocolError`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::envelope::{Frame, MessageKind, Metadata};

/// Header size: kind byte plus big-endian u32 metadata length.
const HEADER_LEN: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too short: {0} bytes")]
    Truncated(usize),

    #[error("unknown message kind byte 0x{0:02x}")]
    UnknownKind(u8),

    #[error("metadata length {declared} overruns frame ({available} bytes available)")]
    MetadataOverrun { declared: usize, available: usize },

    #[error("malformed metadata block: {0}")]
    BadMetadata(serde_json::Error),

    #[error("metadata record {tag:?} does not match kind byte 0x{kind:02x}")]
    KindMismatch { kind: u8, tag: &'static str },

    #[error("malformed legacy frame: {0}")]
    BadLegacy(serde_json::Error),

    #[error("legacy payload is not valid base64: {0}")]
    BadLegacyPayload(base64::DecodeError),
}

/// Wire form of the metadata block: the room id plus the typed
/// per-kind record, flattened into one JSON object.
#[derive(Serialize, Deserialize)]
struct MetadataBlock {
    room_id: String,
    #[serde(flatten)]
    metadata: Metadata,
}

/// Legacy plain-JSON frame. Binary payloads travel base64-encoded in
/// the `payload` field.
#[derive(Serialize, Deserialize)]
struct LegacyFrame {
    room_id: String,
    #[serde(flatten)]
    metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
}

/// Encode a frame into the binary wire format. Total for valid input.
pub fn encode(frame: &Frame) -> Vec<u8> {
    let block = MetadataBlock {
        room_id: frame.room_id.clone(),
        metadata: frame.metadata.clone(),
    };
    let metadata =
        serde_json::to_vec(&block).expect("metadata records always serialize");
    let mut buf = Vec::with_capacity(HEADER_LEN + metadata.len() + frame.payload.len());
    buf.push(frame.kind().as_byte());
    buf.extend_from_slice(&(metadata.len() as u32).to_be_bytes());
    buf.extend_from_slice(&metadata);
    buf.extend_from_slice(&frame.payload);
    buf
}

/// Encode a frame as a legacy JSON message (for tests and for peers
/// negotiated down to the text protocol).
pub fn encode_legacy(frame: &Frame) -> Vec<u8> {
    let legacy = LegacyFrame {
        room_id: frame.room_id.clone(),
        metadata: frame.metadata.clone(),
        payload: if frame.payload.is_empty() {
            None
        } else {
            Some(BASE64.encode(&frame.payload))
        },
    };
    serde_json::to_vec(&legacy).expect("legacy frames always serialize")
}

/// Decode a frame, routing to the legacy JSON path when the first
/// byte is a printable JSON start (`{` or `[`).
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    let first = *data.first().ok_or(ProtocolError::Truncated(0))?;

    if first == b'{' || first == b'[' {
        return decode_legacy(data);
    }

    let kind = MessageKind::from_byte(first).ok_or(ProtocolError::UnknownKind(first))?;
    if data.len() < HEADER_LEN {
        return Err(ProtocolError::Truncated(data.len()));
    }
    let declared = u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;
    let available = data.len() - HEADER_LEN;
    if declared > available {
        return Err(ProtocolError::MetadataOverrun {
            declared,
            available,
        });
    }

    let block: MetadataBlock = serde_json::from_slice(&data[HEADER_LEN..HEADER_LEN + declared])
        .map_err(ProtocolError::BadMetadata)?;
    if block.metadata.kind() != kind {
        return Err(ProtocolError::KindMismatch {
            kind: first,
            tag: metadata_tag(&block.metadata),
        });
    }

    Ok(Frame {
        room_id: block.room_id,
        metadata: block.metadata,
        payload: data[HEADER_LEN + declared..].to_vec(),
    })
}

fn decode_legacy(data: &[u8]) -> Result<Frame, ProtocolError> {
    let legacy: LegacyFrame = serde_json::from_slice(data).map_err(ProtocolError::BadLegacy)?;
    let payload = match legacy.payload {
        Some(b64) => BASE64
            .decode(b64.as_bytes())
            .map_err(ProtocolError::BadLegacyPayload)?,
        None => Vec::new(),
    };
    Ok(Frame {
        room_id: legacy.room_id,
        metadata: legacy.metadata,
        payload,
    })
}

fn metadata_tag(metadata: &Metadata) -> &'static str {
    match metadata {
        Metadata::SyncRequest { .. } => "sync_request",
        Metadata::SyncResponse { .. } => "sync_response",
        Metadata::SyncSnapshot { .. } => "sync_snapshot",
        Metadata::Update { .. } => "update",
        Metadata::PresenceUpdate { .. } => "presence_update",
        Metadata::CursorUpdate { .. } => "cursor_update",
        Metadata::CursorRemove { .. } => "cursor_remove",
        Metadata::SavedAck { .. } => "saved_ack",
        Metadata::Join { .. } => "join",
        Metadata::Leave { .. } => "leave",
        Metadata::Error { .. } => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notewire_core::StateVector;

    fn update_frame() -> Frame {
        Frame::with_payload(
            "room-1",
            Metadata::Update {
                document_id: "doc-1".into(),
            },
            vec![0xDE, 0xAD, 0xBE, 0xEF],
        )
    }

    #[test]
    fn binary_round_trip_with_payload() {
        let frame = update_frame();
        let decoded = decode(&encode(&frame)).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn binary_round_trip_metadata_only() {
        let frame = Frame::new(
            "room-2",
            Metadata::SyncRequest {
                document_id: "doc-9".into(),
                state_vector: StateVector::new(),
            },
        );
        let decoded = decode(&encode(&frame)).unwrap();
        assert_eq!(decoded, frame);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn short_frames_are_rejected() {
        assert!(matches!(decode(&[]), Err(ProtocolError::Truncated(0))));
        for len in 1..5 {
            let buf = vec![MessageKind::Update.as_byte(); len];
            assert!(
                matches!(decode(&buf), Err(ProtocolError::Truncated(_))),
                "length {len}"
            );
        }
    }

    #[test]
    fn unknown_kind_byte_is_rejected() {
        let buf = [0xF0, 0, 0, 0, 0];
        assert!(matches!(
            decode(&buf),
            Err(ProtocolError::UnknownKind(0xF0))
        ));
    }

    #[test]
    fn metadata_length_past_buffer_end_is_rejected() {
        let mut buf = encode(&update_frame());
        // Claim more metadata than the frame carries.
        let huge = (buf.len() as u32 + 100).to_be_bytes();
        buf[1..5].copy_from_slice(&huge);
        assert!(matches!(
            decode(&buf),
            Err(ProtocolError::MetadataOverrun { .. })
        ));
    }

    #[test]
    fn kind_byte_must_match_metadata_record() {
        let mut buf = encode(&update_frame());
        buf[0] = MessageKind::Join.as_byte();
        assert!(matches!(
            decode(&buf),
            Err(ProtocolError::KindMismatch { .. })
        ));
    }

    #[test]
    fn legacy_json_frame_is_accepted() {
        let frame = update_frame();
        let bytes = encode_legacy(&frame);
        assert_eq!(bytes[0], b'{');
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn legacy_garbage_is_a_protocol_error() {
        assert!(matches!(
            decode(b"{not json"),
            Err(ProtocolError::BadLegacy(_))
        ));
        assert!(matches!(
            decode(b"[1, 2, 3]"),
            Err(ProtocolError::BadLegacy(_))
        ));
    }

    #[test]
    fn legacy_bad_base64_payload_is_rejected() {
        let bytes = br#"{"room_id":"r","type":"update","document_id":"d","payload":"!!!"}"#;
        assert!(matches!(
            decode(bytes),
            Err(ProtocolError::BadLegacyPayload(_))
        ));
    }

    #[test]
    fn snapshot_and_error_kinds_round_trip() {
        for metadata in [
            Metadata::SyncSnapshot {
                document_id: "d".into(),
                full_text: "the whole note".into(),
            },
            Metadata::Error {
                message: "access denied".into(),
            },
            Metadata::SavedAck {
                document_id: "d".into(),
                saved_at: 1_700_000_000,
            },
        ] {
            let frame = Frame::new("r", metadata);
            assert_eq!(decode(&encode(&frame)).unwrap(), frame);
        }
    }
}
