//! Document operations and their compact binary encoding.
//!
//! The wire form is byte-oriented with LEB128-style varints:
//! `[tag:1][fields...]`. Lists are prefixed with a varint count.
//! This is what travels in `update` payloads, sync responses, and the
//! persisted operation log.

use serde::{Deserialize, Serialize};

use super::id::{OpId, ReplicaId};
use crate::error::CoreError;

const TAG_INSERT: u8 = 0;
const TAG_DELETE: u8 = 1;

/// A single immutable edit, positioned by character identity rather
/// than integer offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Insert `text` between the characters `origin_left` and
    /// `origin_right` as they existed on the producing replica.
    /// `None` origins denote the document start/end respectively.
    Insert {
        id: OpId,
        origin_left: Option<OpId>,
        origin_right: Option<OpId>,
        text: String,
    },
    /// Tombstone `len` consecutive characters starting at `target`.
    /// The range always lies within a single insert run, so targets
    /// share one replica and a contiguous clock span.
    Delete { id: OpId, target: OpId, len: u64 },
}

impl Operation {
    /// The operation's own identity.
    pub fn id(&self) -> OpId {
        match self {
            Operation::Insert { id, .. } | Operation::Delete { id, .. } => *id,
        }
    }

    /// The last clock this operation occupies on its replica.
    /// Inserts consume one clock per character; deletes consume one.
    pub fn last_clock(&self) -> u64 {
        match self {
            Operation::Insert { id, text, .. } => {
                id.clock + (text.chars().count() as u64).saturating_sub(1)
            }
            Operation::Delete { id, .. } => id.clock,
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.id().replica
    }

    /// Encode a single operation.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Operation::Insert {
                id,
                origin_left,
                origin_right,
                text,
            } => {
                buf.push(TAG_INSERT);
                write_id(buf, *id);
                write_opt_id(buf, *origin_left);
                write_opt_id(buf, *origin_right);
                write_varint(buf, text.len() as u64);
                buf.extend_from_slice(text.as_bytes());
            }
            Operation::Delete { id, target, len } => {
                buf.push(TAG_DELETE);
                write_id(buf, *id);
                write_id(buf, *target);
                write_varint(buf, *len);
            }
        }
    }

    /// Decode a single operation, returning the remaining bytes.
    pub fn decode(data: &[u8]) -> Result<(Self, &[u8]), CoreError> {
        let (&tag, rest) = data
            .split_first()
            .ok_or_else(|| CoreError::Decode("empty operation".into()))?;
        match tag {
            TAG_INSERT => {
                let (id, rest) = read_id(rest)?;
                let (origin_left, rest) = read_opt_id(rest)?;
                let (origin_right, rest) = read_opt_id(rest)?;
                let (len, rest) = read_varint(rest)?;
                let len = len as usize;
                if rest.len() < len {
                    return Err(CoreError::Decode("insert text overruns buffer".into()));
                }
                let text = std::str::from_utf8(&rest[..len])
                    .map_err(|e| CoreError::Decode(format!("insert text not utf-8: {e}")))?
                    .to_string();
                if text.is_empty() {
                    return Err(CoreError::Decode("empty insert".into()));
                }
                Ok((
                    Operation::Insert {
                        id,
                        origin_left,
                        origin_right,
                        text,
                    },
                    &rest[len..],
                ))
            }
            TAG_DELETE => {
                let (id, rest) = read_id(rest)?;
                let (target, rest) = read_id(rest)?;
                let (len, rest) = read_varint(rest)?;
                if len == 0 {
                    return Err(CoreError::Decode("empty delete".into()));
                }
                Ok((Operation::Delete { id, target, len }, rest))
            }
            other => Err(CoreError::Decode(format!("unknown operation tag {other}"))),
        }
    }
}

/// Encode a batch of operations with a count prefix.
pub fn encode_ops(ops: &[Operation]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + ops.len() * 32);
    write_varint(&mut buf, ops.len() as u64);
    for op in ops {
        op.encode_into(&mut buf);
    }
    buf
}

/// Decode a count-prefixed batch of operations. Rejects trailing bytes.
pub fn decode_ops(data: &[u8]) -> Result<Vec<Operation>, CoreError> {
    let (count, mut rest) = read_varint(data)?;
    if count > (data.len() as u64) {
        // Each op occupies at least one byte; an impossible count is
        // a malformed frame, not an allocation request.
        return Err(CoreError::Decode("operation count overruns buffer".into()));
    }
    let mut ops = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (op, r) = Operation::decode(rest)?;
        ops.push(op);
        rest = r;
    }
    if !rest.is_empty() {
        return Err(CoreError::Decode("trailing bytes after operations".into()));
    }
    Ok(ops)
}

// ==================== varint primitives ====================

fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn read_varint(data: &[u8]) -> Result<(u64, &[u8]), CoreError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in data.iter().enumerate() {
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, &data[i + 1..]));
        }
        shift += 7;
        if shift >= 64 {
            return Err(CoreError::Decode("varint too long".into()));
        }
    }
    Err(CoreError::Decode("truncated varint".into()))
}

fn write_id(buf: &mut Vec<u8>, id: OpId) {
    write_varint(buf, id.replica.0 as u64);
    write_varint(buf, id.clock);
}

fn read_id(data: &[u8]) -> Result<(OpId, &[u8]), CoreError> {
    let (replica, rest) = read_varint(data)?;
    let replica = u32::try_from(replica)
        .map_err(|_| CoreError::Decode("replica id out of range".into()))?;
    let (clock, rest) = read_varint(rest)?;
    Ok((OpId::new(ReplicaId(replica), clock), rest))
}

fn write_opt_id(buf: &mut Vec<u8>, id: Option<OpId>) {
    match id {
        Some(id) => {
            buf.push(1);
            write_id(buf, id);
        }
        None => buf.push(0),
    }
}

fn read_opt_id(data: &[u8]) -> Result<(Option<OpId>, &[u8]), CoreError> {
    let (&flag, rest) = data
        .split_first()
        .ok_or_else(|| CoreError::Decode("truncated optional id".into()))?;
    match flag {
        0 => Ok((None, rest)),
        1 => {
            let (id, rest) = read_id(rest)?;
            Ok((Some(id), rest))
        }
        other => Err(CoreError::Decode(format!("bad optional-id flag {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_insert() -> Operation {
        Operation::Insert {
            id: OpId::new(ReplicaId(1), 0),
            origin_left: None,
            origin_right: Some(OpId::new(ReplicaId(2), 300)),
            text: "héllo".to_string(),
        }
    }

    #[test]
    fn insert_round_trips() {
        let op = sample_insert();
        let bytes = op.encode();
        let (decoded, rest) = Operation::decode(&bytes).unwrap();
        assert_eq!(decoded, op);
        assert!(rest.is_empty());
    }

    #[test]
    fn delete_round_trips() {
        let op = Operation::Delete {
            id: OpId::new(ReplicaId(9), 1234),
            target: OpId::new(ReplicaId(1), 2),
            len: 3,
        };
        let bytes = op.encode();
        let (decoded, rest) = Operation::decode(&bytes).unwrap();
        assert_eq!(decoded, op);
        assert!(rest.is_empty());
    }

    #[test]
    fn batch_round_trips() {
        let ops = vec![
            sample_insert(),
            Operation::Delete {
                id: OpId::new(ReplicaId(1), 5),
                target: OpId::new(ReplicaId(1), 0),
                len: 2,
            },
        ];
        let bytes = encode_ops(&ops);
        assert_eq!(decode_ops(&bytes).unwrap(), ops);
    }

    #[test]
    fn truncated_buffers_are_rejected() {
        let bytes = sample_insert().encode();
        for cut in 0..bytes.len() {
            assert!(Operation::decode(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn impossible_count_is_rejected() {
        // Count claims far more operations than bytes available.
        let mut buf = Vec::new();
        write_varint(&mut buf, u64::MAX);
        assert!(decode_ops(&buf).is_err());
    }

    #[test]
    fn last_clock_spans_insert_characters() {
        let op = sample_insert();
        assert_eq!(op.last_clock(), 4); // "héllo" = 5 chars, clocks 0..=4
    }
}
