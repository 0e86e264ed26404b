//! Per-document CRDT state: the character sequence, the operation
//! log, and the state vector that makes application idempotent.

use tracing::warn;

use super::id::{OpId, ReplicaId};
use super::op::{self, Operation};
use super::state_vector::StateVector;
use super::text::TextSequence;
use crate::error::CoreError;

/// Result of applying one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    /// False when the operation was already reflected in the state
    /// vector (redelivery) and nothing changed.
    pub accepted: bool,
}

/// A replicated text document.
///
/// All mutation goes through [`Document::apply`] (remote operations)
/// or the `local_*` methods (edits originated here, which mint fresh
/// operation ids). The operation log is kept in application order,
/// which is causally valid for replay: every operation's anchors were
/// present when it was appended.
pub struct Document {
    id: String,
    replica: ReplicaId,
    seq: TextSequence,
    state: StateVector,
    log: Vec<Operation>,
}

impl Document {
    pub fn new(id: impl Into<String>, replica: ReplicaId) -> Self {
        Self {
            id: id.into(),
            replica,
            seq: TextSequence::new(),
            state: StateVector::new(),
            log: Vec::new(),
        }
    }

    /// Seed an empty document from legacy plain text (migration path
    /// for documents that predate the operation log). Produces a
    /// single insert attributed to this replica.
    pub fn seed_from_text(id: impl Into<String>, replica: ReplicaId, text: &str) -> Self {
        let mut doc = Self::new(id, replica);
        if !text.is_empty() {
            doc.local_insert(0, text);
        }
        doc
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Current visible text.
    pub fn text(&self) -> String {
        self.seq.text()
    }

    pub fn visible_len(&self) -> u64 {
        self.seq.visible_len()
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    // ==================== local edits ====================

    /// Insert `text` at visible character position `pos` (clamped to
    /// the document end), returning the operation to broadcast.
    pub fn local_insert(&mut self, pos: u64, text: &str) -> Operation {
        let pos = pos.min(self.seq.visible_len());
        let (origin_left, origin_right) = self.seq.anchors_at(pos);
        let id = OpId::new(self.replica, self.state.next_clock(self.replica));
        let op = Operation::Insert {
            id,
            origin_left,
            origin_right,
            text: text.to_string(),
        };
        self.seq
            .integrate_insert(id, origin_left, origin_right, text)
            .expect("local insert anchors exist");
        self.record(&op);
        op
    }

    /// Delete `len` visible characters starting at `pos`, returning
    /// one operation per underlying run segment.
    pub fn local_delete(&mut self, pos: u64, len: u64) -> Vec<Operation> {
        let visible = self.seq.visible_len();
        if pos >= visible || len == 0 {
            return Vec::new();
        }
        let len = len.min(visible - pos);
        let segments = self.seq.visible_segments(pos, len);
        let mut ops = Vec::with_capacity(segments.len());
        for segment in segments {
            let id = OpId::new(self.replica, self.state.next_clock(self.replica));
            let op = Operation::Delete {
                id,
                target: segment.first,
                len: segment.len,
            };
            self.seq
                .apply_delete(segment.first, segment.len)
                .expect("local delete targets exist");
            self.record(&op);
            ops.push(op);
        }
        ops
    }

    // ==================== remote application ====================

    /// Apply a remote operation.
    ///
    /// Idempotent: an operation whose clocks are already covered by
    /// the state vector is a successful no-op (peers may redeliver).
    /// Operations referencing unknown origins are rejected without
    /// touching any state and must not be forwarded.
    pub fn apply(&mut self, op: &Operation) -> Result<Applied, CoreError> {
        if self.state.contains(OpId::new(op.replica(), op.last_clock())) {
            return Ok(Applied { accepted: false });
        }
        // Validate anchors before mutating so a poison operation
        // cannot leave a half-applied sequence.
        self.seq.can_apply(op)?;
        match op {
            Operation::Insert {
                id,
                origin_left,
                origin_right,
                text,
            } => {
                self.seq
                    .integrate_insert(*id, *origin_left, *origin_right, text)?;
            }
            Operation::Delete { target, len, .. } => {
                self.seq.apply_delete(*target, *len)?;
            }
        }
        self.record(op);
        Ok(Applied { accepted: true })
    }

    fn record(&mut self, op: &Operation) {
        self.state.observe(op.replica(), op.last_clock());
        self.log.push(op.clone());
    }

    // ==================== sync ====================

    /// Operations the holder of `since` is missing, in causal
    /// (application) order. An empty vector answers a fully
    /// up-to-date peer.
    pub fn diff_since(&self, since: &StateVector) -> Vec<Operation> {
        self.log
            .iter()
            .filter(|op| match since.get(op.replica()) {
                None => true,
                Some(seen) => op.last_clock() > seen,
            })
            .cloned()
            .collect()
    }

    // ==================== snapshots ====================

    /// Serialize the full document history for a snapshot log entry.
    pub fn encode_state(&self) -> Vec<u8> {
        op::encode_ops(&self.log)
    }

    /// Reconstruct a document from a snapshot produced by
    /// [`Document::encode_state`], then replay `tail` entries on top.
    /// Undecodable or unappliable rows are skipped with a warning so
    /// one bad row cannot take the whole document offline.
    pub fn from_state(
        id: impl Into<String>,
        replica: ReplicaId,
        snapshot: Option<&[u8]>,
        tail: impl IntoIterator<Item = Vec<u8>>,
    ) -> Result<Self, CoreError> {
        let mut doc = Self::new(id, replica);
        if let Some(bytes) = snapshot {
            let ops = op::decode_ops(bytes)
                .map_err(|e| CoreError::BadState(format!("snapshot: {e}")))?;
            doc.replay(ops);
        }
        for entry in tail {
            match op::decode_ops(&entry) {
                Ok(ops) => doc.replay(ops),
                Err(e) => warn!(document = %doc.id, "skipping undecodable log entry: {e}"),
            }
        }
        Ok(doc)
    }

    fn replay(&mut self, ops: Vec<Operation>) {
        for op in ops {
            if let Err(e) = self.apply(&op) {
                warn!(document = %self.id, op = %op.id(), "skipping unappliable logged op: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_edits_round_trip_through_apply() {
        let mut a = Document::new("d", ReplicaId(1));
        let mut b = Document::new("d", ReplicaId(2));

        let op1 = a.local_insert(0, "hello");
        let op2 = a.local_insert(5, " world");
        let dels = a.local_delete(0, 1);

        for op in [op1, op2].iter().chain(dels.iter()) {
            b.apply(op).unwrap();
        }
        assert_eq!(a.text(), "ello world");
        assert_eq!(b.text(), a.text());
    }

    #[test]
    fn apply_is_idempotent() {
        let mut a = Document::new("d", ReplicaId(1));
        let mut b = Document::new("d", ReplicaId(2));
        let op = a.local_insert(0, "hi");

        assert!(b.apply(&op).unwrap().accepted);
        let second = b.apply(&op).unwrap();
        assert!(!second.accepted);
        assert_eq!(b.text(), "hi");
        assert_eq!(b.log_len(), 1);
    }

    #[test]
    fn concurrent_inserts_at_zero_converge() {
        let mut a = Document::new("d", ReplicaId(1));
        let mut b = Document::new("d", ReplicaId(2));

        let op_a = a.local_insert(0, "A");
        let op_b = b.local_insert(0, "B");

        a.apply(&op_b).unwrap();
        b.apply(&op_a).unwrap();

        assert_eq!(a.text(), b.text());
        assert_eq!(a.text().len(), 2);
    }

    #[test]
    fn diff_since_empty_vector_returns_everything() {
        let mut a = Document::new("d", ReplicaId(1));
        a.local_insert(0, "abc");
        a.local_delete(1, 1);

        let ops = a.diff_since(&StateVector::new());
        let mut b = Document::new("d", ReplicaId(2));
        for op in &ops {
            b.apply(op).unwrap();
        }
        assert_eq!(b.text(), "ac");
    }

    #[test]
    fn diff_since_omits_seen_operations() {
        let mut a = Document::new("d", ReplicaId(1));
        let first = a.local_insert(0, "x");

        let mut b = Document::new("d", ReplicaId(2));
        b.apply(&first).unwrap();

        a.local_insert(1, "y");
        let missing = a.diff_since(b.state_vector());
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].id().clock, 1);
    }

    #[test]
    fn poison_op_is_rejected_without_side_effects() {
        let mut a = Document::new("d", ReplicaId(1));
        a.local_insert(0, "ok");
        let bad = Operation::Insert {
            id: OpId::new(ReplicaId(9), 0),
            origin_left: Some(OpId::new(ReplicaId(8), 44)),
            origin_right: None,
            text: "poison".into(),
        };
        assert!(a.apply(&bad).is_err());
        assert_eq!(a.text(), "ok");
        assert_eq!(a.log_len(), 1);
        // The poison op's replica never enters the state vector.
        assert!(a.state_vector().get(ReplicaId(9)).is_none());
    }

    #[test]
    fn snapshot_state_round_trips() {
        let mut a = Document::new("d", ReplicaId(1));
        a.local_insert(0, "hello world");
        a.local_delete(5, 6);
        let state = a.encode_state();

        let b = Document::from_state("d", ReplicaId(2), Some(&state), []).unwrap();
        assert_eq!(b.text(), "hello");
        assert_eq!(b.state_vector(), a.state_vector());
    }

    #[test]
    fn seed_from_text_matches_content() {
        let doc = Document::seed_from_text("d", ReplicaId(5), "legacy body");
        assert_eq!(doc.text(), "legacy body");
        assert_eq!(doc.log_len(), 1);
    }
}
