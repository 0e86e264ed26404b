//! Run-based replicated text sequence.
//!
//! Characters are stored as runs (one insert operation per run, split
//! lazily when later operations address an interior character). Each
//! run remembers the identities of its neighbours at creation time;
//! concurrent inserts between the same neighbours are ordered with the
//! YATA conflict walk so every replica picks the same spot. Deletes
//! tombstone characters in place.

use super::id::OpId;
use super::op::Operation;
use crate::error::CoreError;

#[derive(Debug, Clone)]
struct Run {
    /// Identity of the first character in the run.
    id: OpId,
    text: String,
    /// Character immediately left at creation time; `None` = document start.
    origin_left: Option<OpId>,
    /// Character immediately right at creation time; `None` = document end.
    origin_right: Option<OpId>,
    deleted: bool,
}

impl Run {
    fn char_len(&self) -> u64 {
        self.text.chars().count() as u64
    }

    /// Whether `id` addresses a character inside this run.
    fn contains(&self, id: OpId) -> bool {
        id.replica == self.id.replica
            && id.clock >= self.id.clock
            && id.clock < self.id.clock + self.char_len()
    }

    /// Identity of the last character in the run.
    fn last_char(&self) -> OpId {
        self.id.offset(self.char_len() - 1)
    }
}

/// One contiguous span of characters to delete, produced when mapping
/// a visible range onto runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteSegment {
    pub first: OpId,
    pub len: u64,
}

/// The replicated character sequence of one document.
#[derive(Debug, Default)]
pub struct TextSequence {
    runs: Vec<Run>,
}

impl TextSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Visible (non-tombstoned) text.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for run in &self.runs {
            if !run.deleted {
                out.push_str(&run.text);
            }
        }
        out
    }

    /// Number of visible characters.
    pub fn visible_len(&self) -> u64 {
        self.runs
            .iter()
            .filter(|r| !r.deleted)
            .map(Run::char_len)
            .sum()
    }

    // ==================== anchor resolution ====================

    /// Resolve the `(origin_left, origin_right)` pair for an insert at
    /// visible position `pos`. The right anchor is the immediate
    /// successor of the left anchor in full (tombstones included)
    /// order, which keeps concurrent edits around deletions tight.
    pub fn anchors_at(&self, pos: u64) -> (Option<OpId>, Option<OpId>) {
        if pos == 0 {
            return (None, self.runs.first().map(|r| r.id));
        }
        let mut visible = 0u64;
        for (i, run) in self.runs.iter().enumerate() {
            if run.deleted {
                continue;
            }
            let len = run.char_len();
            if visible + len >= pos {
                let offset = pos - visible - 1;
                let left = run.id.offset(offset);
                let right = if offset + 1 < len {
                    Some(run.id.offset(offset + 1))
                } else {
                    self.runs.get(i + 1).map(|r| r.id)
                };
                return (Some(left), right);
            }
            visible += len;
        }
        // pos beyond the visible end: anchor at the very end.
        (self.last_char(), None)
    }

    fn last_char(&self) -> Option<OpId> {
        self.runs.last().map(Run::last_char)
    }

    /// Map the visible range `[start, start + len)` onto contiguous
    /// character-identity segments, one per overlapped run.
    pub fn visible_segments(&self, start: u64, len: u64) -> Vec<DeleteSegment> {
        let mut segments = Vec::new();
        let end = start + len;
        let mut visible = 0u64;
        for run in &self.runs {
            if run.deleted {
                continue;
            }
            let run_len = run.char_len();
            let run_start = visible;
            let run_end = visible + run_len;
            if run_end > start && run_start < end {
                let from = start.max(run_start) - run_start;
                let to = end.min(run_end) - run_start;
                segments.push(DeleteSegment {
                    first: run.id.offset(from),
                    len: to - from,
                });
            }
            visible = run_end;
            if visible >= end {
                break;
            }
        }
        segments
    }

    // ==================== run splitting ====================

    fn find_char(&self, id: OpId) -> Option<(usize, u64)> {
        self.runs
            .iter()
            .position(|r| r.contains(id))
            .map(|i| (i, id.clock - self.runs[i].id.clock))
    }

    /// Split so the character at `(idx, offset)` becomes the last
    /// character of its run.
    fn split_after(&mut self, idx: usize, offset: u64) {
        let run = &self.runs[idx];
        if offset + 1 >= run.char_len() {
            return;
        }
        let split_at = run
            .text
            .char_indices()
            .nth((offset + 1) as usize)
            .map(|(i, _)| i)
            .expect("offset within run");
        let run = &mut self.runs[idx];
        let tail_text = run.text.split_off(split_at);
        let tail = Run {
            id: run.id.offset(offset + 1),
            text: tail_text,
            origin_left: Some(run.id.offset(offset)),
            origin_right: run.origin_right,
            deleted: run.deleted,
        };
        self.runs.insert(idx + 1, tail);
    }

    /// Split so the character at `(idx, offset)` becomes the first
    /// character of a run, returning that run's index.
    fn split_before(&mut self, idx: usize, offset: u64) -> usize {
        if offset == 0 {
            return idx;
        }
        self.split_after(idx, offset - 1);
        idx + 1
    }

    // ==================== integration ====================

    /// Integrate a remote or local insert operation. The caller has
    /// already dealt with idempotence; unknown anchors are an error.
    pub fn integrate_insert(
        &mut self,
        id: OpId,
        origin_left: Option<OpId>,
        origin_right: Option<OpId>,
        text: &str,
    ) -> Result<(), CoreError> {
        // Normalize anchors onto run boundaries.
        let left_idx = match origin_left {
            None => None,
            Some(ol) => {
                let (idx, offset) = self
                    .find_char(ol)
                    .ok_or(CoreError::UnknownOrigin(ol))?;
                self.split_after(idx, offset);
                Some(idx)
            }
        };
        let right_bound = match origin_right {
            None => self.runs.len(),
            Some(or) => {
                let (idx, offset) = self
                    .find_char(or)
                    .ok_or(CoreError::UnknownOrigin(or))?;
                self.split_before(idx, offset)
            }
        };

        // YATA conflict walk: pick a deterministic spot among runs that
        // were inserted concurrently between the same anchors.
        let mut left = left_idx;
        let start = left_idx.map_or(0, |i| i + 1);
        let mut walked: Vec<usize> = Vec::new();
        let mut conflicting: Vec<usize> = Vec::new();
        for o in start..right_bound {
            let run = &self.runs[o];
            walked.push(o);
            conflicting.push(o);
            if run.origin_left == origin_left {
                if run.id.replica < id.replica {
                    left = Some(o);
                    conflicting.clear();
                } else if run.origin_right == origin_right {
                    break;
                }
            } else {
                let in_walked = run
                    .origin_left
                    .is_some_and(|ol| walked.iter().any(|&i| self.runs[i].contains(ol)));
                if in_walked {
                    let in_conflicting = run
                        .origin_left
                        .is_some_and(|ol| conflicting.iter().any(|&i| self.runs[i].contains(ol)));
                    if !in_conflicting {
                        left = Some(o);
                        conflicting.clear();
                    }
                } else {
                    break;
                }
            }
        }

        let insert_at = left.map_or(0, |i| i + 1);
        self.runs.insert(
            insert_at,
            Run {
                id,
                text: text.to_string(),
                origin_left,
                origin_right,
                deleted: false,
            },
        );
        Ok(())
    }

    /// Tombstone `len` characters starting at `target`. The range is
    /// clock-contiguous on one replica but may have been split across
    /// several runs by interleaved inserts.
    pub fn apply_delete(&mut self, target: OpId, len: u64) -> Result<(), CoreError> {
        let mut cursor = target;
        let mut remaining = len;
        while remaining > 0 {
            let (idx, offset) = self
                .find_char(cursor)
                .ok_or(CoreError::UnknownTarget(cursor))?;
            let idx = self.split_before(idx, offset);
            let run_len = self.runs[idx].char_len();
            let take = run_len.min(remaining);
            self.split_after(idx, take - 1);
            self.runs[idx].deleted = true;
            cursor = cursor.offset(take);
            remaining -= take;
        }
        Ok(())
    }

    /// Rebuild the document's operation history in causal order:
    /// every run becomes an insert (splits re-merged by construction)
    /// and tombstones are recorded by the delete ops the caller tracks.
    /// Used only by tests and sanity checks; the document keeps the
    /// authoritative log.
    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    /// Check that an operation's anchors are known without mutating
    /// anything. Used to reject poison operations before logging them.
    pub fn can_apply(&self, op: &Operation) -> Result<(), CoreError> {
        match op {
            Operation::Insert {
                origin_left,
                origin_right,
                ..
            } => {
                if let Some(ol) = origin_left
                    && self.find_char(*ol).is_none()
                {
                    return Err(CoreError::UnknownOrigin(*ol));
                }
                if let Some(or) = origin_right
                    && self.find_char(*or).is_none()
                {
                    return Err(CoreError::UnknownOrigin(*or));
                }
                Ok(())
            }
            Operation::Delete { target, len, .. } => {
                // Every character of the span must exist.
                for off in 0..*len {
                    let ch = target.offset(off);
                    if self.find_char(ch).is_none() {
                        return Err(CoreError::UnknownTarget(ch));
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::id::ReplicaId;

    fn id(replica: u32, clock: u64) -> OpId {
        OpId::new(ReplicaId(replica), clock)
    }

    #[test]
    fn sequential_inserts_build_text() {
        let mut seq = TextSequence::new();
        seq.integrate_insert(id(1, 0), None, None, "hello").unwrap();
        let (l, r) = seq.anchors_at(5);
        seq.integrate_insert(id(1, 5), l, r, " world").unwrap();
        assert_eq!(seq.text(), "hello world");
    }

    #[test]
    fn insert_mid_run_splits() {
        let mut seq = TextSequence::new();
        seq.integrate_insert(id(1, 0), None, None, "abcd").unwrap();
        let (l, r) = seq.anchors_at(2);
        assert_eq!(l, Some(id(1, 1)));
        assert_eq!(r, Some(id(1, 2)));
        seq.integrate_insert(id(1, 4), l, r, "XY").unwrap();
        assert_eq!(seq.text(), "abXYcd");
        assert_eq!(seq.run_count(), 3);
    }

    #[test]
    fn concurrent_inserts_at_same_anchor_converge() {
        // Both replicas insert at position 0 of an empty doc.
        let a = (id(1, 0), "A");
        let b = (id(2, 0), "B");

        let mut one = TextSequence::new();
        one.integrate_insert(a.0, None, None, a.1).unwrap();
        one.integrate_insert(b.0, None, None, b.1).unwrap();

        let mut two = TextSequence::new();
        two.integrate_insert(b.0, None, None, b.1).unwrap();
        two.integrate_insert(a.0, None, None, a.1).unwrap();

        assert_eq!(one.text(), two.text());
        assert_eq!(one.text(), "AB"); // lower replica id wins the left slot
    }

    #[test]
    fn delete_spans_interleaved_runs() {
        let mut seq = TextSequence::new();
        seq.integrate_insert(id(1, 0), None, None, "abcd").unwrap();
        // Concurrent insert splits the original run between b and c.
        seq.integrate_insert(id(2, 0), Some(id(1, 1)), Some(id(1, 2)), "XX")
            .unwrap();
        assert_eq!(seq.text(), "abXXcd");
        // Delete the original b..d range: clock-contiguous on replica 1
        // even though runs are now interleaved.
        seq.apply_delete(id(1, 1), 3).unwrap();
        assert_eq!(seq.text(), "aXX");
    }

    #[test]
    fn delete_then_insert_at_tombstone_anchor() {
        let mut seq = TextSequence::new();
        seq.integrate_insert(id(1, 0), None, None, "abc").unwrap();
        seq.apply_delete(id(1, 1), 1).unwrap();
        assert_eq!(seq.text(), "ac");
        // Insert anchored on the tombstoned character still works.
        seq.integrate_insert(id(2, 0), Some(id(1, 1)), Some(id(1, 2)), "Z")
            .unwrap();
        assert_eq!(seq.text(), "aZc");
    }

    #[test]
    fn unknown_origin_is_rejected() {
        let mut seq = TextSequence::new();
        let err = seq
            .integrate_insert(id(2, 0), Some(id(9, 0)), None, "X")
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownOrigin(_)));
        assert_eq!(seq.text(), "");
    }

    #[test]
    fn unknown_delete_target_is_rejected() {
        let mut seq = TextSequence::new();
        seq.integrate_insert(id(1, 0), None, None, "ab").unwrap();
        let err = seq.apply_delete(id(1, 1), 5).unwrap_err();
        assert!(matches!(err, CoreError::UnknownTarget(_)));
    }

    #[test]
    fn anchors_past_end_clamp_to_tail() {
        let mut seq = TextSequence::new();
        seq.integrate_insert(id(1, 0), None, None, "ab").unwrap();
        let (l, r) = seq.anchors_at(2);
        assert_eq!(l, Some(id(1, 1)));
        assert_eq!(r, None);
    }
}
