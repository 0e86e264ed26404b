//! Randomized convergence properties for the document CRDT.
//!
//! Replicas edit concurrently in rounds; between rounds each replica
//! receives the others' operations in a different order. All replicas
//! must end with identical visible text, and redelivering the full
//! history must change nothing.

use notewire_core::{DiffOp, Document, Operation, ReplicaId, StateVector, diff};
use proptest::prelude::*;

/// One scripted local edit, interpreted against the replica's
/// current visible length.
#[derive(Debug, Clone)]
enum Edit {
    Insert { pos: u64, text: String },
    Delete { pos: u64, len: u64 },
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        (0u64..64, "[a-z]{1,4}").prop_map(|(pos, text)| Edit::Insert { pos, text }),
        (0u64..64, 1u64..4).prop_map(|(pos, len)| Edit::Delete { pos, len }),
    ]
}

fn apply_edit(doc: &mut Document, edit: &Edit) -> Vec<Operation> {
    match edit {
        Edit::Insert { pos, text } => {
            let pos = pos % (doc.visible_len() + 1);
            vec![doc.local_insert(pos, text)]
        }
        Edit::Delete { pos, len } => {
            let visible = doc.visible_len();
            if visible == 0 {
                return Vec::new();
            }
            doc.local_delete(pos % visible, *len)
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Concurrent editing rounds converge regardless of delivery order.
    #[test]
    fn replicas_converge(script in prop::collection::vec(
        prop::collection::vec(edit_strategy(), 1..4), 1..5,
    )) {
        const REPLICAS: usize = 3;
        let mut docs: Vec<Document> = (0..REPLICAS)
            .map(|i| Document::new("doc", ReplicaId(i as u32 + 1)))
            .collect();
        let mut history: Vec<Operation> = Vec::new();

        for (round, edits) in script.iter().enumerate() {
            // Each replica performs every edit of the round locally,
            // without seeing the others yet.
            let mut round_ops: Vec<Vec<Operation>> = vec![Vec::new(); REPLICAS];
            for (i, doc) in docs.iter_mut().enumerate() {
                for edit in edits {
                    round_ops[i].extend(apply_edit(doc, edit));
                }
            }
            // Deliver cross-replica, each receiver in a rotated order.
            for (i, doc) in docs.iter_mut().enumerate() {
                for k in 1..REPLICAS {
                    let from = (i + k + round) % REPLICAS;
                    if from == i {
                        continue;
                    }
                    for op in &round_ops[from] {
                        doc.apply(op).unwrap();
                    }
                }
            }
            for ops in round_ops {
                history.extend(ops);
            }
        }

        let reference = docs[0].text();
        for doc in &docs[1..] {
            prop_assert_eq!(doc.text(), reference.clone());
        }

        // Idempotence: redelivering the whole history is a no-op.
        for doc in docs.iter_mut() {
            for op in &history {
                let applied = doc.apply(op).unwrap();
                prop_assert!(!applied.accepted);
            }
            prop_assert_eq!(doc.text(), reference.clone());
        }
    }

    /// A replica bootstrapped from an empty state vector via
    /// `diff_since` reconstructs the full document.
    #[test]
    fn diff_since_rebuilds_document(edits in prop::collection::vec(edit_strategy(), 1..12)) {
        let mut source = Document::new("doc", ReplicaId(1));
        for edit in &edits {
            apply_edit(&mut source, edit);
        }

        let ops = source.diff_since(&StateVector::new());
        let mut replica = Document::new("doc", ReplicaId(2));
        for op in &ops {
            replica.apply(op).unwrap();
        }
        prop_assert_eq!(replica.text(), source.text());
        prop_assert_eq!(replica.state_vector(), source.state_vector());
    }

    /// diff(A, B) applied to A reproduces B exactly.
    #[test]
    fn snapshot_diff_round_trips(old in ".{0,40}", new in ".{0,40}") {
        let mut doc = Document::seed_from_text("doc", ReplicaId(1), &old);
        for op in diff(&old, &new) {
            match op {
                DiffOp::Delete { pos, len } => {
                    doc.local_delete(pos, len);
                }
                DiffOp::Insert { pos, text } => {
                    doc.local_insert(pos, &text);
                }
            }
        }
        prop_assert_eq!(doc.text(), new);
    }
}
