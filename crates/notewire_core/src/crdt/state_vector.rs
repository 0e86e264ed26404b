use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::id::{OpId, ReplicaId};

/// Per-replica summary of which operations a document copy has seen.
///
/// Maps each replica to the highest clock incorporated from it.
/// Clocks are issued sequentially per replica and operations from one
/// peer are delivered in order, so a single high-water mark per
/// replica is sufficient.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateVector(BTreeMap<ReplicaId, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest clock seen from `replica`, or `None` if nothing seen.
    pub fn get(&self, replica: ReplicaId) -> Option<u64> {
        self.0.get(&replica).copied()
    }

    /// Record that all clocks up to and including `clock` have been
    /// incorporated from `replica`. Never moves backwards.
    pub fn observe(&mut self, replica: ReplicaId, clock: u64) {
        let entry = self.0.entry(replica).or_insert(clock);
        if *entry < clock {
            *entry = clock;
        }
    }

    /// Whether the character/operation identified by `id` is already
    /// reflected in this vector.
    pub fn contains(&self, id: OpId) -> bool {
        self.get(id.replica).is_some_and(|c| c >= id.clock)
    }

    /// The next unused clock for `replica`.
    pub fn next_clock(&self, replica: ReplicaId) -> u64 {
        self.get(replica).map_or(0, |c| c + 1)
    }

    /// Iterate over `(replica, highest clock)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, u64)> + '_ {
        self.0.iter().map(|(r, c)| (*r, *c))
    }

    /// Replicas known to this vector.
    pub fn replicas(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.0.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
