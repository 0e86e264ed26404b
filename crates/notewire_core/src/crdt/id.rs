use serde::{Deserialize, Serialize};

/// Identifier of one editing replica (a client device or the server).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(pub u32);

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Identity of a single inserted character (or of an operation).
///
/// An insert of `n` characters occupies the clock range
/// `clock..clock + n` on its replica, so any character inside a run
/// can be addressed as `OpId { replica, clock + offset }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub replica: ReplicaId,
    pub clock: u64,
}

impl OpId {
    pub fn new(replica: ReplicaId, clock: u64) -> Self {
        Self { replica, clock }
    }

    /// The id `offset` characters into the run starting at `self`.
    pub fn offset(&self, offset: u64) -> Self {
        Self {
            replica: self.replica,
            clock: self.clock + offset,
        }
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.replica, self.clock)
    }
}
