use crate::crdt::id::OpId;

/// Errors produced by the core document model.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// An operation referenced an origin this replica has never seen.
    /// Such operations are dropped by the caller and must not be
    /// forwarded to other peers.
    #[error("operation references unknown origin {0}")]
    UnknownOrigin(OpId),

    /// A delete targeted a character range that does not exist.
    #[error("delete targets unknown character {0}")]
    UnknownTarget(OpId),

    /// Malformed binary operation data.
    #[error("malformed operation encoding: {0}")]
    Decode(String),

    /// Malformed snapshot state data.
    #[error("malformed document state: {0}")]
    BadState(String),
}
