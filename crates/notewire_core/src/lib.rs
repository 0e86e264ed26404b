//! Core document model for Notewire collaborative editing.
//!
//! This crate is pure data structures: the replicated text CRDT, its
//! operation and state-vector types, the binary operation codec, and
//! the minimal snapshot diff. No I/O, no async; the sync server wires
//! these into rooms, sockets, and storage.

pub mod crdt;
pub mod diff;
pub mod error;

pub use crdt::document::{Applied, Document};
pub use crdt::id::{OpId, ReplicaId};
pub use crdt::op::Operation;
pub use crdt::state_vector::StateVector;
pub use diff::{DiffOp, diff};
pub use error::CoreError;
