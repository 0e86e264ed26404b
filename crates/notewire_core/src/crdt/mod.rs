//! Replicated text document.
//!
//! A run-based sequence CRDT in the RGA/YATA family: every inserted
//! character is identified by an `(replica, clock)` pair, inserts are
//! anchored between the identities of their neighbours at creation
//! time, and deletes tombstone characters instead of removing them.
//! Applying the same operation set in any order converges to the same
//! visible text on every replica.

pub mod document;
pub mod id;
pub mod op;
pub mod state_vector;
pub mod text;
