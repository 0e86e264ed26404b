use notewire_core::CoreError;
use notewire_sync::ProtocolError;

/// Server-side error taxonomy.
///
/// Connection-local failures (`Protocol`, `AccessDenied`) are answered
/// with an `error` envelope and never touch shared state. `Merge`
/// failures are dropped and logged, never forwarded. `Persistence`
/// failures only delay durability; the in-memory document stays
/// authoritative.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("authentication failed")]
    Auth,

    #[error("user {user_id} has no access to {target}")]
    AccessDenied { user_id: String, target: String },

    #[error("merge rejected: {0}")]
    Merge(#[from] CoreError),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("document worker for {0} is gone")]
    DocumentGone(String),
}

impl From<rusqlite::Error> for ServerError {
    fn from(e: rusqlite::Error) -> Self {
        ServerError::Persistence(e.to_string())
    }
}
