use std::sync::Arc;

use crate::db::{Store, UserIdentity};
use crate::error::ServerError;

/// Resolves connection credentials to a user identity.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<UserIdentity, ServerError>;
}

/// Decides whether a user may join and edit a document room.
pub trait AccessControl: Send + Sync {
    fn can_edit(&self, user_id: &str, document_id: &str) -> Result<bool, ServerError>;
}

/// Token-table authenticator backed by the sqlite store.
pub struct StoreAuth {
    store: Arc<Store>,
}

impl StoreAuth {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

impl Authenticator for StoreAuth {
    fn authenticate(&self, token: &str) -> Result<UserIdentity, ServerError> {
        self.store
            .validate_token(token)?
            .ok_or(ServerError::Auth)
    }
}

impl AccessControl for StoreAuth {
    fn can_edit(&self, user_id: &str, document_id: &str) -> Result<bool, ServerError> {
        Ok(self.store.has_edit_access(user_id, document_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> StoreAuth {
        StoreAuth::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    #[test]
    fn test_unknown_token_is_auth_error() {
        let auth = auth();
        assert!(matches!(
            auth.authenticate("nope"),
            Err(ServerError::Auth)
        ));
    }

    #[test]
    fn test_valid_token_resolves_identity() {
        let auth = auth();
        auth.store
            .insert_token("tok", "alice", Some("Alice"), None)
            .unwrap();
        let identity = auth.authenticate("tok").unwrap();
        assert_eq!(identity.user_id, "alice");
    }

    #[test]
    fn test_access_defaults_closed() {
        let auth = auth();
        assert!(!auth.can_edit("alice", "doc-1").unwrap());
        auth.store.grant_access("alice", "doc-1", true).unwrap();
        assert!(auth.can_edit("alice", "doc-1").unwrap());
    }
}
