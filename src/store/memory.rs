//! An in-memory token store for tests and ephemeral deployments

use async_trait::async_trait;

use super::{StorageError, TokenStore};
use crate::tokens::TokenRecord;

/// A token store that keeps the record in process memory only
///
/// Tokens stored here do not survive a restart; use the file store for
/// anything that must.
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    record: Option<TokenRecord>,
}

impl InMemoryTokenStore {
    /// Constructs an empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Constructs a store pre-seeded with a record
    pub fn with_record(record: TokenRecord) -> Self {
        Self {
            record: Some(record),
        }
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn load(&mut self) -> Result<Option<TokenRecord>, StorageError> {
        Ok(self.record.as_ref().map(TokenRecord::clone_it))
    }

    async fn save(&mut self, record: &TokenRecord) -> Result<(), StorageError> {
        self.record = Some(record.clone_it());
        Ok(())
    }
}
