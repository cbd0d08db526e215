//! Durable persistence of the current token record
//!
//! The keeper is the sole owner of a store; everything else sees tokens only
//! through the keeper's published copies.

use async_trait::async_trait;
use thiserror::Error;

use crate::tokens::TokenRecord;

pub mod file;
pub mod memory;

pub use file::FileTokenStore;
pub use memory::InMemoryTokenStore;

/// An error reading or writing the persisted token record
#[derive(Debug, Error)]
pub enum StorageError {
    /// The underlying storage could not be read or written
    #[error("failed to read or write token storage")]
    Io(#[from] std::io::Error),
    /// The stored record could not be decoded
    #[error("stored token record is malformed")]
    Malformed(#[from] serde_json::Error),
    /// The stored record was written by an incompatible schema
    #[error("stored token record has schema version {found}, supported version is {supported}")]
    UnsupportedSchema {
        /// The version found in storage
        found: u32,
        /// The version this build reads and writes
        supported: u32,
    },
}

/// A durable backend for the current token record
///
/// Implementations must make `save` atomic: a crash mid-write leaves either
/// the previous record or the new one, never a torn record. A managed secret
/// service can replace the file backend by implementing this trait.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Loads the persisted record, or `None` if no token has ever been saved
    async fn load(&mut self) -> Result<Option<TokenRecord>, StorageError>;

    /// Durably persists the record, replacing any previous one
    async fn save(&mut self, record: &TokenRecord) -> Result<(), StorageError>;
}
