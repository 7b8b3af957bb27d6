//! Document store boundary.
//!
//! The backend treats the store as an external capability: atomic bulk
//! writes, simple reads, collection/index management, a single schema marker
//! record, and (optionally) a live change feed from `jobdock-events`.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use thiserror::Error;

use jobdock_core::SchemaVersion;

use crate::document::{BulkWriteResult, Document, Filter, IndexSpec, WriteOp};

pub use in_memory::InMemoryDocumentStore;
pub use postgres::PostgresDocumentStore;

/// Document store operation error.
///
/// Errors are surfaced unmodified to callers; the store never retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The deployment cannot perform this operation at all.
    #[error("operation not supported by this deployment: {0}")]
    Unsupported(String),

    /// Connectivity problem; retrying later may succeed.
    #[error("connection error: {0}")]
    Connection(String),

    /// A unique index rejected the write.
    #[error("duplicate key on index '{index}': {key}")]
    DuplicateKey { index: String, key: String },

    /// The document is malformed (e.g. missing identity).
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::InvalidDocument(value.to_string())
    }
}

/// Collection-oriented document store.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Apply `ops` in order as one atomic request: all or nothing.
    async fn bulk_write(&self, collection: &str, ops: Vec<WriteOp>) -> Result<BulkWriteResult, StoreError>;

    /// Documents in `collection` matching `filter`, ordered by identity.
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError>;

    async fn list_collections(&self) -> Result<Vec<String>, StoreError>;

    /// Create `collection` if it does not exist.
    async fn create_collection(&self, collection: &str) -> Result<(), StoreError>;

    /// Drop `collection`; returns whether it existed.
    async fn drop_collection(&self, collection: &str) -> Result<bool, StoreError>;

    /// Create `index` on `collection` if it does not exist.
    async fn create_index(&self, collection: &str, index: IndexSpec) -> Result<(), StoreError>;
}

/// Persistence of the single schema marker record.
#[async_trait::async_trait]
pub trait SchemaMarkerStore: Send + Sync {
    /// Current schema version, or `None` for a never-migrated database.
    async fn load_schema_version(&self) -> Result<Option<SchemaVersion>, StoreError>;

    /// Atomically replace the marker with `version`.
    async fn replace_schema_version(&self, version: SchemaVersion) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
impl<S> DocumentStore for Arc<S>
where
    S: DocumentStore + ?Sized,
{
    async fn bulk_write(&self, collection: &str, ops: Vec<WriteOp>) -> Result<BulkWriteResult, StoreError> {
        (**self).bulk_write(collection, ops).await
    }

    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        (**self).find(collection, filter).await
    }

    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        (**self).list_collections().await
    }

    async fn create_collection(&self, collection: &str) -> Result<(), StoreError> {
        (**self).create_collection(collection).await
    }

    async fn drop_collection(&self, collection: &str) -> Result<bool, StoreError> {
        (**self).drop_collection(collection).await
    }

    async fn create_index(&self, collection: &str, index: IndexSpec) -> Result<(), StoreError> {
        (**self).create_index(collection, index).await
    }
}

#[async_trait::async_trait]
impl<S> SchemaMarkerStore for Arc<S>
where
    S: SchemaMarkerStore + ?Sized,
{
    async fn load_schema_version(&self) -> Result<Option<SchemaVersion>, StoreError> {
        (**self).load_schema_version().await
    }

    async fn replace_schema_version(&self, version: SchemaVersion) -> Result<(), StoreError> {
        (**self).replace_schema_version(version).await
    }
}
