//! Storage backend plumbing for the job queue.
//!
//! - `store`: the document store boundary and its in-memory/Postgres backends
//! - `write_batch`: atomic batch commits (with the key-indexed patch)
//! - `semaphore`: per-queue wake-ups for blocked dequeue calls
//! - `notification`: live-feed and polling notification sources
//! - `migration`: versioned schema migrations and the built-in steps
//! - `storage`: the bootstrap tying it together

pub mod config;
pub mod document;
pub mod migration;
pub mod notification;
pub mod semaphore;
pub mod storage;
pub mod store;
pub mod write_batch;

mod integration_tests;

pub use config::{ConfigError, StorageOptions};
pub use document::{Document, Filter, JobDocument, Update, WriteOp};
pub use migration::{MigrationError, MigrationRunner, MigrationStep, MigrationStrategy};
pub use notification::{NotificationStrategy, NotifierError, NotifierHandle, NotifierStatus, QueueNotifier};
pub use semaphore::{JobQueueSemaphore, Wakeup};
pub use storage::{JobStorage, StorageError};
pub use store::{DocumentStore, InMemoryDocumentStore, PostgresDocumentStore, SchemaMarkerStore, StoreError};
pub use write_batch::{StoreFlavor, WriteBatch, WriteBatchExecutor};
