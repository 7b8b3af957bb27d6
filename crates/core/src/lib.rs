//! `jobdock-core`: shared building blocks for the job storage backend.
//!
//! This crate holds **pure** primitives (no IO): document identities, queue
//! names and schema versions.

pub mod error;
pub mod id;
pub mod schema;

pub use error::{DomainError, DomainResult};
pub use id::{DocumentId, QueueName};
pub use schema::SchemaVersion;
