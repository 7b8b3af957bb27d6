use std::fmt;
use std::sync::Arc;

use jobdock_core::SchemaVersion;

use crate::config::StorageOptions;
use crate::store::{DocumentStore, StoreError};

/// What a step gets to work with.
pub struct MigrationContext<'a> {
    pub store: &'a dyn DocumentStore,
    pub options: &'a StorageOptions,
}

/// One forward, idempotent schema/data transformation.
///
/// Steps are ordered by `(target_schema, sequence)`. A step may run again if
/// another process raced it before the group's marker was written, so
/// `execute` must tolerate finding its work already done.
#[async_trait::async_trait]
pub trait MigrationStep: Send + Sync {
    fn target_schema(&self) -> SchemaVersion;

    fn sequence(&self) -> u32;

    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &MigrationContext<'_>) -> Result<(), StoreError>;
}

impl fmt::Debug for dyn MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationStep")
            .field("target_schema", &self.target_schema())
            .field("sequence", &self.sequence())
            .field("name", &self.name())
            .finish()
    }
}

pub type StepRef = Arc<dyn MigrationStep>;
