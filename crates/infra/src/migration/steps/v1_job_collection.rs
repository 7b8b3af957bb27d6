use jobdock_core::SchemaVersion;

use crate::document::{EXPIRE_AT_FIELD, IndexSpec, QUEUE_FIELD, STATE_NAME_FIELD};
use crate::migration::step::{MigrationContext, MigrationStep};
use crate::store::StoreError;

/// Create the job collection with its queue index.
#[derive(Debug, Clone, Copy)]
pub struct CreateJobCollection;

#[async_trait::async_trait]
impl MigrationStep for CreateJobCollection {
    fn target_schema(&self) -> SchemaVersion {
        SchemaVersion::new(1)
    }

    fn sequence(&self) -> u32 {
        1
    }

    fn name(&self) -> &'static str {
        "create_job_collection"
    }

    async fn execute(&self, ctx: &MigrationContext<'_>) -> Result<(), StoreError> {
        let collection = &ctx.options.job_collection;
        ctx.store.create_collection(collection).await?;
        ctx.store.create_index(collection, IndexSpec::ascending(QUEUE_FIELD)).await
    }
}

/// Index job state and expiry.
#[derive(Debug, Clone, Copy)]
pub struct IndexJobState;

#[async_trait::async_trait]
impl MigrationStep for IndexJobState {
    fn target_schema(&self) -> SchemaVersion {
        SchemaVersion::new(1)
    }

    fn sequence(&self) -> u32 {
        2
    }

    fn name(&self) -> &'static str {
        "index_job_state"
    }

    async fn execute(&self, ctx: &MigrationContext<'_>) -> Result<(), StoreError> {
        let collection = &ctx.options.job_collection;
        ctx.store.create_index(collection, IndexSpec::ascending(STATE_NAME_FIELD)).await?;
        ctx.store.create_index(collection, IndexSpec::ascending(EXPIRE_AT_FIELD)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageOptions;
    use crate::store::{DocumentStore, InMemoryDocumentStore};

    #[tokio::test]
    async fn creates_collection_and_indexes_idempotently() {
        let store = InMemoryDocumentStore::new();
        let options = StorageOptions::default().with_job_collection("jobs");
        let ctx = MigrationContext {
            store: &store,
            options: &options,
        };

        for _ in 0..2 {
            CreateJobCollection.execute(&ctx).await.unwrap();
            IndexJobState.execute(&ctx).await.unwrap();
        }

        assert_eq!(store.list_collections().await.unwrap(), vec!["jobs".to_string()]);
        assert_eq!(
            store.indexes("jobs"),
            vec![
                IndexSpec::ascending(QUEUE_FIELD),
                IndexSpec::ascending(STATE_NAME_FIELD),
                IndexSpec::ascending(EXPIRE_AT_FIELD),
            ]
        );
    }
}
