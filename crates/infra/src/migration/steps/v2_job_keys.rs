//! `key` field for key-indexed stores.
//!
//! Both steps only do work under `StoreFlavor::KeyIndexed`; on standard
//! stores the version is recorded without changes.

use tracing::info;

use jobdock_core::SchemaVersion;

use crate::document::{Filter, ID_FIELD, IndexSpec, JOB_KIND, KEY_FIELD, Update, WriteOp, identity_string};
use crate::migration::step::{MigrationContext, MigrationStep};
use crate::store::StoreError;
use crate::write_batch::StoreFlavor;

fn key_indexed(ctx: &MigrationContext<'_>) -> bool {
    ctx.options.store_flavor == StoreFlavor::KeyIndexed
}

/// Give existing job documents a `key` equal to their identity.
#[derive(Debug, Clone, Copy)]
pub struct BackfillJobKeys;

#[async_trait::async_trait]
impl MigrationStep for BackfillJobKeys {
    fn target_schema(&self) -> SchemaVersion {
        SchemaVersion::new(2)
    }

    fn sequence(&self) -> u32 {
        1
    }

    fn name(&self) -> &'static str {
        "backfill_job_keys"
    }

    async fn execute(&self, ctx: &MigrationContext<'_>) -> Result<(), StoreError> {
        if !key_indexed(ctx) {
            return Ok(());
        }

        let collection = &ctx.options.job_collection;
        let missing = Filter::And(vec![Filter::kind(JOB_KIND), Filter::missing(KEY_FIELD)]);
        let documents = ctx.store.find(collection, &missing).await?;

        let ops: Vec<WriteOp> = documents
            .iter()
            .filter_map(|doc| {
                let id = doc.id()?;
                let key = doc.get(ID_FIELD).and_then(identity_string)?;
                Some(WriteOp::Update {
                    filter: Filter::Id(id),
                    update: Update::new().set(KEY_FIELD, key),
                })
            })
            .collect();

        if ops.is_empty() {
            return Ok(());
        }
        let result = ctx.store.bulk_write(collection, ops).await?;
        info!(modified = result.modified, "backfilled job keys");
        Ok(())
    }
}

/// Unique index on `key`.
#[derive(Debug, Clone, Copy)]
pub struct UniqueJobKeyIndex;

#[async_trait::async_trait]
impl MigrationStep for UniqueJobKeyIndex {
    fn target_schema(&self) -> SchemaVersion {
        SchemaVersion::new(2)
    }

    fn sequence(&self) -> u32 {
        2
    }

    fn name(&self) -> &'static str {
        "unique_job_key_index"
    }

    async fn execute(&self, ctx: &MigrationContext<'_>) -> Result<(), StoreError> {
        if !key_indexed(ctx) {
            return Ok(());
        }
        ctx.store
            .create_index(&ctx.options.job_collection, IndexSpec::unique(KEY_FIELD))
            .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::StorageOptions;
    use crate::document::{Document, JobDocument};
    use crate::store::{DocumentStore, InMemoryDocumentStore};

    const JOBS: &str = "jobGraph";

    async fn seeded() -> (InMemoryDocumentStore, Vec<JobDocument>) {
        let store = InMemoryDocumentStore::new();
        let jobs = vec![JobDocument::new("{}", "[]"), JobDocument::new("{}", "[]")];
        let mut ops: Vec<WriteOp> = jobs
            .iter()
            .map(|job| WriteOp::Insert(job.to_document().unwrap()))
            .collect();
        ops.push(WriteOp::Insert(
            Document::new(jobdock_core::DocumentId::new()).with_kinds(&["lock"]),
        ));
        store.bulk_write(JOBS, ops).await.unwrap();
        (store, jobs)
    }

    #[tokio::test]
    async fn backfills_keys_then_indexes_them() {
        let (store, jobs) = seeded().await;
        let options = StorageOptions::default().with_store_flavor(StoreFlavor::KeyIndexed);
        let ctx = MigrationContext {
            store: &store,
            options: &options,
        };

        BackfillJobKeys.execute(&ctx).await.unwrap();
        // Second run finds nothing left to do.
        BackfillJobKeys.execute(&ctx).await.unwrap();
        UniqueJobKeyIndex.execute(&ctx).await.unwrap();

        for job in &jobs {
            let stored = store.find(JOBS, &Filter::Id(job.id)).await.unwrap();
            assert_eq!(stored[0].get(KEY_FIELD), Some(&json!(job.id.to_string())));
        }
        let untouched = store.find(JOBS, &Filter::kind("lock")).await.unwrap();
        assert!(!untouched[0].contains(KEY_FIELD));
        assert_eq!(store.indexes(JOBS), vec![IndexSpec::unique(KEY_FIELD)]);
    }

    #[tokio::test]
    async fn standard_flavor_leaves_documents_alone() {
        let (store, _) = seeded().await;
        let options = StorageOptions::default();
        let ctx = MigrationContext {
            store: &store,
            options: &options,
        };

        BackfillJobKeys.execute(&ctx).await.unwrap();
        UniqueJobKeyIndex.execute(&ctx).await.unwrap();

        let keyed = store.find(JOBS, &Filter::Exists(KEY_FIELD.to_string())).await.unwrap();
        assert!(keyed.is_empty());
        assert!(store.indexes(JOBS).is_empty());
    }
}
