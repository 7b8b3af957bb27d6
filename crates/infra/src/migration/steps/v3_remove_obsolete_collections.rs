use tracing::info;

use jobdock_core::SchemaVersion;

use crate::migration::step::{MigrationContext, MigrationStep};
use crate::store::StoreError;

/// Collections from the polling-table era, superseded by the change feed.
pub const OBSOLETE_COLLECTIONS: [&str; 3] = ["notifications", "_jobQueue", "signal"];

/// Drop obsolete collections when they exist.
#[derive(Debug, Clone, Copy)]
pub struct RemoveObsoleteCollections;

#[async_trait::async_trait]
impl MigrationStep for RemoveObsoleteCollections {
    fn target_schema(&self) -> SchemaVersion {
        SchemaVersion::new(3)
    }

    fn sequence(&self) -> u32 {
        99
    }

    fn name(&self) -> &'static str {
        "remove_obsolete_collections"
    }

    async fn execute(&self, ctx: &MigrationContext<'_>) -> Result<(), StoreError> {
        let existing = ctx.store.list_collections().await?;
        for name in OBSOLETE_COLLECTIONS {
            if existing.iter().any(|c| c == name) && ctx.store.drop_collection(name).await? {
                info!(collection = name, "dropped obsolete collection");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageOptions;
    use crate::store::{DocumentStore, InMemoryDocumentStore};

    #[tokio::test]
    async fn drops_only_obsolete_collections() {
        let store = InMemoryDocumentStore::new();
        for name in ["jobGraph", "signal", "_jobQueue"] {
            store.create_collection(name).await.unwrap();
        }
        let options = StorageOptions::default();
        let ctx = MigrationContext {
            store: &store,
            options: &options,
        };

        RemoveObsoleteCollections.execute(&ctx).await.unwrap();
        RemoveObsoleteCollections.execute(&ctx).await.unwrap();

        assert_eq!(store.list_collections().await.unwrap(), vec!["jobGraph".to_string()]);
    }
}
