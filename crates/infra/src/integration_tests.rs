//! Integration tests for the full storage pipeline.
//!
//! Tests: open (migrations) → commit → change feed → release → wake
//!
//! Verifies:
//! - A fresh database is migrated to the latest version before use
//! - Enqueued jobs wake blocked dequeue waits through either notifier
//! - Startup fails cleanly on topology and configuration errors

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use jobdock_core::{QueueName, SchemaVersion};
    use jobdock_events::FeedError;

    use crate::config::{ConfigError, StorageOptions};
    use crate::document::{Filter, IndexSpec, JobDocument, KEY_FIELD};
    use crate::migration::{MigrationError, MigrationStrategy, steps};
    use crate::notification::{NotificationStrategy, NotifierError};
    use crate::semaphore::Wakeup;
    use crate::storage::{JobStorage, StorageError};
    use crate::store::{DocumentStore, InMemoryDocumentStore, SchemaMarkerStore};
    use crate::write_batch::StoreFlavor;

    fn q(name: &str) -> QueueName {
        QueueName::new(name).unwrap()
    }

    #[tokio::test]
    async fn fresh_database_is_migrated_on_open() {
        let store = InMemoryDocumentStore::arc();
        store.create_collection("signal").await.unwrap();

        let storage = JobStorage::open(Arc::clone(&store), StorageOptions::default())
            .await
            .unwrap();

        assert_eq!(storage.schema_version(), steps::latest_version());
        assert_eq!(store.load_schema_version().await.unwrap(), Some(steps::latest_version()));
        // One marker write per version group.
        assert_eq!(store.marker_writes(), 3);
        assert_eq!(store.list_collections().await.unwrap(), vec!["jobGraph".to_string()]);
        assert_eq!(storage.notification_strategy(), NotificationStrategy::LiveFeed);

        storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn up_to_date_database_is_not_touched() {
        let store = Arc::new(InMemoryDocumentStore::new().with_schema_version(steps::latest_version()));
        let options = StorageOptions::default().with_migration_strategy(MigrationStrategy::Throw);

        let storage = JobStorage::open(Arc::clone(&store), options).await.unwrap();

        assert_eq!(store.marker_writes(), 0);
        storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn enqueue_wakes_waiter_through_change_feed() {
        let store = InMemoryDocumentStore::arc();
        let storage = Arc::new(
            JobStorage::open(Arc::clone(&store), StorageOptions::default())
                .await
                .unwrap(),
        );

        // Wait until the watcher subscribed so the enqueue is observed live.
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.feed().subscriber_count() == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        let waiter = {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move {
                storage
                    .wait_for_work(&[q("critical"), q("emails")], Duration::from_secs(10))
                    .await
            })
        };
        while storage.semaphore().waiters(&q("emails")) == 0 {
            tokio::task::yield_now().await;
        }

        let job = JobDocument::new("{\"type\":\"Mailer\"}", "[]");
        let mut batch = storage.write_batch();
        batch.insert_job(&job).unwrap();
        storage.commit(batch).await.unwrap();

        let mut batch = storage.write_batch();
        batch.enqueue(job.id, &q("emails"));
        storage.commit(batch).await.unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), Wakeup::Released(q("emails")));

        let storage = Arc::try_unwrap(storage).unwrap();
        storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn polling_fallback_on_store_without_change_feed() {
        let store = Arc::new(InMemoryDocumentStore::without_change_feed("standalone"));
        let options = StorageOptions::default()
            .with_notification_strategy(NotificationStrategy::Auto)
            .with_poll_interval(Duration::from_millis(10))
            .with_queues(vec![q("default")]);

        let storage = JobStorage::open(Arc::clone(&store), options).await.unwrap();
        assert_eq!(storage.notification_strategy(), NotificationStrategy::Polling);

        let wakeup = storage
            .wait_for_work(&[q("default")], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(wakeup, Wakeup::Released(q("default")));

        storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn live_feed_on_store_without_change_feed_is_fatal() {
        let store = Arc::new(InMemoryDocumentStore::without_change_feed("standalone"));

        let err = JobStorage::open(store, StorageOptions::default()).await.unwrap_err();

        assert!(matches!(err, StorageError::Notifier(NotifierError::FeedUnsupported(_))));
    }

    #[tokio::test]
    async fn feed_lost_after_open_fails_pending_and_later_waits() {
        let store = InMemoryDocumentStore::arc();
        let storage = Arc::new(
            JobStorage::open(Arc::clone(&store), StorageOptions::default())
                .await
                .unwrap(),
        );
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.feed().subscriber_count() == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        let waiter = {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move { storage.wait_for_work(&[q("emails")], Duration::from_secs(30)).await })
        };
        while storage.semaphore().waiters(&q("emails")) == 0 {
            tokio::task::yield_now().await;
        }

        store.feed().fail_subscribers(FeedError::unsupported("replica set removed"));

        let err = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, StorageError::Notifier(NotifierError::FeedUnsupported(_))));
        assert_eq!(storage.semaphore().waiters(&q("emails")), 0);

        assert!(matches!(storage.notifier_error(), Some(NotifierError::FeedUnsupported(_))));
        let err = storage
            .wait_for_work(&[q("emails")], Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Notifier(NotifierError::FeedUnsupported(_))));
        assert!(matches!(storage.notifier_failed().await, NotifierError::FeedUnsupported(_)));

        let storage = Arc::try_unwrap(storage).unwrap();
        assert!(matches!(
            storage.shutdown().await,
            Err(StorageError::Notifier(NotifierError::FeedUnsupported(_)))
        ));
    }

    #[tokio::test]
    async fn invalid_options_fail_before_touching_the_database() {
        let store = InMemoryDocumentStore::arc();
        let options = StorageOptions::default().with_target_schema_version(SchemaVersion::new(99));

        let err = JobStorage::open(Arc::clone(&store), options).await.unwrap_err();

        assert!(matches!(err, StorageError::Config(ConfigError::UnknownSchemaVersion { .. })));
        assert_eq!(store.marker_writes(), 0);
        assert!(store.list_collections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn newer_database_is_refused() {
        let store = Arc::new(InMemoryDocumentStore::new().with_schema_version(SchemaVersion::new(3)));
        let options = StorageOptions::default().with_target_schema_version(SchemaVersion::new(2));

        let err = JobStorage::open(store, options).await.unwrap_err();

        assert!(matches!(err, StorageError::Migration(MigrationError::DatabaseNewer { .. })));
    }

    #[tokio::test]
    async fn key_indexed_store_backfills_and_patches_jobs() {
        let store = Arc::new(InMemoryDocumentStore::new().with_schema_version(SchemaVersion::new(1)));
        let legacy = JobDocument::new("{}", "[]");
        store
            .bulk_write("jobGraph", vec![crate::document::WriteOp::Insert(legacy.to_document().unwrap())])
            .await
            .unwrap();

        let options = StorageOptions::default()
            .with_store_flavor(StoreFlavor::KeyIndexed)
            .with_notification_strategy(NotificationStrategy::Polling);
        let storage = JobStorage::open(Arc::clone(&store), options).await.unwrap();

        assert!(store.indexes("jobGraph").contains(&IndexSpec::unique(KEY_FIELD)));
        let stored = store.find("jobGraph", &Filter::Id(legacy.id)).await.unwrap();
        assert_eq!(stored[0].get(KEY_FIELD), Some(&json!(legacy.id.to_string())));

        // New jobs satisfy the unique key index through the patching executor.
        let mut batch = storage.write_batch();
        batch.insert_job(&JobDocument::new("{}", "[]")).unwrap();
        batch.insert_job(&JobDocument::new("{}", "[]")).unwrap();
        assert_eq!(storage.commit(batch).await.unwrap().inserted, 2);

        storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_wakes_pending_waits() {
        let store = InMemoryDocumentStore::arc();
        let storage = JobStorage::open(store, StorageOptions::default()).await.unwrap();
        let token = storage.cancellation_token();
        let semaphore = Arc::clone(storage.semaphore());

        let waiter = tokio::spawn(async move {
            semaphore.wait_any(&[QueueName::default()], Duration::from_secs(30), &token).await
        });

        storage.shutdown().await.unwrap();
        assert_eq!(waiter.await.unwrap(), Wakeup::Cancelled);
    }
}
