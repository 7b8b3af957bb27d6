//! Storage bootstrap.
//!
//! `JobStorage::open` is the single entry point a job engine uses:
//!
//! 1. validate options
//! 2. bring the schema up to date (nothing else touches the database first)
//! 3. select and spawn the notification source
//!
//! The returned handle exposes the semaphore, write batches and the
//! cancellable dequeue wait.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use jobdock_core::{QueueName, SchemaVersion};
use jobdock_events::ChangeFeed;

use crate::config::{ConfigError, StorageOptions};
use crate::document::BulkWriteResult;
use crate::migration::{MigrationError, MigrationRunner, steps};
use crate::notification::{NotificationStrategy, NotifierError, NotifierHandle, QueueNotifier};
use crate::semaphore::{JobQueueSemaphore, Wakeup};
use crate::store::{DocumentStore, SchemaMarkerStore, StoreError};
use crate::write_batch::{WriteBatch, WriteBatchExecutor};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Notifier(#[from] NotifierError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// An opened, migrated job storage.
#[derive(Debug)]
pub struct JobStorage<S> {
    store: Arc<S>,
    options: StorageOptions,
    schema_version: SchemaVersion,
    semaphore: Arc<JobQueueSemaphore>,
    executor: WriteBatchExecutor<Arc<S>>,
    notifier: NotifierHandle,
    cancel: CancellationToken,
}

impl<S> JobStorage<S>
where
    S: DocumentStore + SchemaMarkerStore + ChangeFeed + 'static,
{
    #[instrument(skip(store, options), fields(collection = %options.job_collection), err)]
    pub async fn open(store: Arc<S>, options: StorageOptions) -> Result<Self, StorageError> {
        options.validate()?;
        let target = options.resolved_target_version();

        let runner = MigrationRunner::new(Arc::clone(&store), steps::registry(), options.clone());
        let schema_version = runner.prepare(options.migration_strategy, target).await?;

        let semaphore = Arc::new(JobQueueSemaphore::new(options.max_pending_releases));
        let cancel = CancellationToken::new();
        let notifier = QueueNotifier::from_options(&options, Arc::clone(&store), Arc::clone(&semaphore))
            .await?
            .spawn(cancel.child_token());

        let executor = WriteBatchExecutor::new(
            Arc::clone(&store),
            options.job_collection.clone(),
            options.store_flavor,
        );

        info!(
            schema_version = %schema_version,
            notifications = ?notifier.strategy(),
            "job storage opened"
        );

        Ok(Self {
            store,
            options,
            schema_version,
            semaphore,
            executor,
            notifier,
            cancel,
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// Schema version the database was left at by `open`.
    pub fn schema_version(&self) -> SchemaVersion {
        self.schema_version
    }

    pub fn semaphore(&self) -> &Arc<JobQueueSemaphore> {
        &self.semaphore
    }

    pub fn notification_strategy(&self) -> NotificationStrategy {
        self.notifier.strategy()
    }

    pub fn write_batch(&self) -> WriteBatch {
        WriteBatch::new()
    }

    pub async fn commit(&self, batch: WriteBatch) -> Result<BulkWriteResult, StoreError> {
        self.executor.commit(batch).await
    }

    /// Block until one of `queues` may have work, `timeout` elapses or the
    /// storage shuts down.
    ///
    /// Fails with the notifier's error once the notification source has died,
    /// since no further release would ever arrive.
    pub async fn wait_for_work(&self, queues: &[QueueName], timeout: Duration) -> Result<Wakeup, StorageError> {
        if let Some(err) = self.notifier.error() {
            return Err(err.into());
        }
        tokio::select! {
            wakeup = self.semaphore.wait_any(queues, timeout, &self.cancel) => Ok(wakeup),
            err = self.notifier.failed() => Err(err.into()),
        }
    }

    /// The error the notification source ended with, if it failed.
    pub fn notifier_error(&self) -> Option<NotifierError> {
        self.notifier.error()
    }

    /// Resolve once the notification source fails. Never resolves while it
    /// runs or after a clean shutdown.
    pub async fn notifier_failed(&self) -> NotifierError {
        let err = self.notifier.failed().await;
        error!(error = %err, "notification source failed");
        err
    }

    /// Token cancelled by [`JobStorage::shutdown`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the notifier and wake every pending wait.
    pub async fn shutdown(self) -> Result<(), StorageError> {
        self.cancel.cancel();
        self.notifier.shutdown().await?;
        info!("job storage shut down");
        Ok(())
    }
}
