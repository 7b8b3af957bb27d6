//! "Work may be available" signals feeding the queue semaphore.
//!
//! Two strategies, chosen once at startup:
//!
//! - **Live feed**: [`JobQueueWatcher`] subscribes to the store's change feed
//!   and releases the queue named by every queue assignment.
//! - **Polling**: [`QueuePoller`] releases every known queue on an interval.
//!
//! `auto` probes the store and falls back to polling when the deployment
//! cannot serve change feeds.

pub mod backoff;
pub mod poller;
pub mod watcher;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use jobdock_events::{ChangeFeed, FeedError};

use crate::config::StorageOptions;
use crate::document::QUEUE_FIELD;
use crate::semaphore::JobQueueSemaphore;

pub use backoff::{Backoff, BackoffPolicy, BackoffStrategy};
pub use poller::QueuePoller;
pub use watcher::JobQueueWatcher;

/// Notification strategy requested by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationStrategy {
    /// Change feed; startup fails if the store cannot provide one.
    #[default]
    LiveFeed,
    Polling,
    /// Change feed when available, polling otherwise.
    Auto,
}

impl std::str::FromStr for NotificationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live-feed" | "live_feed" | "livefeed" => Ok(Self::LiveFeed),
            "polling" | "poll" => Ok(Self::Polling),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown notification strategy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum NotifierError {
    /// The store cannot serve change feeds; retrying will not help.
    #[error("live notifications unavailable: {0}")]
    FeedUnsupported(#[source] FeedError),

    #[error("notifier task failed: {0}")]
    Task(String),
}

/// The notification source selected for this process.
#[derive(Debug)]
pub enum QueueNotifier<F> {
    LiveFeed(JobQueueWatcher<F>),
    Polling(QueuePoller),
}

impl<F> QueueNotifier<F>
where
    F: ChangeFeed + Send + Sync + 'static,
{
    /// Pick a strategy from `options`, probing `feed` when a live feed is
    /// wanted.
    ///
    /// Only a topology failure changes the outcome of the probe: a transient
    /// probe error still selects the live feed, whose loop retries.
    pub async fn from_options(
        options: &StorageOptions,
        feed: F,
        semaphore: Arc<JobQueueSemaphore>,
    ) -> Result<Self, NotifierError> {
        let strategy = options.notification_strategy;
        if strategy == NotificationStrategy::Polling {
            return Ok(Self::polling(options, semaphore));
        }

        match feed.probe().await {
            Err(err) if err.is_fatal() => match strategy {
                NotificationStrategy::Auto => {
                    warn!(error = %err, "change feed unsupported; falling back to polling");
                    Ok(Self::polling(options, semaphore))
                }
                _ => Err(NotifierError::FeedUnsupported(err)),
            },
            probed => {
                if let Err(err) = probed {
                    warn!(error = %err, "change feed probe failed; the watcher will retry");
                }
                info!(collection = %options.job_collection, "using live change feed notifications");
                Ok(Self::LiveFeed(JobQueueWatcher::new(
                    feed,
                    semaphore,
                    options.job_collection.clone(),
                    QUEUE_FIELD,
                    BackoffPolicy::exponential(options.subscription_backoff_max),
                )))
            }
        }
    }

    fn polling(options: &StorageOptions, semaphore: Arc<JobQueueSemaphore>) -> Self {
        info!(interval_ms = options.poll_interval.as_millis() as u64, "using polling notifications");
        Self::Polling(QueuePoller::new(semaphore, options.queues.clone(), options.poll_interval))
    }

    pub fn strategy(&self) -> NotificationStrategy {
        match self {
            QueueNotifier::LiveFeed(_) => NotificationStrategy::LiveFeed,
            QueueNotifier::Polling(_) => NotificationStrategy::Polling,
        }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), NotifierError> {
        match self {
            QueueNotifier::LiveFeed(watcher) => watcher.run(cancel).await,
            QueueNotifier::Polling(poller) => {
                poller.run(cancel).await;
                Ok(())
            }
        }
    }

    /// Run on the tokio runtime until `cancel` fires or the notifier fails.
    pub fn spawn(self, cancel: CancellationToken) -> NotifierHandle {
        let strategy = self.strategy();
        let token = cancel.clone();
        let (status_tx, status) = watch::channel(NotifierStatus::Running);
        let join = tokio::spawn(async move {
            let result = self.run(&token).await;
            let outcome = match &result {
                Ok(()) => NotifierStatus::Stopped,
                Err(err) => NotifierStatus::Failed(err.clone()),
            };
            status_tx.send_replace(outcome);
            result
        });
        NotifierHandle {
            strategy,
            cancel,
            status,
            join,
        }
    }
}

/// Lifecycle of a spawned notifier.
#[derive(Debug, Clone)]
pub enum NotifierStatus {
    Running,
    /// Stopped after cancellation.
    Stopped,
    /// Ended on its own; no further releases will be issued.
    Failed(NotifierError),
}

/// Handle to observe, stop and join a spawned notifier.
#[derive(Debug)]
pub struct NotifierHandle {
    strategy: NotificationStrategy,
    cancel: CancellationToken,
    status: watch::Receiver<NotifierStatus>,
    join: JoinHandle<Result<(), NotifierError>>,
}

impl NotifierHandle {
    pub fn strategy(&self) -> NotificationStrategy {
        self.strategy
    }

    /// Whether the task has ended.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn status(&self) -> NotifierStatus {
        self.status.borrow().clone()
    }

    /// The error the notifier ended with, if it failed.
    pub fn error(&self) -> Option<NotifierError> {
        match &*self.status.borrow() {
            NotifierStatus::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// Resolve once the notifier fails. Pends forever if it only ever stops
    /// through cancellation.
    pub async fn failed(&self) -> NotifierError {
        let mut status = self.status.clone();
        let outcome = status
            .wait_for(|s| !matches!(s, NotifierStatus::Running))
            .await
            .map(|s| (*s).clone());
        match outcome {
            Ok(NotifierStatus::Failed(err)) => err,
            // The task dropped its status sender without reporting: it panicked.
            Err(_) => NotifierError::Task("notifier task ended without reporting".to_string()),
            Ok(_) => std::future::pending().await,
        }
    }

    /// Cancel the notifier and wait for it to stop.
    pub async fn shutdown(self) -> Result<(), NotifierError> {
        self.cancel.cancel();
        match self.join.await {
            Ok(result) => result,
            Err(err) => Err(NotifierError::Task(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use jobdock_core::QueueName;
    use jobdock_events::InMemoryChangeFeed;

    use super::*;

    fn options(strategy: NotificationStrategy) -> StorageOptions {
        StorageOptions::default()
            .with_notification_strategy(strategy)
            .with_poll_interval(Duration::from_millis(20))
    }

    #[test]
    fn strategy_parses() {
        assert_eq!("live-feed".parse::<NotificationStrategy>().unwrap(), NotificationStrategy::LiveFeed);
        assert_eq!("Polling".parse::<NotificationStrategy>().unwrap(), NotificationStrategy::Polling);
        assert_eq!("auto".parse::<NotificationStrategy>().unwrap(), NotificationStrategy::Auto);
        assert!("sometimes".parse::<NotificationStrategy>().is_err());
    }

    #[tokio::test]
    async fn live_feed_requires_capability() {
        let feed = Arc::new(InMemoryChangeFeed::unsupported("standalone"));
        let err = QueueNotifier::from_options(
            &options(NotificationStrategy::LiveFeed),
            feed,
            Arc::new(JobQueueSemaphore::default()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, NotifierError::FeedUnsupported(_)));
    }

    #[tokio::test]
    async fn auto_falls_back_to_polling() {
        let feed = Arc::new(InMemoryChangeFeed::unsupported("standalone"));
        let notifier = QueueNotifier::from_options(
            &options(NotificationStrategy::Auto),
            feed,
            Arc::new(JobQueueSemaphore::default()),
        )
        .await
        .unwrap();
        assert_eq!(notifier.strategy(), NotificationStrategy::Polling);
    }

    #[tokio::test]
    async fn auto_prefers_live_feed() {
        let notifier = QueueNotifier::from_options(
            &options(NotificationStrategy::Auto),
            Arc::new(InMemoryChangeFeed::new()),
            Arc::new(JobQueueSemaphore::default()),
        )
        .await
        .unwrap();
        assert_eq!(notifier.strategy(), NotificationStrategy::LiveFeed);
    }

    #[tokio::test]
    async fn spawned_poller_wakes_waiters_and_shuts_down() {
        let semaphore = Arc::new(JobQueueSemaphore::default());
        let notifier = QueueNotifier::from_options(
            &options(NotificationStrategy::Polling),
            Arc::new(InMemoryChangeFeed::new()),
            Arc::clone(&semaphore),
        )
        .await
        .unwrap();

        let handle = notifier.spawn(CancellationToken::new());
        assert_eq!(handle.strategy(), NotificationStrategy::Polling);

        let default = QueueName::new("default").unwrap();
        let wakeup = semaphore
            .wait_any(&[default.clone()], Duration::from_secs(5), &CancellationToken::new())
            .await;
        assert_eq!(wakeup.queue(), Some(&default));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn fatal_feed_error_is_reported_by_the_handle() {
        let feed = Arc::new(InMemoryChangeFeed::new());
        let notifier = QueueNotifier::from_options(
            &options(NotificationStrategy::LiveFeed),
            Arc::clone(&feed),
            Arc::new(JobQueueSemaphore::default()),
        )
        .await
        .unwrap();
        let handle = notifier.spawn(CancellationToken::new());
        assert!(handle.error().is_none());

        while feed.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
        feed.fail_subscribers(FeedError::unsupported("cluster downgraded"));

        let err = tokio::time::timeout(Duration::from_secs(5), handle.failed())
            .await
            .unwrap();
        assert!(matches!(err, NotifierError::FeedUnsupported(_)));
        assert!(matches!(handle.status(), NotifierStatus::Failed(_)));
        assert!(matches!(handle.shutdown().await, Err(NotifierError::FeedUnsupported(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_notifier_never_reports_failure() {
        let notifier = QueueNotifier::from_options(
            &options(NotificationStrategy::Polling),
            Arc::new(InMemoryChangeFeed::new()),
            Arc::new(JobQueueSemaphore::default()),
        )
        .await
        .unwrap();
        let cancel = CancellationToken::new();
        let handle = notifier.spawn(cancel.clone());

        cancel.cancel();
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;

        assert!(matches!(handle.status(), NotifierStatus::Stopped));
        assert!(
            tokio::time::timeout(Duration::from_millis(100), handle.failed())
                .await
                .is_err()
        );
        handle.shutdown().await.unwrap();
    }
}
