//! In-memory change feed for tests/dev.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::change::{ChangeEvent, ChangeFilter};
use crate::feed::{ChangeFeed, ChangeSender, ChangeSubscription, FeedError};

/// In-memory change feed.
///
/// - No IO
/// - Fan-out to every open subscription whose filter matches
/// - Can be built as `unsupported` to behave like a store without change
///   streams (e.g. a standalone, non-replicated deployment)
#[derive(Debug, Default)]
pub struct InMemoryChangeFeed {
    subscribers: Mutex<Vec<(ChangeFilter, ChangeSender)>>,
    unsupported: Option<String>,
    watches: AtomicUsize,
}

impl InMemoryChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// A feed whose deployment cannot serve subscriptions.
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self {
            unsupported: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Deliver a committed change to matching subscribers.
    ///
    /// Returns the number of subscriptions that received the event.
    pub fn publish(&self, event: &ChangeEvent) -> usize {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());

        // Drop closed subscriptions while publishing.
        subs.retain(|(_, tx)| !tx.is_closed());

        let mut delivered = 0;
        for (filter, tx) in subs.iter() {
            if filter.matches(event) && tx.send(Ok(event.clone())).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Push `error` to every open subscription and close them.
    ///
    /// Simulates a cursor failure (network blip, invalidated resume token).
    pub fn fail_subscribers(&self, error: FeedError) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        debug!(subscribers = subs.len(), error = %error, "failing change feed subscribers");
        for (_, tx) in subs.drain(..) {
            let _ = tx.send(Err(error.clone()));
        }
    }

    /// Number of currently open subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|(_, tx)| !tx.is_closed());
        subs.len()
    }

    /// Total number of successful `watch` calls.
    pub fn watch_count(&self) -> usize {
        self.watches.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ChangeFeed for InMemoryChangeFeed {
    async fn probe(&self) -> Result<(), FeedError> {
        match &self.unsupported {
            Some(reason) => Err(FeedError::unsupported(reason.clone())),
            None => Ok(()),
        }
    }

    async fn watch(&self, filter: ChangeFilter) -> Result<ChangeSubscription, FeedError> {
        self.probe().await?;

        let (tx, sub) = ChangeSubscription::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((filter, tx));
        self.watches.fetch_add(1, Ordering::SeqCst);
        Ok(sub)
    }
}
