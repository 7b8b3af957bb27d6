//! Live-feed notification source.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use jobdock_core::QueueName;
use jobdock_events::{ChangeEvent, ChangeFeed, ChangeFilter, ChangeSubscription, FeedError};

use super::NotifierError;
use super::backoff::{Backoff, BackoffPolicy};
use crate::semaphore::JobQueueSemaphore;

/// Translates queue assignments on the job collection into semaphore
/// releases.
///
/// Runs until cancelled. Transient feed errors are absorbed by backing off and
/// re-opening the subscription; only a topology failure ends the loop with an
/// error.
#[derive(Debug)]
pub struct JobQueueWatcher<F> {
    feed: F,
    semaphore: Arc<JobQueueSemaphore>,
    filter: ChangeFilter,
    queue_field: String,
    backoff: BackoffPolicy,
    span: Span,
}

impl<F> JobQueueWatcher<F>
where
    F: ChangeFeed,
{
    pub fn new(
        feed: F,
        semaphore: Arc<JobQueueSemaphore>,
        collection: impl Into<String>,
        queue_field: impl Into<String>,
        backoff: BackoffPolicy,
    ) -> Self {
        let collection = collection.into();
        let queue_field = queue_field.into();
        let span = info_span!("job_queue_watcher", collection = %collection);
        Self {
            feed,
            semaphore,
            filter: ChangeFilter::queue_assigned(collection, queue_field.clone()),
            queue_field,
            backoff,
            span,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn filter(&self) -> &ChangeFilter {
        &self.filter
    }

    /// Receive loop. Returns `Ok(())` once `cancel` fires.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), NotifierError> {
        self.run_inner(cancel).instrument(self.span.clone()).await
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> Result<(), NotifierError> {
        let mut backoff = Backoff::new(self.backoff.clone());
        info!("job queue watcher started");

        loop {
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                opened = self.feed.watch(self.filter.clone()) => opened,
            };

            match opened {
                Ok(subscription) => {
                    debug!(attempt = backoff.attempt(), "subscription opened");
                    match self.drain(subscription, cancel, &mut backoff).await {
                        Drained::Cancelled => break,
                        Drained::Interrupted(Some(err)) if err.is_fatal() => {
                            error!(error = %err, "change feed unsupported");
                            return Err(NotifierError::FeedUnsupported(err));
                        }
                        Drained::Interrupted(Some(err)) => {
                            warn!(error = %err, "change feed interrupted; resubscribing");
                        }
                        Drained::Interrupted(None) => {
                            warn!("change feed closed; resubscribing");
                        }
                    }
                }
                Err(err) if err.is_fatal() => {
                    error!(error = %err, "change feed unsupported");
                    return Err(NotifierError::FeedUnsupported(err));
                }
                Err(err) => {
                    warn!(error = %err, "cannot open change feed subscription");
                }
            }

            let delay = backoff.next_delay();
            debug!(attempt = backoff.attempt(), delay_ms = delay.as_millis() as u64, "backing off");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("job queue watcher stopped");
        Ok(())
    }

    async fn drain(
        &self,
        mut subscription: ChangeSubscription,
        cancel: &CancellationToken,
        backoff: &mut Backoff,
    ) -> Drained {
        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Drained::Cancelled,
                received = subscription.recv() => received,
            };

            match received {
                Some(Ok(event)) => {
                    backoff.reset();
                    self.handle(&event);
                }
                Some(Err(err)) => return Drained::Interrupted(Some(err)),
                None => return Drained::Interrupted(None),
            }
        }
    }

    /// Release the queue named by a matching event. Returns the queue released.
    pub fn handle(&self, event: &ChangeEvent) -> Option<QueueName> {
        if !self.filter.matches(event) {
            return None;
        }

        let raw = event.updated_field(&self.queue_field)?;
        let Some(name) = raw.as_str() else {
            warn!(document_id = %event.document_id(), value = %raw, "queue field is not a string");
            return None;
        };
        match QueueName::new(name) {
            Ok(queue) => {
                debug!(queue = %queue, document_id = %event.document_id(), "job enqueued");
                self.semaphore.release(&queue);
                Some(queue)
            }
            Err(err) => {
                warn!(document_id = %event.document_id(), error = %err, "ignoring invalid queue name");
                None
            }
        }
    }
}

enum Drained {
    Cancelled,
    /// The subscription failed (`Some`) or was closed by the backend (`None`).
    Interrupted(Option<FeedError>),
}
