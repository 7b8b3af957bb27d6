//! Polling notification source.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span};

use jobdock_core::QueueName;

use crate::semaphore::JobQueueSemaphore;

/// Releases every known queue on a fixed interval.
///
/// Waiters must tolerate the resulting spurious wake-ups; in exchange work is
/// never noticed later than one interval after it was enqueued.
#[derive(Debug)]
pub struct QueuePoller {
    semaphore: Arc<JobQueueSemaphore>,
    queues: Vec<QueueName>,
    interval: Duration,
    span: Span,
}

impl QueuePoller {
    pub fn new(semaphore: Arc<JobQueueSemaphore>, queues: Vec<QueueName>, interval: Duration) -> Self {
        let span = info_span!("queue_poller", interval_ms = interval.as_millis() as u64);
        Self {
            semaphore,
            queues,
            interval,
            span,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Configured queues plus every queue the semaphore has seen.
    pub fn queues(&self) -> Vec<QueueName> {
        let mut queues: BTreeSet<QueueName> = self.queues.iter().cloned().collect();
        queues.extend(self.semaphore.known_queues());
        queues.into_iter().collect()
    }

    /// One polling round.
    pub fn tick(&self) -> usize {
        let queues = self.queues();
        for queue in &queues {
            self.semaphore.release(queue);
        }
        debug!(released = queues.len(), "poll tick");
        queues.len()
    }

    /// Poll until `cancel` fires.
    pub async fn run(&self, cancel: &CancellationToken) {
        async {
            info!("queue poller started");
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.tick();
                    }
                }
            }
            info!("queue poller stopped");
        }
        .instrument(self.span.clone())
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(name: &str) -> QueueName {
        QueueName::new(name).unwrap()
    }

    #[test]
    fn tick_releases_configured_and_known_queues() {
        let semaphore = Arc::new(JobQueueSemaphore::default());
        semaphore.release(&q("reports"));
        let poller = QueuePoller::new(
            Arc::clone(&semaphore),
            vec![q("default"), q("reports")],
            Duration::from_millis(100),
        );

        assert_eq!(poller.tick(), 2);
        assert_eq!(semaphore.pending(&q("default")), 1);
        assert_eq!(semaphore.pending(&q("reports")), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_waiter_wakes_within_one_interval() {
        let semaphore = Arc::new(JobQueueSemaphore::default());
        let poller = QueuePoller::new(Arc::clone(&semaphore), vec![q("default")], Duration::from_secs(1));
        let cancel = CancellationToken::new();

        // Consume the immediate first tick.
        poller.tick();
        let wakeup = semaphore
            .wait_any(&[q("default")], Duration::from_secs(10), &cancel)
            .await;
        assert_eq!(wakeup.queue(), Some(&q("default")));

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { poller.run(&cancel).await })
        };

        let started = tokio::time::Instant::now();
        let wakeup = semaphore
            .wait_any(&[q("default")], Duration::from_secs(10), &cancel)
            .await;
        assert_eq!(wakeup.queue(), Some(&q("default")));
        assert!(started.elapsed() <= Duration::from_secs(1));

        cancel.cancel();
        task.await.unwrap();
    }
}
