//! Per-queue wake-up signalling for blocked dequeue calls.
//!
//! Each queue name owns a slot with a `watch` generation counter and a small
//! pending count. A release bumps the generation, which wakes every current
//! waiter on that queue. When nobody is waiting, the release is remembered in
//! `pending` (up to `max_pending`) so the next waiter returns immediately.
//!
//! Waiters subscribe under the same lock that releases take, so a release can
//! never fall between "nothing pending" and "subscribed". Leaving a wait goes
//! through the same lock: whatever the waiter saw but did not consume is
//! handed back to `pending` if no other waiter remains.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::select_all;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use jobdock_core::QueueName;

/// Default cap on remembered releases per queue.
pub const DEFAULT_MAX_PENDING: usize = 16;

/// Outcome of [`JobQueueSemaphore::wait_any`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wakeup {
    /// A release was observed for this queue.
    Released(QueueName),
    TimedOut,
    Cancelled,
}

impl Wakeup {
    pub fn queue(&self) -> Option<&QueueName> {
        match self {
            Wakeup::Released(queue) => Some(queue),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Slot {
    generation: watch::Sender<u64>,
    pending: usize,
}

impl Slot {
    fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            generation,
            pending: 0,
        }
    }
}

/// In-process semaphore keyed by queue name.
#[derive(Debug)]
pub struct JobQueueSemaphore {
    slots: Mutex<HashMap<QueueName, Slot>>,
    max_pending: usize,
}

impl Default for JobQueueSemaphore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}

/// One queue a waiter listens on, with the generation it subscribed at.
#[derive(Debug)]
struct Subscription {
    queue: QueueName,
    receiver: watch::Receiver<u64>,
    subscribed_at: u64,
}

impl JobQueueSemaphore {
    /// `max_pending` is clamped to at least 1.
    pub fn new(max_pending: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            max_pending: max_pending.max(1),
        }
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<QueueName, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Signal that `queue` may have work. Never blocks.
    pub fn release(&self, queue: &QueueName) {
        let mut slots = self.lock();
        let slot = slots.entry(queue.clone()).or_insert_with(Slot::new);

        if slot.generation.receiver_count() == 0 {
            slot.pending = (slot.pending + 1).min(self.max_pending);
        }
        slot.generation.send_modify(|g| *g = g.wrapping_add(1));
        trace!(queue = %queue, pending = slot.pending, "queue released");
    }

    /// Wait until one of `queues` is released, `timeout` elapses or `cancel`
    /// fires.
    ///
    /// A remembered release is consumed first, in the order `queues` lists
    /// them. An empty `queues` simply waits out the timeout.
    ///
    /// Cancel safe: dropping the future before it completes consumes nothing,
    /// and releases it already observed are remembered again for the next
    /// waiter.
    pub async fn wait_any(&self, queues: &[QueueName], timeout: Duration, cancel: &CancellationToken) -> Wakeup {
        if cancel.is_cancelled() {
            return Wakeup::Cancelled;
        }

        let mut guard = match self.take_pending_or_subscribe(queues) {
            Ok(queue) => return Wakeup::Released(queue),
            Err(guard) => guard,
        };

        if guard.subscriptions.is_empty() {
            return tokio::select! {
                biased;
                _ = cancel.cancelled() => Wakeup::Cancelled,
                _ = tokio::time::sleep(timeout) => Wakeup::TimedOut,
            };
        }

        let wakeup = {
            let changed = select_all(guard.subscriptions.iter_mut().map(|sub| {
                Box::pin(async move {
                    // The sender lives as long as the slot, so an error here
                    // cannot happen; treat it as a spurious wake-up.
                    let _ = sub.receiver.changed().await;
                    sub.queue.clone()
                })
            }));

            tokio::select! {
                biased;
                _ = cancel.cancelled() => Wakeup::Cancelled,
                (queue, _, _) = changed => Wakeup::Released(queue),
                _ = tokio::time::sleep(timeout) => Wakeup::TimedOut,
            }
        };

        guard.consumed = wakeup.queue().cloned();
        drop(guard);
        wakeup
    }

    /// Consume a pending release or subscribe to every queue, atomically.
    fn take_pending_or_subscribe(&self, queues: &[QueueName]) -> Result<QueueName, WaitGuard<'_>> {
        let mut slots = self.lock();

        for queue in queues {
            let slot = slots.entry(queue.clone()).or_insert_with(Slot::new);
            if slot.pending > 0 {
                slot.pending -= 1;
                return Ok(queue.clone());
            }
        }

        let mut subscriptions: Vec<Subscription> = Vec::with_capacity(queues.len());
        for queue in queues {
            if subscriptions.iter().any(|sub| &sub.queue == queue) {
                continue;
            }
            if let Some(slot) = slots.get(queue) {
                let receiver = slot.generation.subscribe();
                let subscribed_at = *receiver.borrow();
                subscriptions.push(Subscription {
                    queue: queue.clone(),
                    receiver,
                    subscribed_at,
                });
            }
        }
        Err(WaitGuard {
            semaphore: self,
            subscriptions,
            consumed: None,
        })
    }

    /// Drop a waiter's subscriptions and re-credit every release it saw but
    /// did not consume, for queues left without waiters.
    ///
    /// Runs under the slot lock, so no release can land between the
    /// receiver being dropped and the waiter count being read. While a waiter
    /// is subscribed, releases on its queues never reach `pending`; the
    /// generation advance is therefore exactly what still needs crediting.
    fn settle(&self, subscriptions: Vec<Subscription>, consumed: Option<&QueueName>) {
        let mut slots = self.lock();
        for sub in subscriptions {
            let Subscription {
                queue,
                receiver,
                subscribed_at,
            } = sub;
            let observed = receiver.borrow().wrapping_sub(subscribed_at);
            drop(receiver);

            let taken = u64::from(consumed == Some(&queue));
            let unseen = observed.saturating_sub(taken);
            if unseen == 0 {
                continue;
            }
            if let Some(slot) = slots.get_mut(&queue) {
                if slot.generation.receiver_count() == 0 {
                    let unseen = usize::try_from(unseen).unwrap_or(usize::MAX);
                    slot.pending = slot.pending.saturating_add(unseen).min(self.max_pending);
                    trace!(queue = %queue, pending = slot.pending, "unconsumed releases remembered");
                }
            }
        }
    }

    /// Every queue name that has been released or waited on.
    pub fn known_queues(&self) -> Vec<QueueName> {
        let mut queues: Vec<QueueName> = self.lock().keys().cloned().collect();
        queues.sort();
        queues
    }

    /// Remembered releases for `queue`.
    pub fn pending(&self, queue: &QueueName) -> usize {
        self.lock().get(queue).map(|slot| slot.pending).unwrap_or(0)
    }

    /// Callers currently blocked on `queue`.
    pub fn waiters(&self, queue: &QueueName) -> usize {
        self.lock()
            .get(queue)
            .map(|slot| slot.generation.receiver_count())
            .unwrap_or(0)
    }
}

/// Subscriptions held by one `wait_any` call; settled when dropped.
struct WaitGuard<'a> {
    semaphore: &'a JobQueueSemaphore,
    subscriptions: Vec<Subscription>,
    consumed: Option<QueueName>,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        let subscriptions = std::mem::take(&mut self.subscriptions);
        self.semaphore.settle(subscriptions, self.consumed.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn q(name: &str) -> QueueName {
        QueueName::new(name).unwrap()
    }

    async fn wait_for_waiters(semaphore: &JobQueueSemaphore, queue: &QueueName, count: usize) {
        while semaphore.waiters(queue) < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn release_before_wait_is_remembered() {
        let semaphore = JobQueueSemaphore::default();
        semaphore.release(&q("emails"));

        let wakeup = semaphore
            .wait_any(&[q("default"), q("emails")], Duration::from_secs(5), &CancellationToken::new())
            .await;
        assert_eq!(wakeup, Wakeup::Released(q("emails")));
        assert_eq!(semaphore.pending(&q("emails")), 0);
    }

    #[tokio::test]
    async fn release_during_wait_wakes_waiter() {
        let semaphore = Arc::new(JobQueueSemaphore::default());
        let cancel = CancellationToken::new();

        let waiter = {
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                semaphore
                    .wait_any(&[q("emails"), q("reports")], Duration::from_secs(30), &cancel)
                    .await
            })
        };

        wait_for_waiters(&semaphore, &q("reports"), 1).await;
        semaphore.release(&q("reports"));

        assert_eq!(waiter.await.unwrap(), Wakeup::Released(q("reports")));
        // Consumed by the waiter, not remembered.
        assert_eq!(semaphore.pending(&q("reports")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_without_release_times_out() {
        let semaphore = JobQueueSemaphore::default();
        semaphore.release(&q("other"));

        let wakeup = semaphore
            .wait_any(&[q("emails")], Duration::from_millis(200), &CancellationToken::new())
            .await;
        assert_eq!(wakeup, Wakeup::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_queue_set_waits_out_timeout() {
        let semaphore = JobQueueSemaphore::default();
        let wakeup = semaphore
            .wait_any(&[], Duration::from_millis(50), &CancellationToken::new())
            .await;
        assert_eq!(wakeup, Wakeup::TimedOut);
    }

    #[tokio::test]
    async fn release_fans_out_to_every_waiter() {
        let semaphore = Arc::new(JobQueueSemaphore::default());
        let cancel = CancellationToken::new();

        let mut waiters = Vec::new();
        for queues in [vec![q("emails")], vec![q("emails"), q("default")]] {
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            waiters.push(tokio::spawn(async move {
                semaphore.wait_any(&queues, Duration::from_secs(30), &cancel).await
            }));
        }

        wait_for_waiters(&semaphore, &q("emails"), 2).await;
        semaphore.release(&q("emails"));

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Wakeup::Released(q("emails")));
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_wait() {
        let semaphore = Arc::new(JobQueueSemaphore::default());
        let cancel = CancellationToken::new();

        let waiter = {
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            tokio::spawn(async move { semaphore.wait_any(&[q("emails")], Duration::from_secs(30), &cancel).await })
        };

        wait_for_waiters(&semaphore, &q("emails"), 1).await;
        cancel.cancel();

        assert_eq!(waiter.await.unwrap(), Wakeup::Cancelled);
        assert_eq!(semaphore.waiters(&q("emails")), 0);
    }

    #[tokio::test]
    async fn excess_releases_are_coalesced() {
        let semaphore = JobQueueSemaphore::new(3);
        for _ in 0..10 {
            semaphore.release(&q("emails"));
        }
        assert_eq!(semaphore.pending(&q("emails")), 3);

        let cancel = CancellationToken::new();
        for _ in 0..3 {
            let wakeup = semaphore
                .wait_any(&[q("emails")], Duration::from_millis(10), &cancel)
                .await;
            assert_eq!(wakeup, Wakeup::Released(q("emails")));
        }
        let wakeup = semaphore
            .wait_any(&[q("emails")], Duration::from_millis(10), &cancel)
            .await;
        assert_eq!(wakeup, Wakeup::TimedOut);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn release_racing_a_returning_waiter_is_remembered() {
        for _ in 0..500 {
            let semaphore = Arc::new(JobQueueSemaphore::default());
            let waiter = {
                let semaphore = Arc::clone(&semaphore);
                tokio::spawn(async move {
                    semaphore
                        .wait_any(&[q("emails")], Duration::from_secs(5), &CancellationToken::new())
                        .await
                })
            };
            wait_for_waiters(&semaphore, &q("emails"), 1).await;

            // The second release may land while the waiter is still returning.
            semaphore.release(&q("emails"));
            semaphore.release(&q("emails"));

            assert_eq!(waiter.await.unwrap(), Wakeup::Released(q("emails")));
            assert_eq!(semaphore.pending(&q("emails")), 1);
        }
    }

    #[tokio::test]
    async fn dropped_wait_remembers_observed_releases() {
        let semaphore = JobQueueSemaphore::default();
        let cancel = CancellationToken::new();

        let queues = [q("emails"), q("reports")];
        let mut wait = Box::pin(semaphore.wait_any(&queues, Duration::from_secs(30), &cancel));
        assert!(futures::poll!(&mut wait).is_pending());
        assert_eq!(semaphore.waiters(&q("reports")), 1);

        semaphore.release(&q("reports"));
        assert_eq!(semaphore.pending(&q("reports")), 0);
        drop(wait);

        assert_eq!(semaphore.waiters(&q("reports")), 0);
        assert_eq!(semaphore.pending(&q("reports")), 1);
        assert_eq!(semaphore.pending(&q("emails")), 0);
    }

    #[tokio::test]
    async fn wait_woken_on_one_queue_remembers_the_other() {
        let semaphore = Arc::new(JobQueueSemaphore::default());
        let cancel = CancellationToken::new();

        let queues = [q("emails"), q("reports")];
        let mut wait = Box::pin(semaphore.wait_any(&queues, Duration::from_secs(30), &cancel));
        assert!(futures::poll!(&mut wait).is_pending());

        semaphore.release(&q("reports"));
        semaphore.release(&q("emails"));
        let wakeup = wait.await;

        let other = if wakeup == Wakeup::Released(q("emails")) { q("reports") } else { q("emails") };
        assert_eq!(semaphore.pending(&other), 1);
    }

    #[test]
    fn known_queues_include_waited_and_released() {
        let semaphore = JobQueueSemaphore::default();
        semaphore.release(&q("reports"));
        assert_eq!(semaphore.known_queues(), vec![q("reports")]);

        let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
        rt.block_on(semaphore.wait_any(&[q("emails")], Duration::from_millis(1), &CancellationToken::new()));

        assert_eq!(semaphore.known_queues(), vec![q("emails"), q("reports")]);
    }
}
