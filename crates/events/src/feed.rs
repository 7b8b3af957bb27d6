//! Change-feed subscription abstraction (mechanics only).
//!
//! ## Delivery Guarantees
//!
//! - **At-least-once**: a backend may redeliver an event after a reconnect;
//!   consumers must be idempotent.
//! - **No cross-document ordering** beyond what the backend provides.
//! - **Not durable**: a subscription only sees events committed while it is
//!   open. The document store is the source of truth.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::change::{ChangeEvent, ChangeFilter};

/// Change feed failure.
///
/// `Unsupported` is a deployment/topology limitation (e.g. the store is not
/// clustered) and retrying will never fix it. Every other variant is
/// transient: the subscription can be re-opened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("change feed not supported by this deployment: {0}")]
    Unsupported(String),

    #[error("change feed disconnected: {0}")]
    Disconnected(String),

    #[error("change feed cursor invalidated: {0}")]
    Invalidated(String),

    #[error("change feed closed")]
    Closed,
}

impl FeedError {
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::Disconnected(msg.into())
    }

    /// Whether the failure is a capability limitation that no retry can fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FeedError::Unsupported(_))
    }
}

/// Sending half handed to backend tasks that forward change events.
pub type ChangeSender = mpsc::UnboundedSender<Result<ChangeEvent, FeedError>>;

/// An open subscription to a change feed.
///
/// Items are `Err` when the backend reports a failure on the open cursor;
/// `recv` returning `None` means the backend closed the subscription. Dropping
/// the subscription releases the underlying cursor/connection.
#[derive(Debug)]
pub struct ChangeSubscription {
    receiver: mpsc::UnboundedReceiver<Result<ChangeEvent, FeedError>>,
}

impl ChangeSubscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<Result<ChangeEvent, FeedError>>) -> Self {
        Self { receiver }
    }

    /// Create a connected sender/subscription pair.
    pub fn channel() -> (ChangeSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx))
    }

    /// Wait for the next event (or cursor failure).
    pub async fn recv(&mut self) -> Option<Result<ChangeEvent, FeedError>> {
        self.receiver.recv().await
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Result<Result<ChangeEvent, FeedError>, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }
}

/// Live change notifications offered by a document store.
///
/// Backends filter server-side when they can; `ChangeFilter::matches` is the
/// reference semantics either way.
#[async_trait::async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Check whether this deployment can serve live subscriptions at all.
    ///
    /// Returns `FeedError::Unsupported` for topology limitations.
    async fn probe(&self) -> Result<(), FeedError>;

    /// Open a subscription delivering events that match `filter`.
    async fn watch(&self, filter: ChangeFilter) -> Result<ChangeSubscription, FeedError>;
}

#[async_trait::async_trait]
impl<F> ChangeFeed for Arc<F>
where
    F: ChangeFeed + ?Sized,
{
    async fn probe(&self) -> Result<(), FeedError> {
        (**self).probe().await
    }

    async fn watch(&self, filter: ChangeFilter) -> Result<ChangeSubscription, FeedError> {
        (**self).watch(filter).await
    }
}
