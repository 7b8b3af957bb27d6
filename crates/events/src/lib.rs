//! Document change-feed mechanics.
//!
//! A change feed is a live subscription to mutations committed by a document
//! store. This crate defines the event shape, the server-side filter, and the
//! `ChangeFeed` boundary that store backends implement. It makes no storage
//! assumptions; see `jobdock-infra` for concrete backends.

pub mod change;
pub mod feed;
pub mod in_memory_feed;

pub use change::{ChangeEvent, ChangeFilter, ChangeOperation};
pub use feed::{ChangeFeed, ChangeSender, ChangeSubscription, FeedError};
pub use in_memory_feed::InMemoryChangeFeed;
