//! Orderly - Ordered Two-Tier Cache
//!
//! An append-ordered cache with a fast bounded L1 in front of a large L2,
//! blocking "wait for the next item" reads, adaptive L1 sizing, a
//! publish/subscribe aggregator built on top, and optional sharing of one
//! order between processes.
//!
//! # Architecture
//!
//! ```text
//!   Aggregator ──publish──▶ OrderedCache ──▶ L1 (bounded, hot head)
//!       │                       │        ──▶ L2 (everything)
//!       └─subscriptions◀────────┤        ──▶ OrderIndex (linked order)
//!                               │
//!                 WaitingRoom ◀─┴─▶ AdaptiveResizer
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Entries, stores, order index, the ordered cache and its resizer
//! - [`aggregator`] - Typed publish/subscribe with fair eviction
//! - [`sync`] - Shared order and L2 across instances (Redis behind `redis`)
//! - [`config`] - Options and settings files
//! - [`error`] - Error types

pub mod aggregator;
pub mod cache;
pub mod config;
pub mod error;
pub mod sync;

// Re-export commonly used types
pub use aggregator::{Aggregator, Subscriber, Subscription, SubscriptionState};
pub use cache::{Entry, EntryId, OrderedCache};
pub use config::{AggregatorOptions, CacheOptions, Settings, SynchronizationOptions};
pub use error::{Error, Result};
