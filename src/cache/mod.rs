//! Ordered Cache
//!
//! A two-tier cache whose entries keep insertion order. Producers append;
//! consumers walk forward by id and can block until the next entry arrives.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                          OrderedCache                          │
//! │                                                                │
//! │  ┌──────────────┐   ┌────────────────┐   ┌──────────────────┐  │
//! │  │ L1 (bounded) │   │ L2 (of record) │   │ OrderIndex       │  │
//! │  │ front of L2  │◀──│ every entry    │   │ head ⇄ … ⇄ tail  │  │
//! │  └──────────────┘   └────────────────┘   └──────────────────┘  │
//! │          ▲                                                     │
//! │          │ grow / shrink                                       │
//! │  ┌──────────────────┐          ┌───────────────────────────┐   │
//! │  │ AdaptiveResizer  │◀─ rate ──│ WaitingRoom, blocked reads│   │
//! │  └──────────────────┘          └───────────────────────────┘   │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The L2 store and the index are pluggable: the `sync` module provides a
//! shared-backend store and an index that keeps several instances in one
//! global order.

pub mod entry;
pub mod enumerate;
pub mod index;
pub mod metrics;
pub mod ordered;
pub mod resizer;
pub mod store;
pub mod waiting_room;

pub use entry::{Entry, EntryId, MetadataNode};
pub use enumerate::aggregate;
pub use index::{ChangeFeed, IndexChange, LinkedIndex, OrderIndex, Reservation};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use ordered::{OrderedCache, OrderedCacheBuilder};
pub use resizer::{AdaptiveResizer, Resizable, ResizeDecision, ResizePolicy};
pub use store::{Capacity, DataStore, MemoryStore};
pub use waiting_room::{RoomOutcome, Ticket, WaitingRoom};
