//! Aggregator / Subscription
//!
//! Publish/subscribe on top of an ordered cache. Every subscription sees
//! every item published after it subscribed, in publish order; an item is
//! dropped from the shared cache once all subscriptions have passed it.
//!
//! ```text
//!   publish(T) ──▶ ┌────────────────────────┐
//!                  │ OrderedCache<Item>     │──▶ sub A: pending ids ──▶ on_next
//!                  │ head … tail            │──▶ sub B: pending ids ──▶ on_next
//!                  └───────────┬────────────┘
//!                              │ evict ids every tracker passed
//!                              ▼
//!                       await_delivery(id) resolves
//! ```

mod hub;
pub mod subscription;
pub mod tracked;

pub use hub::{Aggregator, Item};
pub use subscription::{from_fn, FnSubscriber, Subscriber, Subscription, SubscriptionState};
pub use tracked::{Evictable, TrackedIndex, Trackers};
