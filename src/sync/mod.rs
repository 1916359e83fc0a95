//! Distributed order sync
//!
//! Lets several [`OrderedCache`](crate::cache::OrderedCache) instances share
//! one order and one L2 through a backend such as Redis.
//!
//! ```text
//!   instance A                         backend                     instance B
//!  ┌──────────────┐   SET/GET tail   ┌─────────────────┐          ┌──────────────┐
//!  │ SyncedIndex  │─────────────────▶│ {tail}  {lock}  │◀─────────│ SyncedIndex  │
//!  │              │   XADD events    │ stream          │ XREAD    │ SyncListener │
//!  │ BackendStore │─────────────────▶│ {ns}:entry:{id} │◀─────────│ BackendStore │
//!  └──────────────┘                  │ {ns}:ids        │          └──────────────┘
//!                                    └─────────────────┘
//! ```
//!
//! L1 stays local to each instance; only L2 and the order are shared.

pub mod backend;
pub mod event;
pub mod index;
pub mod lock;
#[cfg(feature = "redis")]
pub mod redis;
pub mod store;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::OrderedCache;
use crate::config::{CacheOptions, SynchronizationOptions};
use crate::error::Result;

pub use backend::{InMemorySyncBackend, StreamMessage, SyncBackend};
pub use event::{SyncEvent, SyncEventType};
pub use index::{SyncListener, SyncedIndex};
pub use lock::{DistributedLock, LockToken};
#[cfg(feature = "redis")]
pub use self::redis::RedisSyncBackend;
pub use store::BackendStore;

/// Build an ordered cache whose order and L2 are shared through `backend`
pub async fn connect_cache<V>(
    backend: Arc<dyn SyncBackend>,
    sync: SynchronizationOptions,
    options: CacheOptions,
) -> Result<OrderedCache<V>>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    let store = BackendStore::new(Arc::clone(&backend), sync.namespace.clone());
    let index = SyncedIndex::connect(backend, sync).await?;
    OrderedCache::builder(options).l2(store).index(index).build()
}
