//! Distributed id-seed lock
//!
//! `SET key token NX PX ttl`, retried with capped exponential backoff until
//! the acquire timeout. Release deletes the key only while it still holds our
//! token, so an expired lock taken over by a peer is never released by us.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::backend::SyncBackend;
use crate::config::SynchronizationOptions;
use crate::error::{Error, Result};

/// Proof of holding the lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub struct DistributedLock {
    backend: Arc<dyn SyncBackend>,
    key: String,
    ttl: Duration,
    acquire_timeout: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl DistributedLock {
    pub fn new(backend: Arc<dyn SyncBackend>, options: &SynchronizationOptions) -> Self {
        Self {
            backend,
            key: options.lock_key.clone(),
            ttl: options.lock_ttl(),
            acquire_timeout: options.acquire_timeout(),
            initial_backoff: options.initial_backoff(),
            max_backoff: options.max_backoff(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn acquire(&self) -> Result<LockToken> {
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.acquire_timeout;
        let mut backoff = self.initial_backoff;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if self.backend.set_nx_px(&self.key, &token, self.ttl).await? {
                debug!(attempts, "Acquired id-seed lock");
                return Ok(LockToken(token));
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("Gave up on lock {} after {} attempts", self.key, attempts);
                return Err(Error::LockTimeout {
                    key: self.key.clone(),
                });
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    /// Release if still ours. False when the lock had expired or moved on.
    pub async fn release(&self, token: &LockToken) -> Result<bool> {
        let released = self.backend.del_if_equals(&self.key, token.as_str()).await?;
        if !released {
            warn!("Lock {} was no longer held at release", self.key);
        }
        Ok(released)
    }
}
