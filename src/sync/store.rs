//! Shared L2 store
//!
//! Entries live as JSON under `{namespace}:entry:{id}`; the id membership set
//! `{namespace}:ids` gives the count and lets a resumed instance rebuild its
//! order without scanning keys.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::backend::SyncBackend;
use crate::cache::{Capacity, DataStore, Entry, EntryId};
use crate::error::Result;

pub fn entry_key(namespace: &str, id: EntryId) -> String {
    format!("{}:entry:{}", namespace, id)
}

pub fn ids_key(namespace: &str) -> String {
    format!("{}:ids", namespace)
}

/// Data store over a [`SyncBackend`], shared by every instance of a namespace
pub struct BackendStore<V> {
    backend: Arc<dyn SyncBackend>,
    namespace: String,
    name: String,
    capacity: Capacity,
    _value: PhantomData<fn() -> V>,
}

impl<V> BackendStore<V> {
    pub fn new(backend: Arc<dyn SyncBackend>, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            backend,
            name: format!("backend:{}", namespace),
            namespace,
            capacity: Capacity::unbounded(),
            _value: PhantomData,
        }
    }

    /// Cap the number of stored entries
    pub fn with_capacity(mut self, capacity: Capacity) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Every stored id in ascending order
    pub async fn ids(&self) -> Result<Vec<EntryId>> {
        let mut ids: Vec<EntryId> = self
            .backend
            .smembers(&ids_key(&self.namespace))
            .await?
            .iter()
            .filter_map(|member| member.parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn write(&self, entry: &Entry<V>) -> Result<()>
    where
        V: Serialize,
    {
        let json = serde_json::to_string(entry)?;
        self.backend
            .set(&entry_key(&self.namespace, entry.id()), &json)
            .await
    }
}

#[async_trait]
impl<V> DataStore<V> for BackendStore<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn insert(&mut self, entry: Entry<V>) -> Result<bool> {
        let key = entry_key(&self.namespace, entry.id());
        let exists = self.backend.get(&key).await?.is_some();
        if !exists {
            let count = self.count().await?;
            if !self.capacity.has_room(count) {
                return Ok(false);
            }
        }

        self.write(&entry).await?;
        self.backend
            .sadd(&ids_key(&self.namespace), &entry.id().to_string())
            .await?;
        Ok(true)
    }

    async fn update(&mut self, entry: Entry<V>) -> Result<bool> {
        let key = entry_key(&self.namespace, entry.id());
        if self.backend.get(&key).await?.is_none() {
            return Ok(false);
        }
        self.write(&entry).await?;
        Ok(true)
    }

    async fn fetch(&self, id: EntryId) -> Result<Option<Entry<V>>> {
        match self.backend.get(&entry_key(&self.namespace, id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn delete(&mut self, id: EntryId) -> Result<Option<Entry<V>>> {
        let entry = self.fetch(id).await?;
        if entry.is_some() {
            self.backend.del(&entry_key(&self.namespace, id)).await?;
            self.backend
                .srem(&ids_key(&self.namespace), &id.to_string())
                .await?;
        }
        Ok(entry)
    }

    async fn clear(&mut self) -> Result<()> {
        let ids = self.ids().await?;
        for id in &ids {
            self.backend.del(&entry_key(&self.namespace, *id)).await?;
        }
        self.backend.del(&ids_key(&self.namespace)).await?;
        debug!(namespace = %self.namespace, removed = ids.len(), "Cleared shared store");
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        self.backend.scard(&ids_key(&self.namespace)).await
    }

    async fn contains(&self, id: EntryId) -> Result<bool> {
        Ok(self
            .backend
            .get(&entry_key(&self.namespace, id))
            .await?
            .is_some())
    }

    fn capacity(&self) -> Capacity {
        self.capacity
    }

    fn add_capacity(&mut self, n: usize) -> Option<usize> {
        self.capacity.grow(n)
    }

    fn cut_capacity(&mut self, n: usize) -> Option<usize> {
        self.capacity.shrink(n)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
