//! Configuration
//!
//! Typed option objects for the ordered cache, the aggregator and the
//! distributed order sync. Every struct deserializes with serde and falls back
//! to its `Default` for missing fields, so a host can hand over a partial YAML
//! or JSON document.
//!
//! ```yaml
//! cache:
//!   l1_initial_capacity: 256
//!   run_adaptive_resizing: true
//!   adaption_window_ms: 1000
//!   min_cap: 64
//!   max_cap: 4096
//! sync:
//!   stream_key: orderly:events
//!   resume_session: true
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Cache Options
// =============================================================================

/// Ordered cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Initial L1 target capacity (0 disables L1)
    pub l1_initial_capacity: usize,
    /// Run the adaptive resizer background loop
    pub run_adaptive_resizing: bool,
    /// Length of one resizer sampling window in milliseconds
    pub adaption_window_ms: u64,
    /// Entries added to L1 target capacity on grow
    pub grow_step: usize,
    /// Entries removed from L1 target capacity on shrink
    pub shrink_step: usize,
    /// Floor for L1 target capacity
    pub min_cap: usize,
    /// Ceiling for L1 target capacity
    pub max_cap: usize,
    /// Shrink L1 when fewer waited fires than this occur in a window
    pub room_rate_lower_limit: u64,
    /// Grow L1 when more waited fires than this occur in a window
    pub room_rate_upper_limit: u64,
    /// Keep at most this many entries, evicting from the head after each add
    pub evict_after_every_x: Option<usize>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            l1_initial_capacity: 1024,
            run_adaptive_resizing: false,
            adaption_window_ms: 1000,
            grow_step: 128,
            shrink_step: 64,
            min_cap: 128,
            max_cap: 16 * 1024,
            room_rate_lower_limit: 2,
            room_rate_upper_limit: 20,
            evict_after_every_x: None,
        }
    }
}

impl CacheOptions {
    /// Options for a cache with no L1 tier
    pub fn without_l1() -> Self {
        Self {
            l1_initial_capacity: 0,
            min_cap: 0,
            ..Default::default()
        }
    }

    /// Resizer sampling window
    pub fn adaption_window(&self) -> Duration {
        Duration::from_millis(self.adaption_window_ms)
    }

    /// Whether an L1 tier should be built
    pub fn l1_enabled(&self) -> bool {
        self.l1_initial_capacity > 0
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.min_cap > self.max_cap {
            return Err(Error::Config(format!(
                "min_cap ({}) exceeds max_cap ({})",
                self.min_cap, self.max_cap
            )));
        }
        if self.room_rate_lower_limit > self.room_rate_upper_limit {
            return Err(Error::Config(format!(
                "room_rate_lower_limit ({}) exceeds room_rate_upper_limit ({})",
                self.room_rate_lower_limit, self.room_rate_upper_limit
            )));
        }
        if self.run_adaptive_resizing && self.adaption_window_ms == 0 {
            return Err(Error::Config(
                "adaption_window_ms must be positive when adaptive resizing runs".into(),
            ));
        }
        if self.evict_after_every_x == Some(0) {
            return Err(Error::Config(
                "evict_after_every_x must keep at least one entry".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Aggregator Options
// =============================================================================

/// Aggregator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorOptions {
    /// Options for the shared published-item cache
    pub cache: CacheOptions,
    /// Options for each subscription's pending-id cache
    pub pending: CacheOptions,
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self {
            cache: CacheOptions::default(),
            pending: CacheOptions::without_l1(),
        }
    }
}

impl AggregatorOptions {
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.pending.validate()?;
        if self.cache.evict_after_every_x.is_some() {
            return Err(Error::Config(
                "the aggregator cache evicts by tracker position; evict_after_every_x must be unset"
                    .into(),
            ));
        }
        if self.pending.evict_after_every_x.is_some() {
            return Err(Error::Config(
                "pending ids are removed on delivery; pending.evict_after_every_x must be unset"
                    .into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Synchronization Options
// =============================================================================

/// Distributed order sync configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynchronizationOptions {
    /// Stream carrying order events between instances
    pub stream_key: String,
    /// Consumer group, unique per instance
    pub group_name: String,
    /// Consumer name inside the group
    pub consumer_name: String,
    /// Key of the id-seed distributed lock
    pub lock_key: String,
    /// Key holding the highest id assigned by any instance
    pub global_tail_id_key: String,
    /// Prefix for entry keys and the id membership set
    pub namespace: String,
    /// Load existing ids on connect instead of starting from the global tail
    pub resume_session: bool,
    /// Lock time-to-live in milliseconds
    pub id_seed_lock_ttl_ms: u64,
    /// Give up acquiring the lock after this many milliseconds
    pub acquire_timeout_ms: u64,
    /// First lock retry delay in milliseconds
    pub initial_backoff_ms: u64,
    /// Retry delay ceiling in milliseconds
    pub max_backoff_ms: u64,
    /// Give up waiting for peers' events after this many milliseconds
    pub catch_up_timeout_ms: u64,
    /// Block duration of one stream read in milliseconds
    pub read_block_ms: u64,
    /// Maximum events per stream read
    pub read_batch: usize,
    /// Approximate number of newest events the stream keeps; unset keeps all
    pub stream_max_len: Option<usize>,
}

impl Default for SynchronizationOptions {
    fn default() -> Self {
        let instance = uuid::Uuid::new_v4();
        Self {
            stream_key: "orderly:events".to_string(),
            group_name: format!("orderly-{}", instance),
            consumer_name: format!("consumer-{}", instance),
            lock_key: "orderly:lock".to_string(),
            global_tail_id_key: "orderly:tail".to_string(),
            namespace: "orderly".to_string(),
            resume_session: true,
            id_seed_lock_ttl_ms: 5_000,
            acquire_timeout_ms: 10_000,
            initial_backoff_ms: 2,
            max_backoff_ms: 100,
            catch_up_timeout_ms: 5_000,
            read_block_ms: 250,
            read_batch: 128,
            stream_max_len: Some(10_000),
        }
    }
}

impl SynchronizationOptions {
    /// Options sharing keys with `self` but with a fresh group and consumer,
    /// as a second instance on the same stream would use.
    pub fn for_new_instance(&self) -> Self {
        let instance = uuid::Uuid::new_v4();
        Self {
            group_name: format!("orderly-{}", instance),
            consumer_name: format!("consumer-{}", instance),
            ..self.clone()
        }
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.id_seed_lock_ttl_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms.max(1))
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms).max(1))
    }

    pub fn catch_up_timeout(&self) -> Duration {
        Duration::from_millis(self.catch_up_timeout_ms)
    }

    pub fn read_block(&self) -> Duration {
        Duration::from_millis(self.read_block_ms)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("stream_key", &self.stream_key),
            ("group_name", &self.group_name),
            ("consumer_name", &self.consumer_name),
            ("lock_key", &self.lock_key),
            ("global_tail_id_key", &self.global_tail_id_key),
            ("namespace", &self.namespace),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{} must not be empty", name)));
            }
        }
        if self.id_seed_lock_ttl_ms == 0 {
            return Err(Error::Config("id_seed_lock_ttl_ms must be positive".into()));
        }
        if self.read_batch == 0 {
            return Err(Error::Config("read_batch must be positive".into()));
        }
        if self.stream_max_len == Some(0) {
            return Err(Error::Config("stream_max_len must keep at least one event".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Top-level settings document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cache: CacheOptions,
    pub aggregator: AggregatorOptions,
    pub sync: Option<SynchronizationOptions>,
}

impl Settings {
    /// Parse settings from YAML
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from JSON
    pub fn from_json_str(text: &str) -> Result<Self> {
        let settings: Settings = serde_json::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a `.yaml`, `.yml` or `.json` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&text),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&text),
            other => Err(Error::Config(format!(
                "unsupported configuration format {:?} for {}",
                other,
                path.display()
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.aggregator.validate()?;
        if let Some(sync) = &self.sync {
            sync.validate()?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_options_are_valid() {
        assert!(CacheOptions::default().validate().is_ok());
        assert!(AggregatorOptions::default().validate().is_ok());
        assert!(SynchronizationOptions::default().validate().is_ok());
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn test_cache_options_reject_inverted_bounds() {
        let options = CacheOptions {
            min_cap: 10,
            max_cap: 5,
            ..Default::default()
        };
        assert_matches!(options.validate(), Err(Error::Config(_)));

        let options = CacheOptions {
            room_rate_lower_limit: 9,
            room_rate_upper_limit: 3,
            ..Default::default()
        };
        assert_matches!(options.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_zero_rolling_window_rejected() {
        let options = CacheOptions {
            evict_after_every_x: Some(0),
            ..Default::default()
        };
        assert_matches!(options.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let settings = Settings::from_yaml_str(
            "cache:\n  l1_initial_capacity: 32\n  evict_after_every_x: 4\n",
        )
        .unwrap();

        assert_eq!(settings.cache.l1_initial_capacity, 32);
        assert_eq!(settings.cache.evict_after_every_x, Some(4));
        assert_eq!(settings.cache.grow_step, CacheOptions::default().grow_step);
        assert!(settings.sync.is_none());
    }

    #[test]
    fn test_json_sync_section() {
        let settings = Settings::from_json_str(
            r#"{"sync": {"stream_key": "s", "group_name": "g", "resume_session": false}}"#,
        )
        .unwrap();

        let sync = settings.sync.unwrap();
        assert_eq!(sync.stream_key, "s");
        assert_eq!(sync.group_name, "g");
        assert!(!sync.resume_session);
        assert_eq!(sync.read_batch, 128);
    }

    #[test]
    fn test_invalid_yaml_is_reported() {
        assert_matches!(
            Settings::from_yaml_str("cache: [unclosed"),
            Err(Error::Yaml(_))
        );
    }

    #[test]
    fn test_new_instance_keeps_shared_keys() {
        let first = SynchronizationOptions::default();
        let second = first.for_new_instance();
        assert_eq!(first.stream_key, second.stream_key);
        assert_eq!(first.lock_key, second.lock_key);
        assert_ne!(first.group_name, second.group_name);
    }

    #[test]
    fn test_aggregator_rejects_rolling_window() {
        let mut options = AggregatorOptions::default();
        options.cache.evict_after_every_x = Some(3);
        assert_matches!(options.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_aggregator_rejects_pending_rolling_window() {
        let mut options = AggregatorOptions::default();
        options.pending.evict_after_every_x = Some(1);
        assert_matches!(options.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_sync_rejects_empty_stream_cap() {
        let options = SynchronizationOptions {
            stream_max_len: Some(0),
            ..SynchronizationOptions::default()
        };
        assert_matches!(options.validate(), Err(Error::Config(_)));
        assert!(SynchronizationOptions::default().validate().is_ok());
    }
}
