//! Error types for the ordered cache, aggregator and order sync

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the ordered cache subsystem
///
/// Expected outcomes are not errors: a missing id is `Ok(None)` and a full
/// store reports `Ok(false)` from its insert.
#[derive(Error, Debug)]
pub enum Error {
    /// The caller's cancellation token fired while it was suspended
    #[error("Operation cancelled")]
    Cancelled,

    /// The cache or aggregator has been disposed
    #[error("Cache has been disposed")]
    Disposed,

    /// The store of record refused a new entry
    #[error("Store capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// The order index lost an id in the middle of the sequence
    #[error(
        "Order index corrupted: mid-sequence id {id} missing (head {head:?}, tail {tail:?})"
    )]
    Corruption {
        id: i64,
        head: Option<i64>,
        tail: Option<i64>,
    },

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    /// Shared backend failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// Redis client error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML configuration could not be parsed
    #[error("YAML configuration error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // =========================================================================
    // Sync Protocol Errors
    // =========================================================================
    /// The distributed lock could not be taken in time
    #[error("Timed out acquiring distributed lock {key}")]
    LockTimeout { key: String },

    /// The local order did not catch up with the global tail in time
    #[error("Timed out catching up with global tail {expected} (observed {observed:?})")]
    SyncTimeout { expected: i64, observed: Option<i64> },

    // =========================================================================
    // Aggregation Errors
    // =========================================================================
    /// A fold callback returned false
    #[error("Aggregation aborted at element {position}")]
    AggregationAborted { position: u64 },

    /// A subscriber failed to handle an item
    #[error("Delivery of entry {id} to subscription {subscription} failed: {reason}")]
    DeliveryFailed {
        subscription: uuid::Uuid,
        id: i64,
        reason: String,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for the caller's own cancellation, false for disposal and faults.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// True when the wait ended because the cache went away.
    pub fn is_disposed(&self) -> bool {
        matches!(self, Error::Disposed)
    }

    /// True when the wait ended normally: cancelled or disposed.
    pub(crate) fn ends_wait(&self) -> bool {
        self.is_cancellation() || self.is_disposed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_distinct_from_disposal() {
        assert!(Error::Cancelled.is_cancellation());
        assert!(!Error::Cancelled.is_disposed());
        assert!(Error::Disposed.is_disposed());
        assert!(!Error::Disposed.is_cancellation());
        assert!(!Error::Backend("down".into()).ends_wait());
    }

    #[test]
    fn test_corruption_message_names_the_id() {
        let err = Error::Corruption {
            id: 7,
            head: Some(3),
            tail: Some(9),
        };
        assert!(err.to_string().contains("mid-sequence id 7 missing"));
    }
}
