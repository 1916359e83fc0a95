//! Adaptive Resizer - sizes L1 from the observed room rate
//!
//! Once per adaption window the loop counts how many Waiting Room signals had
//! at least one blocked reader. Readers blocking often means consumers keep
//! up with producers and hit the tail, so L1 grows; a quiet room shrinks it.
//!
//! ```text
//!   rate > upper   ──▶  Grow   (+grow_step, ≤ max_cap)
//!   rate < lower   ──▶  Shrink (-shrink_step, ≥ min_cap)
//!   otherwise      ──▶  Hold
//! ```

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::CacheOptions;
use crate::error::Result;

/// Outcome of one sampling window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeDecision {
    Grow,
    Shrink,
    Hold,
}

impl ResizeDecision {
    /// Classify a room rate against the configured band
    pub fn decide(rate: u64, lower: u64, upper: u64) -> Self {
        if rate > upper {
            ResizeDecision::Grow
        } else if rate < lower {
            ResizeDecision::Shrink
        } else {
            ResizeDecision::Hold
        }
    }
}

/// Resizer tuning, taken from [`CacheOptions`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizePolicy {
    pub window: Duration,
    pub lower: u64,
    pub upper: u64,
    pub grow_step: usize,
    pub shrink_step: usize,
}

impl ResizePolicy {
    pub fn from_options(options: &CacheOptions) -> Self {
        Self {
            window: options.adaption_window(),
            lower: options.room_rate_lower_limit,
            upper: options.room_rate_upper_limit,
            grow_step: options.grow_step,
            shrink_step: options.shrink_step,
        }
    }

    pub fn decide(&self, rate: u64) -> ResizeDecision {
        ResizeDecision::decide(rate, self.lower, self.upper)
    }
}

/// Something with a resizable L1 and a room-rate counter
#[async_trait]
pub trait Resizable: Send + Sync + 'static {
    /// Monotonic count of signals that woke at least one reader
    fn waited_fires(&self) -> u64;

    /// Raise the L1 target and refill. Returns the new target.
    async fn grow_l1(&self, step: usize) -> Result<Option<usize>>;

    /// Lower the L1 target and drop overflow. Returns the new target.
    async fn shrink_l1(&self, step: usize) -> Result<Option<usize>>;
}

/// Background loop driving a [`Resizable`]
///
/// Holds only a weak reference, so the loop never keeps its cache alive.
pub struct AdaptiveResizer<T> {
    target: Weak<T>,
    policy: ResizePolicy,
}

impl<T: Resizable> AdaptiveResizer<T> {
    pub fn new(target: Weak<T>, policy: ResizePolicy) -> Self {
        Self { target, policy }
    }

    pub fn policy(&self) -> ResizePolicy {
        self.policy
    }

    /// Apply the decision for one window's room rate
    pub async fn step(&self, target: &T, rate: u64) -> Result<ResizeDecision> {
        let decision = self.policy.decide(rate);
        match decision {
            ResizeDecision::Grow => {
                let capacity = target.grow_l1(self.policy.grow_step).await?;
                debug!(rate, ?capacity, "Grew L1 target capacity");
            }
            ResizeDecision::Shrink => {
                let capacity = target.shrink_l1(self.policy.shrink_step).await?;
                debug!(rate, ?capacity, "Shrank L1 target capacity");
            }
            ResizeDecision::Hold => {}
        }
        Ok(decision)
    }

    /// Run until `token` fires or the target is dropped
    #[instrument(skip(self, token), fields(window_ms = self.policy.window.as_millis() as u64))]
    pub async fn run(self, token: CancellationToken) {
        info!("Starting adaptive resizer with {:?}", self.policy);

        let mut tick = interval(self.policy.window);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        tick.tick().await;

        let mut last = match self.target.upgrade() {
            Some(target) => target.waited_fires(),
            None => return,
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Adaptive resizer shutting down");
                    break;
                }
                _ = tick.tick() => {}
            }

            let Some(target) = self.target.upgrade() else {
                break;
            };

            let fires = target.waited_fires();
            let rate = fires.saturating_sub(last);
            last = fires;

            match self.step(&target, rate).await {
                Ok(_) => {}
                Err(e) if e.is_disposed() => break,
                Err(e) => warn!("Adaptive resize failed: {}", e),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
