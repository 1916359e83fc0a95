//! Orderly soak runner
//!
//! Drives an aggregator with concurrent publishers and subscribers and logs
//! delivery throughput.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         orderly soak                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  Publishers  │───▶│  Aggregator  │───▶│ Subscribers  │       │
//! │  │   (tasks)    │    │ OrderedCache │    │  (counters)  │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use orderly::aggregator::from_fn;
use orderly::{Aggregator, EntryId, Error, Result, Settings};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Orderly - ordered cache soak runner
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file (YAML or JSON)
    #[arg(long, env = "ORDERLY_CONFIG")]
    config: Option<PathBuf>,

    /// Concurrent publisher tasks
    #[arg(long, env = "ORDERLY_PUBLISHERS", default_value = "4")]
    publishers: usize,

    /// Subscriptions receiving every item
    #[arg(long, env = "ORDERLY_SUBSCRIBERS", default_value = "4")]
    subscribers: usize,

    /// Items published by each publisher
    #[arg(long, env = "ORDERLY_ITEMS", default_value = "10000")]
    items: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

/// Payload carried through the aggregator
#[derive(Debug)]
struct Tick {
    publisher: usize,
    sequence: u64,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let settings = match &args.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };
    settings.validate()?;

    info!("Starting orderly soak");
    info!("  Publishers: {}", args.publishers);
    info!("  Subscribers: {}", args.subscribers);
    info!("  Items per publisher: {}", args.items);
    info!(
        "  L1 capacity: {} (min {}, max {})",
        settings.aggregator.cache.l1_initial_capacity,
        settings.aggregator.cache.min_cap,
        settings.aggregator.cache.max_cap
    );

    let aggregator = Arc::new(Aggregator::new(settings.aggregator.clone())?);

    let received = Arc::new(AtomicU64::new(0));
    let mut subscriptions = Vec::with_capacity(args.subscribers);
    for _ in 0..args.subscribers {
        let received = Arc::clone(&received);
        let subscription = aggregator
            .subscribe(from_fn(move |tick: Arc<Tick>| {
                if tick.sequence == 0 {
                    tracing::debug!(publisher = tick.publisher, "First tick received");
                }
                received.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }))
            .await?;
        subscriptions.push(subscription);
    }

    let started = Instant::now();
    let mut publishers = Vec::with_capacity(args.publishers);
    for publisher in 0..args.publishers {
        let aggregator = Arc::clone(&aggregator);
        let items = args.items;
        publishers.push(tokio::spawn(async move {
            let mut last: Option<EntryId> = None;
            for sequence in 0..items {
                if let Some(id) = aggregator.publish(Tick { publisher, sequence }).await? {
                    last = Some(last.map_or(id, |current: EntryId| current.max(id)));
                }
            }
            Ok::<_, Error>(last)
        }));
    }

    let mut newest: Option<EntryId> = None;
    for handle in publishers {
        match handle.await {
            Ok(Ok(last)) => newest = newest.max(last),
            Ok(Err(e)) => error!("Publisher failed: {}", e),
            Err(e) => error!("Publisher task panicked: {}", e),
        }
    }
    let published = started.elapsed();
    info!("Published in {:.2?}", published);

    // The newest item is evicted only after every subscription passed it
    if let Some(id) = newest {
        aggregator
            .await_delivery(id, &CancellationToken::new())
            .await?;
    }
    let elapsed = started.elapsed();

    let total = received.load(Ordering::Relaxed);
    let expected = args.items * args.publishers as u64 * args.subscribers as u64;
    if total != expected {
        warn!("Delivered {} of {} expected items", total, expected);
    }
    info!(
        delivered = total,
        per_second = (total as f64 / elapsed.as_secs_f64().max(f64::EPSILON)) as u64,
        "Soak finished in {:.2?}",
        elapsed
    );

    match serde_json::to_string(&aggregator.metrics()) {
        Ok(snapshot) => info!("Cache metrics: {}", snapshot),
        Err(e) => warn!("Failed to encode cache metrics: {}", e),
    }

    for subscription in &subscriptions {
        subscription.unsubscribe().await;
    }
    aggregator.dispose().await?;

    info!("Soak shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
