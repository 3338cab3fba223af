//! Feed aggregation core: fetch, parse, and merge RSS feeds with
//! TTL-driven refresh.
//!
//! The crate owns the pipeline from source URL to de-duplicated, read-state
//! tracked entries:
//!
//! 1. The [`feed::fetcher`](feed) retrieves a raw document within a bounded
//!    timeout.
//! 2. The [`feed::parser`](feed) turns the payload into a
//!    [`ParsedFeed`] — title, TTL, and ordered entries — skipping and
//!    counting malformed items.
//! 3. [`Feed::merge`] reconciles the parse into stored state by guid,
//!    preserving each entry's read flag across refreshes.
//!
//! The [`Aggregator`] owns the feed collection, refreshes due feeds with
//! bounded concurrency, and exposes a snapshot API for a presentation
//! layer plus [`Aggregator::mark_entry_read`] for read-state mutation.
//! Rendering, configuration files, and persistence are the embedding
//! application's concern.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use skein::{spawn_scheduler, Aggregator, AggregatorConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let aggregator = Arc::new(Aggregator::new(AggregatorConfig::default()));
//! let id = aggregator.register_feed("https://example.com/feed.xml").await?;
//!
//! let (events_tx, mut events_rx) = tokio::sync::mpsc::channel(64);
//! let scheduler = spawn_scheduler(aggregator.clone(), Duration::from_secs(30), events_tx);
//!
//! while let Some(event) = events_rx.recv().await {
//!     println!("{event:?}");
//! }
//! scheduler.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod config;
pub mod feed;

pub use aggregator::{
    spawn_scheduler, Aggregator, FeedEvent, FeedSummary, RefreshError, RefreshResult,
    RegisterError, SchedulerHandle,
};
pub use config::AggregatorConfig;
pub use feed::{
    fetch_payload, parse_feed, Entry, Feed, FeedId, FeedStatus, FetchError, MergeOutcome,
    ParseError, ParsedFeed,
};
