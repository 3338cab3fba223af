//! Runtime knobs for the aggregator.
//!
//! All values are plain configuration with stated defaults rather than
//! hidden constants, so an embedding application can tighten or relax them.
//! Loading them from a file (and the file's format) is the embedder's
//! concern, not this crate's.

use std::time::Duration;

/// Configuration for [`crate::Aggregator`].
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Refresh interval used until a feed advertises its own TTL.
    pub default_ttl_seconds: i64,

    /// Lower bound applied to advertised TTLs, so a source declaring
    /// `<ttl>0</ttl>` cannot demand pathological tight-polling.
    pub ttl_floor_seconds: i64,

    /// Wall-clock bound on one fetch, connection through body read.
    pub fetch_timeout: Duration,

    /// Maximum concurrently in-flight fetches, independent of the number
    /// of subscribed feeds.
    pub max_in_flight: usize,

    /// First retry delay after a failed fetch; doubles per consecutive
    /// failure.
    pub backoff_base_seconds: i64,

    /// Ceiling on the failure backoff. The backoff is additionally never
    /// longer than the feed's own TTL.
    pub backoff_cap_seconds: i64,

    /// Maximum accepted response body size, in bytes.
    pub max_response_bytes: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 600,
            ttl_floor_seconds: 60,
            fetch_timeout: Duration::from_secs(30),
            max_in_flight: 10,
            backoff_base_seconds: 30,
            backoff_cap_seconds: 900,
            max_response_bytes: 10 * 1024 * 1024,
        }
    }
}
