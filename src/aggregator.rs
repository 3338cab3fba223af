//! Owns the feed collection and drives refreshes.
//!
//! The aggregator is the only component that mutates the collection.
//! Refresh workers fetch and parse into a local value with no lock held,
//! then take the feed's own mutex just long enough to apply the merge, so
//! merges are serialized per feed while distinct feeds refresh in
//! parallel. Collection changes (register/unregister) go through the outer
//! `RwLock` and never race a refresh.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use url::Url;

use crate::config::AggregatorConfig;
use crate::feed::{
    fetch_payload, parse_feed, Entry, Feed, FeedId, FeedStatus, FetchError, MergeOutcome,
    ParseError, ParsedFeed,
};

/// Errors from [`Aggregator::register_feed`].
#[derive(Debug, Error)]
pub enum RegisterError {
    /// The URL string could not be parsed.
    #[error("invalid feed URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
}

/// A failed refresh, keeping the fetch/parse distinction so retry policy
/// can treat transport trouble and broken documents differently.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl RefreshError {
    /// Transport-level failure: DNS, connection, TLS, or timeout.
    pub fn is_network(&self) -> bool {
        matches!(self, RefreshError::Fetch(err) if err.is_network())
    }

    /// The server answered with a non-2xx status.
    pub fn is_http_status(&self) -> bool {
        matches!(self, RefreshError::Fetch(FetchError::HttpStatus(_)))
    }
}

/// Outcome of one feed's refresh within a scheduler pass.
#[derive(Debug)]
pub struct RefreshResult {
    pub feed_id: FeedId,
    pub result: Result<MergeOutcome, RefreshError>,
}

/// State-change notifications streamed to the presentation collaborator.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// A refresh merged successfully.
    Updated { feed_id: FeedId, new_entries: usize },
    /// A refresh attempt failed; the feed keeps its previous good state.
    Failed { feed_id: FeedId, error: String },
}

/// Read-only snapshot of one feed for list displays.
#[derive(Debug, Clone)]
pub struct FeedSummary {
    pub id: FeedId,
    pub title: String,
    pub entry_count: usize,
    pub unread_count: usize,
    pub last_error: Option<String>,
}

#[derive(Clone)]
struct FeedSlot {
    id: FeedId,
    source_url: String,
    feed: Arc<Mutex<Feed>>,
}

/// The collection of subscribed feeds and the refresh machinery over it.
pub struct Aggregator {
    config: AggregatorConfig,
    client: reqwest::Client,
    feeds: RwLock<Vec<FeedSlot>>,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    /// Create an aggregator with a caller-supplied HTTP client.
    pub fn with_client(config: AggregatorConfig, client: reqwest::Client) -> Self {
        Self {
            config,
            client,
            feeds: RwLock::new(Vec::new()),
        }
    }

    /// Subscribe to a source URL.
    ///
    /// The feed record is created immediately, before any network call; it
    /// has an empty title and no entries until its first successful
    /// refresh. Registering an already-subscribed URL is a no-op that
    /// returns the existing id.
    pub async fn register_feed(&self, source_url: &str) -> Result<FeedId, RegisterError> {
        let parsed = Url::parse(source_url)?;
        match parsed.scheme() {
            "http" | "https" => {}
            scheme => return Err(RegisterError::UnsupportedScheme(scheme.to_owned())),
        }

        let mut feeds = self.feeds.write().await;
        if let Some(slot) = feeds.iter().find(|slot| slot.source_url == source_url) {
            return Ok(slot.id.clone());
        }

        let id = FeedId::from_url(source_url);
        let feed = Feed::new(
            id.clone(),
            source_url.to_owned(),
            self.config.default_ttl_seconds,
        );
        feeds.push(FeedSlot {
            id: id.clone(),
            source_url: source_url.to_owned(),
            feed: Arc::new(Mutex::new(feed)),
        });
        tracing::debug!(feed = %source_url, id = %id, "Feed registered");
        Ok(id)
    }

    /// Drop a subscription. Returns false when the id is unknown.
    pub async fn unregister_feed(&self, id: &FeedId) -> bool {
        let mut feeds = self.feeds.write().await;
        let before = feeds.len();
        feeds.retain(|slot| &slot.id != id);
        feeds.len() != before
    }

    /// Per-feed summaries in registration order.
    pub async fn list_feeds(&self) -> Vec<FeedSummary> {
        let slots = self.snapshot().await;
        let mut summaries = Vec::with_capacity(slots.len());
        for slot in slots {
            let feed = slot.feed.lock().await;
            summaries.push(FeedSummary {
                id: feed.id.clone(),
                title: feed.title.clone(),
                entry_count: feed.entries.len(),
                unread_count: feed.unread_count(),
                last_error: feed.last_error.clone(),
            });
        }
        summaries
    }

    /// The feed's entries in document order, or `None` for an unknown id.
    pub async fn list_entries(&self, id: &FeedId) -> Option<Vec<Entry>> {
        let slot = self.find_slot(id).await?;
        let feed = slot.feed.lock().await;
        Some(feed.entries.clone())
    }

    /// Mark one entry read. Returns false when the feed or guid is unknown.
    /// Idempotent, so a persistence collaborator can replay it on reload.
    pub async fn mark_entry_read(&self, id: &FeedId, guid: &str) -> bool {
        match self.find_slot(id).await {
            Some(slot) => slot.feed.lock().await.mark_entry_read(guid),
            None => false,
        }
    }

    /// Refresh eligibility of one feed, or `None` for an unknown id.
    pub async fn feed_status(&self, id: &FeedId) -> Option<FeedStatus> {
        let slot = self.find_slot(id).await?;
        let feed = slot.feed.lock().await;
        Some(feed.status(Utc::now()))
    }

    /// Refresh every subscribed feed regardless of TTL state (manual
    /// refresh). See [`Aggregator::refresh_due`] for the scheduled variant.
    pub async fn refresh_all(&self, events: Option<mpsc::Sender<FeedEvent>>) -> Vec<RefreshResult> {
        let slots = self.snapshot().await;
        self.refresh_slots(slots, events).await
    }

    /// Refresh the feeds that are due: never fetched, past their TTL, or
    /// failed with an elapsed retry backoff.
    pub async fn refresh_due(&self, events: Option<mpsc::Sender<FeedEvent>>) -> Vec<RefreshResult> {
        let now = Utc::now();
        let mut due = Vec::new();
        for slot in self.snapshot().await {
            let eligible = slot.feed.lock().await.is_due(
                now,
                self.config.backoff_base_seconds,
                self.config.backoff_cap_seconds,
            );
            if eligible {
                due.push(slot);
            }
        }
        self.refresh_slots(due, events).await
    }

    /// Fetch and merge a set of feeds with bounded concurrency.
    ///
    /// Each worker fetches and parses into a local value first, then takes
    /// the feed's mutex only to apply the result; no lock is held across
    /// network I/O. Results are in completion order, not input order.
    async fn refresh_slots(
        &self,
        slots: Vec<FeedSlot>,
        events: Option<mpsc::Sender<FeedEvent>>,
    ) -> Vec<RefreshResult> {
        if slots.is_empty() {
            return Vec::new();
        }

        let client = &self.client;
        let config = &self.config;

        stream::iter(slots)
            .map(|slot| {
                let events = events.clone();
                async move {
                    let outcome = fetch_and_parse(client, &slot.source_url, config).await;
                    let now = Utc::now();

                    let result = {
                        let mut feed = slot.feed.lock().await;
                        match outcome {
                            Ok(parsed) => Ok(feed.merge(parsed, now, config.ttl_floor_seconds)),
                            Err(err) => {
                                feed.record_failure(&err.to_string(), now);
                                Err(err)
                            }
                        }
                    };

                    // Log and notify after the per-feed lock is released
                    match &result {
                        Ok(merge) => {
                            if merge.skipped > 0 {
                                tracing::warn!(
                                    feed = %slot.source_url,
                                    skipped = merge.skipped,
                                    "Malformed items skipped during refresh"
                                );
                            }
                            tracing::debug!(
                                feed = %slot.source_url,
                                inserted = merge.inserted,
                                removed = merge.removed,
                                "Feed refreshed"
                            );
                            if let Some(tx) = &events {
                                let _ = tx
                                    .send(FeedEvent::Updated {
                                        feed_id: slot.id.clone(),
                                        new_entries: merge.inserted,
                                    })
                                    .await;
                            }
                        }
                        Err(err) => {
                            tracing::warn!(
                                feed = %slot.source_url,
                                error = %err,
                                "Failed to refresh feed"
                            );
                            if let Some(tx) = &events {
                                let _ = tx
                                    .send(FeedEvent::Failed {
                                        feed_id: slot.id.clone(),
                                        error: err.to_string(),
                                    })
                                    .await;
                            }
                        }
                    }

                    RefreshResult {
                        feed_id: slot.id,
                        result,
                    }
                }
            })
            .buffer_unordered(self.config.max_in_flight.max(1))
            .collect()
            .await
    }

    async fn snapshot(&self) -> Vec<FeedSlot> {
        self.feeds.read().await.iter().cloned().collect()
    }

    async fn find_slot(&self, id: &FeedId) -> Option<FeedSlot> {
        self.feeds
            .read()
            .await
            .iter()
            .find(|slot| &slot.id == id)
            .cloned()
    }
}

async fn fetch_and_parse(
    client: &reqwest::Client,
    url: &str,
    config: &AggregatorConfig,
) -> Result<ParsedFeed, RefreshError> {
    let payload = fetch_payload(client, url, config.fetch_timeout, config.max_response_bytes).await?;
    Ok(parse_feed(&payload)?)
}

/// Handle to a running scheduler task.
pub struct SchedulerHandle {
    cancel_tx: broadcast::Sender<()>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Request shutdown and wait for the scheduler task to finish.
    pub async fn stop(self) -> Result<(), tokio::task::JoinError> {
        let _ = self.cancel_tx.send(());
        self.join.await
    }
}

/// Spawn the periodic refresh loop.
///
/// Every `tick` the scheduler refreshes whatever [`Aggregator::refresh_due`]
/// selects and streams [`FeedEvent`]s to `events`. The first tick fires
/// immediately, so newly registered feeds get their initial fetch without
/// waiting a full interval.
pub fn spawn_scheduler(
    aggregator: Arc<Aggregator>,
    tick: Duration,
    events: mpsc::Sender<FeedEvent>,
) -> SchedulerHandle {
    let (cancel_tx, mut cancel_rx) = broadcast::channel(1);
    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel_rx.recv() => {
                    tracing::info!("Scheduler shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    let results = aggregator.refresh_due(Some(events.clone())).await;
                    if !results.is_empty() {
                        tracing::debug!(refreshed = results.len(), "Scheduler pass complete");
                    }
                }
            }
        }
    });

    SchedulerHandle { cancel_tx, join }
}
