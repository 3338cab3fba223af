use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::feed::parser::ParsedFeed;

/// Stable identifier for a subscribed feed.
///
/// Derived from the source URL alone, so it survives title changes, fetch
/// failures, and process restarts. The same URL always maps to the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedId(String);

impl FeedId {
    /// Derive the id for a source URL (hex SHA-256 digest).
    pub fn from_url(url: &str) -> Self {
        let hash = Sha256::digest(url.as_bytes());
        FeedId(format!("{:x}", hash))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One item within a feed's document.
///
/// Identity is the source-declared `guid`; `sequence_index` is presentation
/// order within the latest parsed document and is not stable across
/// refreshes. `read` is the only field that mutates after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub sequence_index: usize,
    pub title: String,
    pub link: String,
    pub guid: String,
    pub description: String,
    /// Source-declared publication date, kept as raw text: date formats are
    /// not uniform across sources and the core does not normalize them.
    pub published_at: String,
    pub read: bool,
}

impl Entry {
    /// Mark this entry as read. Idempotent.
    pub fn mark_read(&mut self) {
        self.read = true;
    }
}

/// Refresh eligibility of a feed, derived from its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    /// Registered but never successfully fetched; eligible immediately.
    Unfetched,
    /// Fetched within its TTL; not eligible for scheduled refresh.
    Fresh,
    /// TTL elapsed since the last successful fetch; eligible.
    Stale,
    /// Last attempt failed; eligible once the retry backoff has elapsed.
    Error,
}

/// Counters describing what a merge did to the stored entry set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Entries whose guid was not previously stored.
    pub inserted: usize,
    /// Entries whose guid already existed; fields refreshed, `read` kept.
    pub updated: usize,
    /// Stored entries no longer listed by the source, dropped.
    pub removed: usize,
    /// Malformed or duplicate items the parser dropped from the document.
    pub skipped: usize,
}

/// One subscribed RSS source and its accumulated state.
///
/// `entries` is unique by guid and ordered by the latest document.
/// `last_fetched_at` advances only on a fully successful fetch+parse+merge;
/// `last_attempt_at` advances on every attempt and anchors failure backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feed {
    pub id: FeedId,
    pub source_url: String,
    /// Empty until the first successful fetch supplies a channel title.
    pub title: String,
    pub ttl_seconds: i64,
    pub entries: Vec<Entry>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl Feed {
    pub fn new(id: FeedId, source_url: String, default_ttl_seconds: i64) -> Self {
        Feed {
            id,
            source_url,
            title: String::new(),
            ttl_seconds: default_ttl_seconds,
            entries: Vec::new(),
            last_fetched_at: None,
            last_attempt_at: None,
            last_error: None,
            consecutive_failures: 0,
        }
    }

    /// Reconcile a freshly parsed document into the stored state.
    ///
    /// Title and TTL are replaced only when the document supplies them; the
    /// TTL is floored at `ttl_floor_seconds` so a misbehaving source cannot
    /// demand pathological polling. Entries are reconciled by guid: new
    /// guids insert unread, existing guids take every parsed field except
    /// `read`, and stored guids absent from the document are removed. The
    /// final ordering follows the document, not insertion history.
    pub fn merge(
        &mut self,
        parsed: ParsedFeed,
        fetched_at: DateTime<Utc>,
        ttl_floor_seconds: i64,
    ) -> MergeOutcome {
        if let Some(title) = parsed.title {
            self.title = title;
        }
        if let Some(ttl) = parsed.ttl_seconds {
            self.ttl_seconds = ttl.max(ttl_floor_seconds);
        }

        let mut previous: HashMap<String, bool> = self
            .entries
            .drain(..)
            .map(|entry| (entry.guid, entry.read))
            .collect();

        let mut outcome = MergeOutcome {
            skipped: parsed.skipped,
            ..MergeOutcome::default()
        };
        let mut next = Vec::with_capacity(parsed.entries.len());
        for mut entry in parsed.entries {
            match previous.remove(&entry.guid) {
                Some(read) => {
                    entry.read = read;
                    outcome.updated += 1;
                }
                None => outcome.inserted += 1,
            }
            next.push(entry);
        }
        outcome.removed = previous.len();

        self.entries = next;
        self.last_fetched_at = Some(fetched_at);
        self.last_attempt_at = Some(fetched_at);
        self.last_error = None;
        self.consecutive_failures = 0;
        outcome
    }

    /// Record a failed refresh attempt.
    ///
    /// Entries, title, TTL, and `last_fetched_at` are left untouched, so a
    /// failing source keeps its last good state and is retried on the
    /// failure cadence rather than its TTL cadence.
    pub fn record_failure(&mut self, error: &str, attempted_at: DateTime<Utc>) {
        self.last_error = Some(error.to_owned());
        self.last_attempt_at = Some(attempted_at);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub fn status(&self, now: DateTime<Utc>) -> FeedStatus {
        if self.consecutive_failures > 0 {
            return FeedStatus::Error;
        }
        match self.last_fetched_at {
            None => FeedStatus::Unfetched,
            Some(fetched) if now - fetched >= Duration::seconds(self.ttl_seconds) => {
                FeedStatus::Stale
            }
            Some(_) => FeedStatus::Fresh,
        }
    }

    /// Delay before the next retry while in the error state: exponential in
    /// the failure count, capped, and never longer than the feed's own TTL.
    pub fn retry_backoff(&self, base_seconds: i64, cap_seconds: i64) -> Duration {
        let exponent = self.consecutive_failures.saturating_sub(1).min(31);
        let backoff = base_seconds.saturating_mul(1i64 << exponent);
        Duration::seconds(backoff.min(cap_seconds).min(self.ttl_seconds))
    }

    /// Whether this feed is eligible for refresh at `now`.
    pub fn is_due(&self, now: DateTime<Utc>, backoff_base: i64, backoff_cap: i64) -> bool {
        match self.status(now) {
            FeedStatus::Unfetched | FeedStatus::Stale => true,
            FeedStatus::Fresh => false,
            FeedStatus::Error => match self.last_attempt_at {
                Some(attempted) => now - attempted >= self.retry_backoff(backoff_base, backoff_cap),
                None => true,
            },
        }
    }

    pub fn unread_count(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.read).count()
    }

    /// Mark the entry with the given guid as read. Returns false when no
    /// such entry is stored.
    pub fn mark_entry_read(&mut self, guid: &str) -> bool {
        match self.entries.iter_mut().find(|entry| entry.guid == guid) {
            Some(entry) => {
                entry.mark_read();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn entry(index: usize, guid: &str) -> Entry {
        Entry {
            sequence_index: index,
            title: format!("Title {guid}"),
            link: format!("https://example.com/{guid}"),
            guid: guid.to_owned(),
            description: format!("Description {guid}"),
            published_at: "Mon, 01 Jan 2024 00:00:00 GMT".to_owned(),
            read: false,
        }
    }

    fn parsed(entries: Vec<Entry>) -> ParsedFeed {
        ParsedFeed {
            title: Some("Example".to_owned()),
            ttl_seconds: None,
            entries,
            skipped: 0,
        }
    }

    fn test_feed() -> Feed {
        Feed::new(
            FeedId::from_url("https://example.com/feed.xml"),
            "https://example.com/feed.xml".to_owned(),
            600,
        )
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn feed_id_is_stable_for_a_url() {
        let a = FeedId::from_url("https://example.com/feed.xml");
        let b = FeedId::from_url("https://example.com/feed.xml");
        let other = FeedId::from_url("https://example.org/feed.xml");
        assert_eq!(a, b);
        assert_ne!(a, other);
    }

    #[test]
    fn mark_read_is_idempotent() {
        let mut e = entry(0, "a");
        e.mark_read();
        assert!(e.read);
        e.mark_read();
        assert!(e.read);
    }

    #[test]
    fn merge_into_empty_feed_inserts_all_in_document_order() {
        let mut feed = test_feed();
        let outcome = feed.merge(
            parsed(vec![entry(0, "a"), entry(1, "b"), entry(2, "c")]),
            now(),
            60,
        );

        assert_eq!(outcome.inserted, 3);
        assert_eq!(outcome.updated, 0);
        assert_eq!(outcome.removed, 0);
        assert_eq!(feed.title, "Example");
        let guids: Vec<&str> = feed.entries.iter().map(|e| e.guid.as_str()).collect();
        assert_eq!(guids, vec!["a", "b", "c"]);
        assert!(feed.entries.iter().all(|e| !e.read));
        assert_eq!(feed.last_fetched_at, Some(now()));
        assert_eq!(feed.last_error, None);
    }

    #[test]
    fn remerging_the_same_document_is_idempotent() {
        let mut feed = test_feed();
        feed.merge(parsed(vec![entry(0, "a"), entry(1, "b")]), now(), 60);
        feed.mark_entry_read("a");
        let before = feed.entries.clone();

        let outcome = feed.merge(parsed(vec![entry(0, "a"), entry(1, "b")]), now(), 60);

        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.updated, 2);
        assert_eq!(outcome.removed, 0);
        assert_eq!(feed.entries, before);
    }

    #[test]
    fn merge_preserves_read_flag_while_taking_new_fields() {
        let mut feed = test_feed();
        feed.merge(parsed(vec![entry(0, "a")]), now(), 60);
        feed.mark_entry_read("a");

        let mut edited = entry(0, "a");
        edited.description = "Edited after publish".to_owned();
        feed.merge(parsed(vec![edited]), now(), 60);

        assert!(feed.entries[0].read);
        assert_eq!(feed.entries[0].description, "Edited after publish");
    }

    #[test]
    fn merge_drops_entries_absent_from_parse() {
        let mut feed = test_feed();
        feed.merge(parsed(vec![entry(0, "a"), entry(1, "b")]), now(), 60);

        let outcome = feed.merge(parsed(vec![entry(0, "b")]), now(), 60);

        assert_eq!(outcome.removed, 1);
        let guids: Vec<&str> = feed.entries.iter().map(|e| e.guid.as_str()).collect();
        assert_eq!(guids, vec!["b"]);
    }

    #[test]
    fn merge_orders_entries_by_latest_document() {
        let mut feed = test_feed();
        feed.merge(parsed(vec![entry(0, "a"), entry(1, "b")]), now(), 60);

        feed.merge(parsed(vec![entry(0, "b"), entry(1, "a")]), now(), 60);

        let guids: Vec<&str> = feed.entries.iter().map(|e| e.guid.as_str()).collect();
        assert_eq!(guids, vec!["b", "a"]);
    }

    #[test]
    fn merge_floors_advertised_ttl() {
        let mut feed = test_feed();

        let mut doc = parsed(vec![]);
        doc.ttl_seconds = Some(0);
        feed.merge(doc, now(), 60);
        assert_eq!(feed.ttl_seconds, 60);

        let mut doc = parsed(vec![]);
        doc.ttl_seconds = Some(-5);
        feed.merge(doc, now(), 60);
        assert_eq!(feed.ttl_seconds, 60);

        let mut doc = parsed(vec![]);
        doc.ttl_seconds = Some(900);
        feed.merge(doc, now(), 60);
        assert_eq!(feed.ttl_seconds, 900);
    }

    #[test]
    fn merge_keeps_title_and_ttl_when_document_omits_them() {
        let mut feed = test_feed();
        feed.merge(parsed(vec![]), now(), 60);
        assert_eq!(feed.title, "Example");

        let doc = ParsedFeed {
            title: None,
            ttl_seconds: None,
            entries: vec![],
            skipped: 0,
        };
        feed.merge(doc, now(), 60);
        assert_eq!(feed.title, "Example");
        assert_eq!(feed.ttl_seconds, 600);
    }

    #[test]
    fn record_failure_keeps_previous_state() {
        let mut feed = test_feed();
        feed.merge(parsed(vec![entry(0, "a")]), now(), 60);
        let fetched = feed.last_fetched_at;

        let later = now() + Duration::seconds(30);
        feed.record_failure("request timed out", later);

        assert_eq!(feed.entries.len(), 1);
        assert_eq!(feed.title, "Example");
        assert_eq!(feed.last_fetched_at, fetched);
        assert_eq!(feed.last_attempt_at, Some(later));
        assert_eq!(feed.last_error.as_deref(), Some("request timed out"));
        assert_eq!(feed.consecutive_failures, 1);
    }

    #[test]
    fn status_transitions_with_time_and_failures() {
        let mut feed = test_feed();
        assert_eq!(feed.status(now()), FeedStatus::Unfetched);

        feed.merge(parsed(vec![]), now(), 60);
        assert_eq!(feed.status(now()), FeedStatus::Fresh);
        assert_eq!(
            feed.status(now() + Duration::seconds(600)),
            FeedStatus::Stale
        );

        feed.record_failure("HTTP error: status 500", now() + Duration::seconds(601));
        assert_eq!(feed.status(now() + Duration::seconds(601)), FeedStatus::Error);

        feed.merge(parsed(vec![]), now() + Duration::seconds(700), 60);
        assert_eq!(
            feed.status(now() + Duration::seconds(701)),
            FeedStatus::Fresh
        );
    }

    #[test]
    fn retry_backoff_doubles_and_is_capped() {
        let mut feed = test_feed();
        feed.ttl_seconds = 3600;
        let base = 30;
        let cap = 900;

        feed.record_failure("x", now());
        assert_eq!(feed.retry_backoff(base, cap), Duration::seconds(30));

        feed.record_failure("x", now());
        assert_eq!(feed.retry_backoff(base, cap), Duration::seconds(60));

        feed.record_failure("x", now());
        assert_eq!(feed.retry_backoff(base, cap), Duration::seconds(120));

        for _ in 0..10 {
            feed.record_failure("x", now());
        }
        assert_eq!(feed.retry_backoff(base, cap), Duration::seconds(900));
    }

    #[test]
    fn retry_backoff_never_exceeds_the_feed_ttl() {
        let mut feed = test_feed();
        feed.ttl_seconds = 120;
        for _ in 0..8 {
            feed.record_failure("x", now());
        }
        assert_eq!(feed.retry_backoff(30, 900), Duration::seconds(120));
    }

    #[test]
    fn due_only_after_backoff_elapses_in_error_state() {
        let mut feed = test_feed();
        feed.record_failure("request failed", now());

        assert!(!feed.is_due(now() + Duration::seconds(29), 30, 900));
        assert!(feed.is_due(now() + Duration::seconds(30), 30, 900));
    }

    #[test]
    fn fresh_feed_is_not_due_until_ttl_elapses() {
        let mut feed = test_feed();
        assert!(feed.is_due(now(), 30, 900));

        feed.merge(parsed(vec![]), now(), 60);
        assert!(!feed.is_due(now() + Duration::seconds(599), 30, 900));
        assert!(feed.is_due(now() + Duration::seconds(600), 30, 900));
    }

    #[test]
    fn unread_count_tracks_mark_read() {
        let mut feed = test_feed();
        feed.merge(parsed(vec![entry(0, "a"), entry(1, "b")]), now(), 60);
        assert_eq!(feed.unread_count(), 2);

        assert!(feed.mark_entry_read("a"));
        assert_eq!(feed.unread_count(), 1);
        assert!(!feed.mark_entry_read("missing"));
    }

    proptest! {
        // Read flags survive any sequence of two documents: after merging A,
        // marking an arbitrary subset read, and merging B, an entry is read
        // iff its guid was marked while present in A.
        #[test]
        fn read_state_survives_arbitrary_remerge(
            first in proptest::collection::vec(0usize..20, 0..20),
            second in proptest::collection::vec(0usize..20, 0..20),
            marks in proptest::collection::vec(0usize..20, 0..10),
        ) {
            let dedup = |ids: &[usize]| {
                let mut seen = std::collections::HashSet::new();
                ids.iter()
                    .filter(|id| seen.insert(**id))
                    .enumerate()
                    .map(|(index, id)| entry(index, &format!("guid-{id}")))
                    .collect::<Vec<_>>()
            };

            let mut feed = test_feed();
            feed.merge(parsed(dedup(&first)), now(), 60);

            let mut marked = std::collections::HashSet::new();
            for id in &marks {
                let guid = format!("guid-{id}");
                if feed.mark_entry_read(&guid) {
                    marked.insert(guid);
                }
            }

            feed.merge(parsed(dedup(&second)), now(), 60);

            // Unique by guid after any merge
            let mut guids = std::collections::HashSet::new();
            prop_assert!(feed.entries.iter().all(|e| guids.insert(e.guid.clone())));

            for e in &feed.entries {
                prop_assert_eq!(e.read, marked.contains(&e.guid));
            }
        }
    }
}
