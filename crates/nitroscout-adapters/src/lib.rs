//! Source adapter contracts + platform adapters (HN, Reddit, Bluesky, Stack Overflow).
//!
//! Every adapter splits its work the same way: `fetch_*` performs network I/O and returns
//! raw JSON pages, `parse_*` turns those pages into the common [`Candidate`] envelope.
//! Parsing never fails on a single bad item; the item is skipped and counted.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use nitroscout_core::{Candidate, Source, ThreadComment};
use nitroscout_storage::{FetchError, FetchRequest, HttpFetcher};
use scraper::Html;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

mod bluesky;
mod hackernews;
mod reddit;
mod stackoverflow;

pub use bluesky::{BlueskyAdapter, BlueskyCredentials};
pub use hackernews::HackerNewsAdapter;
pub use reddit::RedditAdapter;
pub use stackoverflow::StackOverflowAdapter;

pub const CRATE_NAME: &str = "nitroscout-adapters";

/// Longest body excerpt carried on a candidate.
pub const EXCERPT_CHARS: usize = 600;

/// Upper bound on `lookback_hours`: one leap year.
pub const MAX_LOOKBACK_HOURS: i64 = 24 * 366;

/// Whether a source is noisy enough to need the cheap pre-score pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceVolume {
    High,
    Targeted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(fetched_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at,
        }
    }
}

/// Per-source query knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryConfig {
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Subreddits, Stack Overflow tags; ignored by sources without sub-communities.
    #[serde(default)]
    pub communities: Vec<String>,
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: i64,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default = "default_max_comments")]
    pub max_comments: usize,
}

fn default_lookback_hours() -> i64 {
    24
}

fn default_limit() -> usize {
    50
}

fn default_max_comments() -> usize {
    20
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            keywords: Vec::new(),
            communities: Vec::new(),
            lookback_hours: default_lookback_hours(),
            limit: default_limit(),
            sort: None,
            max_comments: default_max_comments(),
        }
    }
}

impl QueryConfig {
    /// Search window, clamped to `0..=MAX_LOOKBACK_HOURS`.
    pub fn lookback(&self) -> ChronoDuration {
        ChronoDuration::try_hours(self.lookback_hours.clamp(0, MAX_LOOKBACK_HOURS))
            .unwrap_or_else(ChronoDuration::zero)
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.lookback())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// One raw listing response, tagged with what produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingPage {
    pub community: String,
    pub keyword: Option<String>,
    pub url: String,
    pub body: JsonValue,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingFetch {
    pub pages: Vec<ListingPage>,
    pub failed_requests: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingOutcome {
    pub candidates: Vec<Candidate>,
    /// Items dropped because they could not be parsed.
    pub skipped: usize,
    /// Listing requests that failed while siblings succeeded.
    pub failed_requests: usize,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{platform} unavailable: all {attempted} listing requests failed (last: {last_error})")]
    Unavailable {
        platform: Source,
        attempted: usize,
        last_error: String,
    },
    #[error("{platform} authentication failed: {message}")]
    Auth { platform: Source, message: String },
    #[error("malformed {platform} payload: {message}")]
    Malformed { platform: Source, message: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;
    fn volume(&self) -> SourceVolume;

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        query: &QueryConfig,
    ) -> Result<ListingFetch, AdapterError>;

    fn parse_listing(
        &self,
        ctx: &AdapterContext,
        query: &QueryConfig,
        pages: &[ListingPage],
    ) -> ListingOutcome;

    async fn fetch_detail(
        &self,
        http: &HttpFetcher,
        candidate: &Candidate,
        query: &QueryConfig,
    ) -> Result<JsonValue, AdapterError>;

    fn parse_detail(
        &self,
        body: &JsonValue,
        max_comments: usize,
    ) -> Result<Vec<ThreadComment>, AdapterError>;

    /// Phase 1 discovery: query the platform and parse everything it returned.
    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        query: &QueryConfig,
    ) -> Result<ListingOutcome, AdapterError> {
        let listing = self.fetch_listing(http, ctx, query).await?;
        let mut outcome = self.parse_listing(ctx, query, &listing.pages);
        outcome.failed_requests += listing.failed_requests;
        Ok(outcome)
    }

    /// Phase 2 enrichment: fetch and flatten the discussion thread of one candidate.
    async fn fetch_thread(
        &self,
        http: &HttpFetcher,
        candidate: &Candidate,
        query: &QueryConfig,
    ) -> Result<Vec<ThreadComment>, AdapterError> {
        let body = self.fetch_detail(http, candidate, query).await?;
        self.parse_detail(&body, query.max_comments)
    }
}

impl fmt::Debug for dyn SourceAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceAdapter")
            .field("source", &self.source())
            .field("volume", &self.volume())
            .finish()
    }
}

/// Adapter construction inputs that are not per-query.
#[derive(Debug, Clone, Default)]
pub struct AdapterSettings {
    pub bluesky: Option<BlueskyCredentials>,
}

pub fn adapter_for_source(source: Source, settings: &AdapterSettings) -> Box<dyn SourceAdapter> {
    match source {
        Source::HackerNews => Box::new(HackerNewsAdapter::new()),
        Source::Reddit => Box::new(RedditAdapter::new()),
        Source::Bluesky => Box::new(BlueskyAdapter::new(settings.bluesky.clone())),
        Source::StackOverflow => Box::new(StackOverflowAdapter::new()),
    }
}

/// Run every request, keeping successes. Fails only when nothing succeeded.
/// Accumulates listing responses; the source is unavailable only if every request failed.
pub(crate) struct PageCollector {
    platform: Source,
    attempted: usize,
    fetch: ListingFetch,
    last_error: Option<String>,
}

impl PageCollector {
    pub(crate) fn new(platform: Source) -> Self {
        Self {
            platform,
            attempted: 0,
            fetch: ListingFetch::default(),
            last_error: None,
        }
    }

    pub(crate) fn record<E: fmt::Display>(
        &mut self,
        community: String,
        keyword: Option<String>,
        url: &str,
        result: Result<JsonValue, E>,
    ) {
        self.attempted += 1;
        match result {
            Ok(body) => self.fetch.pages.push(ListingPage {
                community,
                keyword,
                url: url.to_string(),
                body,
            }),
            Err(err) => {
                warn!(source = %self.platform, url, error = %err, "listing request failed");
                self.fetch.failed_requests += 1;
                self.last_error = Some(err.to_string());
            }
        }
    }

    pub(crate) fn finish(self) -> Result<ListingFetch, AdapterError> {
        if self.fetch.pages.is_empty() && self.attempted > 0 {
            return Err(AdapterError::Unavailable {
                platform: self.platform,
                attempted: self.attempted,
                last_error: self.last_error.unwrap_or_default(),
            });
        }
        Ok(self.fetch)
    }
}

/// Run each listing request in order through the shared fetcher.
pub(crate) async fn collect_pages(
    http: &HttpFetcher,
    platform: Source,
    requests: Vec<(String, Option<String>, FetchRequest)>,
) -> Result<ListingFetch, AdapterError> {
    let mut pages = PageCollector::new(platform);
    for (community, keyword, request) in requests {
        let result = http.fetch_json::<JsonValue>(platform.slug(), &request).await;
        pages.record(community, keyword, &request.url, result);
    }
    pages.finish()
}

/// Decode each element of a JSON array independently; undecodable items are counted.
pub(crate) fn decode_items<T: serde::de::DeserializeOwned>(
    platform: Source,
    items: Option<&Vec<JsonValue>>,
) -> (Vec<(T, JsonValue)>, usize) {
    let Some(items) = items else {
        warn!(source = %platform, "listing page has no item array");
        return (Vec::new(), 0);
    };
    let mut decoded = Vec::with_capacity(items.len());
    let mut skipped = 0usize;
    for item in items {
        match serde_json::from_value::<T>(item.clone()) {
            Ok(parsed) => decoded.push((parsed, item.clone())),
            Err(err) => {
                tracing::debug!(source = %platform, error = %err, "skipping malformed item");
                skipped += 1;
            }
        }
    }
    (decoded, skipped)
}

/// Flatten an HTML fragment (HN comment, Stack Overflow body) into plain text.
pub fn html_to_text(fragment: &str) -> String {
    let html = Html::parse_fragment(fragment);
    html.root_element()
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Keywords (case-insensitive) that occur in `text`, in configuration order.
pub fn matching_keywords(text: &str, keywords: &[String]) -> Vec<String> {
    let lower = text.to_lowercase();
    keywords
        .iter()
        .filter(|kw| !kw.trim().is_empty() && lower.contains(&kw.to_lowercase()))
        .cloned()
        .collect()
}

pub(crate) fn timestamp_secs(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};

    use chrono::TimeZone;

    use super::*;

    pub fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    pub fn fixture(source: &str, name: &str) -> JsonValue {
        let path = workspace_root().join("fixtures").join(source).join(name);
        let text = std::fs::read_to_string(&path).expect("read fixture");
        serde_json::from_str(&text).expect("parse fixture")
    }

    pub fn ctx() -> AdapterContext {
        AdapterContext {
            run_id: Uuid::nil(),
            fetched_at: Utc
                .with_ymd_and_hms(2026, 2, 24, 12, 0, 0)
                .single()
                .expect("fixed timestamp"),
        }
    }
}
