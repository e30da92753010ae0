//! Reddit via the public `.json` listing endpoints (no OAuth).
//!
//! Listings are cheap and noisy, so Reddit is the high-volume source that goes through the
//! pre-score shortlist before any comment tree is requested.

use async_trait::async_trait;
use nitroscout_core::{excerpt, Candidate, ContentDepth, EngagementMetrics, Source, ThreadComment};
use nitroscout_storage::{FetchRequest, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{
    collect_pages, decode_items, matching_keywords, timestamp_secs, AdapterContext, AdapterError,
    ListingFetch, ListingOutcome, ListingPage, QueryConfig, SourceAdapter, SourceVolume,
    EXCERPT_CHARS,
};

const REDDIT_BASE_URL: &str = "https://www.reddit.com";
const DEFAULT_SORT: &str = "hot";

#[derive(Debug, Clone)]
pub struct RedditAdapter {
    base_url: String,
}

impl RedditAdapter {
    pub fn new() -> Self {
        Self {
            base_url: REDDIT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }
}

impl Default for RedditAdapter {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn community_label(subreddit: &str) -> String {
    format!("r/{}", subreddit.trim_start_matches("r/"))
}

#[derive(Debug, Deserialize)]
struct Thing {
    data: Post,
}

#[derive(Debug, Deserialize)]
struct Post {
    id: String,
    title: String,
    permalink: String,
    created_utc: f64,
    #[serde(default)]
    selftext: String,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    num_comments: u32,
    #[serde(default)]
    stickied: bool,
}

fn flatten(children: &[JsonValue], depth: u32, out: &mut Vec<ThreadComment>) {
    for child in children {
        // t1 = comment; "more" stubs and anything else are ignored
        if child.get("kind").and_then(JsonValue::as_str) != Some("t1") {
            continue;
        }
        let Some(data) = child.get("data") else {
            continue;
        };
        let text = data
            .get("body")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        if !text.is_empty() {
            out.push(ThreadComment {
                author: data
                    .get("author")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("[deleted]")
                    .to_string(),
                text,
                score: data.get("score").and_then(JsonValue::as_i64),
                depth,
            });
        }
        // replies is "" when empty, a Listing object otherwise
        if let Some(replies) = data
            .get("replies")
            .and_then(|r| r.get("data"))
            .and_then(|d| d.get("children"))
            .and_then(JsonValue::as_array)
        {
            flatten(replies, depth + 1, out);
        }
    }
}

#[async_trait]
impl SourceAdapter for RedditAdapter {
    fn source(&self) -> Source {
        Source::Reddit
    }

    fn volume(&self) -> SourceVolume {
        SourceVolume::High
    }

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        _ctx: &AdapterContext,
        query: &QueryConfig,
    ) -> Result<ListingFetch, AdapterError> {
        let sort = query.sort.as_deref().unwrap_or(DEFAULT_SORT);
        let requests = query
            .communities
            .iter()
            .map(|sub| {
                let sub = sub.trim_start_matches("r/");
                let request = FetchRequest::get(format!("{}/r/{}/{}.json", self.base_url, sub, sort))
                    .query("limit", query.limit)
                    .query("raw_json", 1);
                (community_label(sub), None, request)
            })
            .collect();
        collect_pages(http, Source::Reddit, requests).await
    }

    fn parse_listing(
        &self,
        ctx: &AdapterContext,
        query: &QueryConfig,
        pages: &[ListingPage],
    ) -> ListingOutcome {
        let cutoff = query.cutoff(ctx.fetched_at);
        let mut outcome = ListingOutcome::default();

        for page in pages {
            let children = page
                .body
                .get("data")
                .and_then(|d| d.get("children"))
                .and_then(JsonValue::as_array);
            let (things, skipped) = decode_items::<Thing>(Source::Reddit, children);
            outcome.skipped += skipped;

            for (thing, raw) in things {
                let post = thing.data;
                if post.stickied {
                    continue;
                }
                let Some(published_at) = timestamp_secs(post.created_utc as i64) else {
                    outcome.skipped += 1;
                    continue;
                };
                if published_at <= cutoff {
                    continue;
                }
                let searchable = format!("{} {}", post.title, post.selftext);
                outcome.candidates.push(Candidate {
                    source: Source::Reddit,
                    external_id: post.id,
                    community: page.community.clone(),
                    url: format!("{}{}", REDDIT_BASE_URL, post.permalink),
                    matched_keywords: matching_keywords(&searchable, &query.keywords),
                    title: post.title,
                    body_excerpt: excerpt(&post.selftext, EXCERPT_CHARS),
                    engagement_metrics: EngagementMetrics {
                        points: post.score,
                        replies: post.num_comments,
                        reposts: 0,
                    },
                    discovered_at: ctx.fetched_at,
                    published_at: Some(published_at),
                    raw_payload: raw.get("data").cloned().unwrap_or(raw),
                    thread: Vec::new(),
                    content_depth: ContentDepth::MetadataOnly,
                });
            }
        }
        outcome
    }

    async fn fetch_detail(
        &self,
        http: &HttpFetcher,
        candidate: &Candidate,
        query: &QueryConfig,
    ) -> Result<JsonValue, AdapterError> {
        let subreddit = candidate
            .raw_payload
            .get("subreddit")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| candidate.community.trim_start_matches("r/").to_string());
        let request = FetchRequest::get(format!(
            "{}/r/{}/comments/{}/.json",
            self.base_url, subreddit, candidate.external_id
        ))
        .query("limit", query.max_comments)
        .query("sort", "best")
        .query("raw_json", 1);
        Ok(http.fetch_json(Source::Reddit.slug(), &request).await?)
    }

    fn parse_detail(
        &self,
        body: &JsonValue,
        max_comments: usize,
    ) -> Result<Vec<ThreadComment>, AdapterError> {
        // [0] is the post itself, [1] the comment listing
        let listing = body
            .get(1)
            .and_then(|l| l.get("data"))
            .and_then(|d| d.get("children"))
            .and_then(JsonValue::as_array)
            .ok_or_else(|| AdapterError::Malformed {
                platform: Source::Reddit,
                message: "comment listing missing".to_string(),
            })?;
        let mut comments = Vec::new();
        flatten(listing, 0, &mut comments);
        comments.truncate(max_comments);
        Ok(comments)
    }
}
