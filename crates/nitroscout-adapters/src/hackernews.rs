//! Hacker News via the Algolia search API (no auth).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nitroscout_core::{excerpt, Candidate, ContentDepth, EngagementMetrics, Source, ThreadComment};
use nitroscout_storage::{FetchRequest, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{
    collect_pages, decode_items, html_to_text, AdapterContext, AdapterError, ListingFetch,
    ListingOutcome, ListingPage, QueryConfig, SourceAdapter, SourceVolume, EXCERPT_CHARS,
};

const ALGOLIA_BASE_URL: &str = "https://hn.algolia.com/api/v1";
const COMMUNITY: &str = "hackernews";

#[derive(Debug, Clone)]
pub struct HackerNewsAdapter {
    base_url: String,
}

impl HackerNewsAdapter {
    pub fn new() -> Self {
        Self {
            base_url: ALGOLIA_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }
}

impl Default for HackerNewsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "objectID")]
    object_id: String,
    title: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    points: Option<i64>,
    #[serde(default)]
    num_comments: Option<u32>,
    #[serde(default)]
    story_text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Item {
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    points: Option<i64>,
    #[serde(default)]
    children: Vec<Item>,
}

fn flatten(children: &[Item], depth: u32, out: &mut Vec<ThreadComment>) {
    for child in children {
        if let Some(text) = child.text.as_deref().map(html_to_text).filter(|t| !t.is_empty()) {
            out.push(ThreadComment {
                author: child.author.clone().unwrap_or_else(|| "[deleted]".to_string()),
                text,
                score: child.points,
                depth,
            });
        }
        flatten(&child.children, depth + 1, out);
    }
}

#[async_trait]
impl SourceAdapter for HackerNewsAdapter {
    fn source(&self) -> Source {
        Source::HackerNews
    }

    fn volume(&self) -> SourceVolume {
        SourceVolume::Targeted
    }

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        query: &QueryConfig,
    ) -> Result<ListingFetch, AdapterError> {
        let cutoff = query.cutoff(ctx.fetched_at).timestamp();
        let requests = query
            .keywords
            .iter()
            .map(|keyword| {
                let request = FetchRequest::get(format!("{}/search_by_date", self.base_url))
                    .query("query", keyword)
                    .query("tags", "story")
                    .query("hitsPerPage", query.limit)
                    .query("numericFilters", format!("created_at_i>{cutoff}"));
                (COMMUNITY.to_string(), Some(keyword.clone()), request)
            })
            .collect();
        collect_pages(http, Source::HackerNews, requests).await
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
            let (hits, skipped) =
                decode_items::<Hit>(Source::HackerNews, page.body.get("hits").and_then(JsonValue::as_array));
            outcome.skipped += skipped;

            for (hit, raw) in hits {
                if hit.created_at <= cutoff {
                    continue;
                }
                let body = hit.story_text.as_deref().map(html_to_text).unwrap_or_default();
                outcome.candidates.push(Candidate {
                    source: Source::HackerNews,
                    url: format!("https://news.ycombinator.com/item?id={}", hit.object_id),
                    external_id: hit.object_id,
                    community: COMMUNITY.to_string(),
                    title: hit.title,
                    body_excerpt: excerpt(&body, EXCERPT_CHARS),
                    engagement_metrics: EngagementMetrics {
                        points: hit.points.unwrap_or(0),
                        replies: hit.num_comments.unwrap_or(0),
                        reposts: 0,
                    },
                    discovered_at: ctx.fetched_at,
                    published_at: Some(hit.created_at),
                    matched_keywords: page.keyword.iter().cloned().collect(),
                    raw_payload: raw,
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
        _query: &QueryConfig,
    ) -> Result<JsonValue, AdapterError> {
        let request = FetchRequest::get(format!("{}/items/{}", self.base_url, candidate.external_id));
        Ok(http.fetch_json(Source::HackerNews.slug(), &request).await?)
    }

    fn parse_detail(
        &self,
        body: &JsonValue,
        max_comments: usize,
    ) -> Result<Vec<ThreadComment>, AdapterError> {
        let item: Item = serde_json::from_value(body.clone()).map_err(|e| AdapterError::Malformed {
            platform: Source::HackerNews,
            message: e.to_string(),
        })?;
        let mut comments = Vec::new();
        flatten(&item.children, 0, &mut comments);
        comments.truncate(max_comments);
        Ok(comments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ctx, fixture};

    fn query() -> QueryConfig {
        QueryConfig {
            keywords: vec!["Model Context Protocol".into(), "MCP server".into()],
            ..Default::default()
        }
    }

    fn pages() -> Vec<ListingPage> {
        vec![ListingPage {
            community: COMMUNITY.into(),
            keyword: Some("MCP server".into()),
            url: "fixture".into(),
            body: fixture("hackernews", "search.json"),
        }]
    }

    #[test]
    fn parses_hits_and_skips_malformed_and_stale_items() {
        let adapter = HackerNewsAdapter::new();
        let outcome = adapter.parse_listing(&ctx(), &query(), &pages());

        assert_eq!(outcome.skipped, 1, "hit without objectID is skipped");
        let ids: Vec<_> = outcome.candidates.iter().map(|c| c.external_id.as_str()).collect();
        assert_eq!(ids, vec!["43100001", "43100002"], "story older than lookback dropped");

        let first = &outcome.candidates[0];
        assert_eq!(first.url, "https://news.ycombinator.com/item?id=43100001");
        assert_eq!(first.engagement_metrics.points, 120);
        assert_eq!(first.engagement_metrics.replies, 45);
        assert_eq!(first.matched_keywords, vec!["MCP server".to_string()]);
        assert_eq!(first.community, "hackernews");
        assert_eq!(first.raw_payload["objectID"], "43100001");

        let second = &outcome.candidates[1];
        assert_eq!(second.body_excerpt, "We keep hitting limits with stdio transports. Any tips?");
    }

    #[test]
    fn flattens_nested_comment_tree() {
        let adapter = HackerNewsAdapter::new();
        let comments = adapter
            .parse_detail(&fixture("hackernews", "item.json"), 20)
            .expect("thread");
        assert_eq!(comments.len(), 3);
        assert_eq!(comments[0].author, "bob");
        assert_eq!(comments[0].depth, 0);
        assert_eq!(comments[1].depth, 1);
        assert_eq!(comments[1].text, "Agreed, the SDK's typing helps a lot.");
        assert_eq!(comments[2].author, "[deleted]");

        let capped = adapter
            .parse_detail(&fixture("hackernews", "item.json"), 2)
            .expect("thread");
        assert_eq!(capped.len(), 2);
    }

    #[tokio::test]
    async fn fetch_queries_each_keyword_and_tolerates_one_failure() {
        use nitroscout_storage::{BackoffPolicy, HttpClientConfig};
        use wiremock::matchers::{method, path, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search_by_date"))
            .and(query_param("query", "MCP server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(fixture("hackernews", "search.json")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/search_by_date"))
            .and(query_param("query", "Model Context Protocol"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let http = HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy {
                max_retries: 0,
                ..Default::default()
            },
            ..Default::default()
        })
        .expect("http");
        let adapter = HackerNewsAdapter::new().with_base_url(&server.uri());
        let outcome = adapter.fetch(&http, &ctx(), &query()).await.expect("partial success");
        assert_eq!(outcome.failed_requests, 1);
        assert_eq!(outcome.candidates.len(), 2);
    }
}
