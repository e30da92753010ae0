//! Bluesky via the AT Protocol XRPC API. Search requires an authenticated session.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nitroscout_core::{excerpt, Candidate, ContentDepth, EngagementMetrics, Source, ThreadComment};
use nitroscout_storage::{FetchError, FetchRequest, HttpFetcher};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    decode_items, AdapterContext, AdapterError, ListingFetch, ListingOutcome, ListingPage,
    PageCollector, QueryConfig, SourceAdapter, SourceVolume, EXCERPT_CHARS,
};

const XRPC_BASE_URL: &str = "https://bsky.social/xrpc";
const COMMUNITY: &str = "bluesky";
const TITLE_CHARS: usize = 120;
const THREAD_DEPTH: u32 = 6;

#[derive(Clone)]
pub struct BlueskyCredentials {
    pub handle: String,
    pub app_password: String,
}

impl fmt::Debug for BlueskyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlueskyCredentials")
            .field("handle", &self.handle)
            .field("app_password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug)]
pub struct BlueskyAdapter {
    base_url: String,
    credentials: Option<BlueskyCredentials>,
    session: Mutex<Option<String>>,
}

impl BlueskyAdapter {
    pub fn new(credentials: Option<BlueskyCredentials>) -> Self {
        Self {
            base_url: XRPC_BASE_URL.to_string(),
            credentials,
            session: Mutex::new(None),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    /// Cached session token, logging in when there is none.
    async fn access_token(&self, http: &HttpFetcher) -> Result<String, AdapterError> {
        let mut session = self.session.lock().await;
        if let Some(token) = session.as_ref() {
            return Ok(token.clone());
        }
        let token = self.create_session(http).await?;
        *session = Some(token.clone());
        Ok(token)
    }

    async fn create_session(&self, http: &HttpFetcher) -> Result<String, AdapterError> {
        let credentials = self.credentials.as_ref().ok_or_else(|| AdapterError::Auth {
            platform: Source::Bluesky,
            message: "no Bluesky handle/app password configured".to_string(),
        })?;

        let request = FetchRequest::post_json(
            format!("{}/com.atproto.server.createSession", self.base_url),
            json!({
                "identifier": credentials.handle,
                "password": credentials.app_password,
            }),
        );
        let body: JsonValue = http
            .fetch_json(Source::Bluesky.slug(), &request)
            .await
            .map_err(|e| AdapterError::Auth {
                platform: Source::Bluesky,
                message: e.to_string(),
            })?;
        body.get("accessJwt")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| AdapterError::Auth {
                platform: Source::Bluesky,
                message: "session response has no accessJwt".to_string(),
            })
    }

    /// Drop `rejected` from the cache unless another request already replaced it.
    async fn forget(&self, rejected: &str) {
        let mut session = self.session.lock().await;
        if session.as_deref() == Some(rejected) {
            *session = None;
        }
    }

    /// Authenticated GET. A rejected session is replaced and the request sent once more.
    async fn get_json(&self, http: &HttpFetcher, request: &FetchRequest) -> Result<JsonValue, AdapterError> {
        let token = self.access_token(http).await?;
        match http
            .fetch_json(Source::Bluesky.slug(), &request.clone().bearer(token.clone()))
            .await
        {
            Err(err) if session_rejected(&err) => {
                info!(status = ?err.status(), "bluesky session rejected; logging in again");
                self.forget(&token).await;
                let token = self.access_token(http).await?;
                Ok(http
                    .fetch_json(Source::Bluesky.slug(), &request.clone().bearer(token))
                    .await?)
            }
            result => Ok(result?),
        }
    }
}

/// Expired or revoked access tokens come back as 400 `ExpiredToken`/`InvalidToken` or 401.
fn session_rejected(err: &FetchError) -> bool {
    match err {
        FetchError::HttpStatus { status: 401, .. } => true,
        FetchError::HttpStatus {
            status: 400,
            detail,
            ..
        } => detail.contains("ExpiredToken") || detail.contains("InvalidToken"),
        _ => false,
    }
}

#[derive(Debug, Deserialize)]
struct Author {
    handle: String,
}

#[derive(Debug, Deserialize)]
struct Record {
    text: String,
    #[serde(rename = "createdAt")]
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostView {
    uri: String,
    author: Author,
    record: Record,
    #[serde(default)]
    like_count: i64,
    #[serde(default)]
    reply_count: u32,
    #[serde(default)]
    repost_count: u32,
}

/// `at://did/app.bsky.feed.post/<rkey>` -> web URL.
fn post_url(handle: &str, uri: &str) -> String {
    let rkey = uri.rsplit('/').next().unwrap_or_default();
    format!("https://bsky.app/profile/{handle}/post/{rkey}")
}

fn title_from_text(text: &str) -> String {
    let first_line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or_default();
    excerpt(first_line, TITLE_CHARS)
}

fn flatten(replies: &[JsonValue], depth: u32, out: &mut Vec<ThreadComment>) {
    for reply in replies {
        let Some(post) = reply.get("post") else {
            // blocked/not-found placeholders carry no post
            continue;
        };
        let text = post
            .get("record")
            .and_then(|r| r.get("text"))
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        if !text.is_empty() {
            out.push(ThreadComment {
                author: post
                    .get("author")
                    .and_then(|a| a.get("handle"))
                    .and_then(JsonValue::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                text,
                score: post.get("likeCount").and_then(JsonValue::as_i64),
                depth,
            });
        }
        if let Some(children) = reply.get("replies").and_then(JsonValue::as_array) {
            flatten(children, depth + 1, out);
        }
    }
}

#[async_trait]
impl SourceAdapter for BlueskyAdapter {
    fn source(&self) -> Source {
        Source::Bluesky
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
        // No session means no listing at all.
        self.access_token(http).await?;
        let since = query.cutoff(ctx.fetched_at).to_rfc3339();
        let mut pages = PageCollector::new(Source::Bluesky);
        for keyword in &query.keywords {
            let request = FetchRequest::get(format!("{}/app.bsky.feed.searchPosts", self.base_url))
                .query("q", keyword)
                .query("limit", query.limit.min(100))
                .query("sort", query.sort.as_deref().unwrap_or("latest"))
                .query("since", &since);
            let result = self.get_json(http, &request).await;
            pages.record(COMMUNITY.to_string(), Some(keyword.clone()), &request.url, result);
        }
        pages.finish()
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
            let (posts, skipped) = decode_items::<PostView>(
                Source::Bluesky,
                page.body.get("posts").and_then(JsonValue::as_array),
            );
            outcome.skipped += skipped;

            for (post, raw) in posts {
                if post.record.created_at <= cutoff {
                    continue;
                }
                outcome.candidates.push(Candidate {
                    source: Source::Bluesky,
                    url: post_url(&post.author.handle, &post.uri),
                    external_id: post.uri,
                    community: COMMUNITY.to_string(),
                    title: title_from_text(&post.record.text),
                    body_excerpt: excerpt(&post.record.text, EXCERPT_CHARS),
                    engagement_metrics: EngagementMetrics {
                        points: post.like_count,
                        replies: post.reply_count,
                        reposts: post.repost_count,
                    },
                    discovered_at: ctx.fetched_at,
                    published_at: Some(post.record.created_at),
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
        let request = FetchRequest::get(format!("{}/app.bsky.feed.getPostThread", self.base_url))
            .query("uri", &candidate.external_id)
            .query("depth", THREAD_DEPTH);
        self.get_json(http, &request).await
    }

    fn parse_detail(
        &self,
        body: &JsonValue,
        max_comments: usize,
    ) -> Result<Vec<ThreadComment>, AdapterError> {
        let thread = body.get("thread").ok_or_else(|| AdapterError::Malformed {
            platform: Source::Bluesky,
            message: "thread missing".to_string(),
        })?;
        let mut comments = Vec::new();
        if let Some(replies) = thread.get("replies").and_then(JsonValue::as_array) {
            flatten(replies, 0, &mut comments);
        }
        comments.truncate(max_comments);
        Ok(comments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ctx, fixture};
    use nitroscout_storage::HttpClientConfig;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn query() -> QueryConfig {
        QueryConfig {
            keywords: vec!["mcp server".into()],
            ..Default::default()
        }
    }

    #[test]
    fn parses_posts_into_candidates() {
        let adapter = BlueskyAdapter::new(None);
        let pages = vec![ListingPage {
            community: COMMUNITY.into(),
            keyword: Some("mcp server".into()),
            url: "fixture".into(),
            body: fixture("bluesky", "search.json"),
        }];
        let outcome = adapter.parse_listing(&ctx(), &query(), &pages);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.candidates.len(), 1);

        let post = &outcome.candidates[0];
        assert_eq!(post.external_id, "at://did:plc:abc123/app.bsky.feed.post/3kxyz");
        assert_eq!(post.url, "https://bsky.app/profile/dev.bsky.social/post/3kxyz");
        assert_eq!(post.title, "Shipped our first MCP server today");
        assert_eq!(post.engagement_metrics.weight(), 10 + 2 + 1);
    }

    #[test]
    fn flattens_thread_replies() {
        let adapter = BlueskyAdapter::new(None);
        let comments = adapter
            .parse_detail(&fixture("bluesky", "thread.json"), 10)
            .expect("thread");
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].author, "friend.bsky.social");
        assert_eq!(comments[1].depth, 1);
    }

    #[tokio::test]
    async fn listing_without_credentials_is_an_auth_failure() {
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("http");
        let adapter = BlueskyAdapter::new(None);
        let err = adapter
            .fetch_listing(&http, &ctx(), &query())
            .await
            .expect_err("no credentials");
        assert!(matches!(err, AdapterError::Auth { .. }));
    }

    #[tokio::test]
    async fn session_token_is_created_once_and_sent_as_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/com.atproto.server.createSession"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"accessJwt": "jwt-1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/app.bsky.feed.searchPosts"))
            .and(header("authorization", "Bearer jwt-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(fixture("bluesky", "search.json")))
            .mount(&server)
            .await;

        let http = HttpFetcher::new(HttpClientConfig::default()).expect("http");
        let adapter = BlueskyAdapter::new(Some(BlueskyCredentials {
            handle: "scout.bsky.social".into(),
            app_password: "app-pass".into(),
        }))
        .with_base_url(&server.uri());

        let first = adapter.fetch(&http, &ctx(), &query()).await.expect("first");
        let second = adapter.fetch(&http, &ctx(), &query()).await.expect("second");
        assert_eq!(first.candidates.len(), 1);
        assert_eq!(second.candidates.len(), 1);
    }

    #[tokio::test]
    async fn expired_session_is_replaced_on_the_next_run() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/com.atproto.server.createSession"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"accessJwt": "jwt-1"})))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/com.atproto.server.createSession"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"accessJwt": "jwt-2"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/app.bsky.feed.searchPosts"))
            .and(header("authorization", "Bearer jwt-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(fixture("bluesky", "search.json")))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/app.bsky.feed.searchPosts"))
            .and(header("authorization", "Bearer jwt-1"))
            .respond_with(ResponseTemplate::new(400).set_body_json(
                json!({"error": "ExpiredToken", "message": "Token has expired"}),
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/app.bsky.feed.searchPosts"))
            .and(header("authorization", "Bearer jwt-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(fixture("bluesky", "search.json")))
            .mount(&server)
            .await;

        let http = HttpFetcher::new(HttpClientConfig::default()).expect("http");
        let adapter = BlueskyAdapter::new(Some(BlueskyCredentials {
            handle: "scout.bsky.social".into(),
            app_password: "app-pass".into(),
        }))
        .with_base_url(&server.uri());

        let first = adapter.fetch(&http, &ctx(), &query()).await.expect("first run");
        assert_eq!(first.candidates.len(), 1);
        let second = adapter
            .fetch(&http, &ctx(), &query())
            .await
            .expect("second run after expiry");
        assert_eq!(second.candidates.len(), 1);
        assert_eq!(second.failed_requests, 0);
    }

    #[test]
    fn only_token_errors_count_as_rejected_sessions() {
        let status = |status: u16, detail: &str| FetchError::HttpStatus {
            status,
            url: "https://bsky.social/xrpc/app.bsky.feed.searchPosts".into(),
            detail: detail.into(),
        };
        assert!(session_rejected(&status(401, "")));
        assert!(session_rejected(&status(400, r#"{"error":"ExpiredToken"}"#)));
        assert!(!session_rejected(&status(400, r#"{"error":"InvalidRequest"}"#)));
        assert!(!session_rejected(&status(503, "")));
    }
}
