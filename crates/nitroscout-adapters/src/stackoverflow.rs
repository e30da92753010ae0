//! Stack Overflow via the Stack Exchange 2.3 API (anonymous quota).

use async_trait::async_trait;
use nitroscout_core::{excerpt, Candidate, ContentDepth, EngagementMetrics, Source, ThreadComment};
use nitroscout_storage::{FetchRequest, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{
    collect_pages, decode_items, html_to_text, matching_keywords, timestamp_secs, AdapterContext,
    AdapterError, ListingFetch, ListingOutcome, ListingPage, QueryConfig, SourceAdapter,
    SourceVolume, EXCERPT_CHARS,
};

const STACKEXCHANGE_BASE_URL: &str = "https://api.stackexchange.com/2.3";
const SITE: &str = "stackoverflow";
const COMMUNITY: &str = "stackoverflow";

#[derive(Debug, Clone)]
pub struct StackOverflowAdapter {
    base_url: String,
}

impl StackOverflowAdapter {
    pub fn new() -> Self {
        Self {
            base_url: STACKEXCHANGE_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    fn search_request(&self, query: &QueryConfig, fromdate: i64) -> FetchRequest {
        FetchRequest::get(format!("{}/search/advanced", self.base_url))
            .query("site", SITE)
            .query("filter", "withbody")
            .query("order", "desc")
            .query("sort", query.sort.as_deref().unwrap_or("creation"))
            .query("pagesize", query.limit.min(100))
            .query("fromdate", fromdate)
    }
}

impl Default for StackOverflowAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct Question {
    question_id: u64,
    title: String,
    link: String,
    creation_date: i64,
    #[serde(default)]
    body: String,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    answer_count: u32,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Owner {
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Answer {
    #[serde(default)]
    owner: Option<Owner>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    score: i64,
}

#[async_trait]
impl SourceAdapter for StackOverflowAdapter {
    fn source(&self) -> Source {
        Source::StackOverflow
    }

    fn volume(&self) -> SourceVolume {
        SourceVolume::Targeted
    }

    /// One request per keyword, plus one per configured tag with no free-text query.
    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        query: &QueryConfig,
    ) -> Result<ListingFetch, AdapterError> {
        let fromdate = query.cutoff(ctx.fetched_at).timestamp();
        let mut requests: Vec<_> = query
            .keywords
            .iter()
            .map(|keyword| {
                let request = self.search_request(query, fromdate).query("q", keyword);
                (COMMUNITY.to_string(), Some(keyword.clone()), request)
            })
            .collect();
        requests.extend(query.communities.iter().map(|tag| {
            let request = self.search_request(query, fromdate).query("tagged", tag);
            (COMMUNITY.to_string(), None, request)
        }));
        collect_pages(http, Source::StackOverflow, requests).await
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
            let (questions, skipped) = decode_items::<Question>(
                Source::StackOverflow,
                page.body.get("items").and_then(JsonValue::as_array),
            );
            outcome.skipped += skipped;

            for (question, raw) in questions {
                let Some(published_at) = timestamp_secs(question.creation_date) else {
                    outcome.skipped += 1;
                    continue;
                };
                if published_at <= cutoff {
                    continue;
                }
                let title = html_to_text(&question.title);
                let body = html_to_text(&question.body);
                let matched_keywords = match &page.keyword {
                    Some(keyword) => vec![keyword.clone()],
                    None => {
                        let searchable = format!("{} {} {}", title, body, question.tags.join(" "));
                        matching_keywords(&searchable, &query.keywords)
                    }
                };
                outcome.candidates.push(Candidate {
                    source: Source::StackOverflow,
                    external_id: question.question_id.to_string(),
                    community: page.community.clone(),
                    url: question.link,
                    title,
                    body_excerpt: excerpt(&body, EXCERPT_CHARS),
                    engagement_metrics: EngagementMetrics {
                        points: question.score,
                        replies: question.answer_count,
                        reposts: 0,
                    },
                    discovered_at: ctx.fetched_at,
                    published_at: Some(published_at),
                    matched_keywords,
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
        query: &QueryConfig,
    ) -> Result<JsonValue, AdapterError> {
        let request = FetchRequest::get(format!(
            "{}/questions/{}/answers",
            self.base_url, candidate.external_id
        ))
        .query("site", SITE)
        .query("filter", "withbody")
        .query("order", "desc")
        .query("sort", "votes")
        .query("pagesize", query.max_comments.clamp(1, 100));
        Ok(http.fetch_json(Source::StackOverflow.slug(), &request).await?)
    }

    fn parse_detail(
        &self,
        body: &JsonValue,
        max_comments: usize,
    ) -> Result<Vec<ThreadComment>, AdapterError> {
        let items = body
            .get("items")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| AdapterError::Malformed {
                platform: Source::StackOverflow,
                message: "answers response has no items".to_string(),
            })?;
        let (answers, _) = decode_items::<Answer>(Source::StackOverflow, Some(items));
        Ok(answers
            .into_iter()
            .filter_map(|(answer, _)| {
                let text = html_to_text(&answer.body);
                (!text.is_empty()).then(|| ThreadComment {
                    author: answer
                        .owner
                        .and_then(|o| o.display_name)
                        .unwrap_or_else(|| "anonymous".to_string()),
                    text,
                    score: Some(answer.score),
                    depth: 0,
                })
            })
            .take(max_comments)
            .collect())
    }
}
