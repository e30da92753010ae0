//! Lead aggregation: run every adapter, merge into one deduplicated candidate set.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use nitroscout_adapters::{AdapterContext, ListingOutcome, QueryConfig, SourceAdapter};
use nitroscout_core::{Candidate, CandidateKey, Source};
use nitroscout_storage::{ArtifactStore, HttpFetcher, PublishedArtifact};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// What one adapter produced this run.
#[derive(Debug)]
pub struct SourceResult {
    pub source: Source,
    pub outcome: Result<ListingOutcome, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub source: Source,
    pub succeeded: bool,
    pub candidates: usize,
    pub skipped_items: usize,
    pub failed_requests: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The durable unit of work handed to scoring; persisted as `runs/{date}/candidates.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSet {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub fetched_at: DateTime<Utc>,
    pub sources: Vec<SourceStatus>,
    /// Sorted by key; one entry per `(source, external_id)`.
    pub candidates: Vec<Candidate>,
}

impl CandidateSet {
    pub fn relative_path(run_date: NaiveDate) -> PathBuf {
        PathBuf::from("runs")
            .join(run_date.format("%Y-%m-%d").to_string())
            .join("candidates.json")
    }

    pub fn failed_sources(&self) -> Vec<Source> {
        self.sources.iter().filter(|s| !s.succeeded).map(|s| s.source).collect()
    }

    pub fn succeeded(&self, source: Source) -> bool {
        self.sources.iter().any(|s| s.source == source && s.succeeded)
    }

    pub fn for_source(&self, source: Source) -> impl Iterator<Item = &Candidate> {
        self.candidates.iter().filter(move |c| c.source == source)
    }

    pub async fn persist(&self, store: &ArtifactStore) -> Result<PublishedArtifact> {
        let mut body = serde_json::to_vec_pretty(self).context("serializing candidate set")?;
        body.push(b'\n');
        store
            .publish(Self::relative_path(self.run_date), &body)
            .await
            .context("publishing candidate set")
    }

    pub async fn load(store: &ArtifactStore, run_date: NaiveDate) -> Result<Self> {
        let path = Self::relative_path(run_date);
        let bytes = store
            .read(&path)
            .await
            .with_context(|| format!("no aggregated candidates for {run_date}; run `aggregate` first"))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Fold a rediscovered candidate into the one already held.
fn merge_into(existing: &mut Candidate, update: Candidate) {
    existing.engagement_metrics = update.engagement_metrics;
    existing.raw_payload = update.raw_payload;
    existing.discovered_at = existing.discovered_at.min(update.discovered_at);
    for keyword in update.matched_keywords {
        if !existing.matched_keywords.contains(&keyword) {
            existing.matched_keywords.push(keyword);
        }
    }
    if existing.published_at.is_none() {
        existing.published_at = update.published_at;
    }
}

/// Merge adapter results keyed by `(source, external_id)`. Failed sources contribute nothing.
pub fn aggregate(ctx: &AdapterContext, results: Vec<SourceResult>) -> CandidateSet {
    let mut merged: BTreeMap<CandidateKey, Candidate> = BTreeMap::new();
    let mut sources = Vec::with_capacity(results.len());

    for result in results {
        match result.outcome {
            Ok(outcome) => {
                sources.push(SourceStatus {
                    source: result.source,
                    succeeded: true,
                    candidates: 0,
                    skipped_items: outcome.skipped,
                    failed_requests: outcome.failed_requests,
                    error: None,
                });
                for candidate in outcome.candidates {
                    match merged.get_mut(&candidate.key()) {
                        Some(existing) => merge_into(existing, candidate),
                        None => {
                            merged.insert(candidate.key(), candidate);
                        }
                    }
                }
            }
            Err(error) => sources.push(SourceStatus {
                source: result.source,
                succeeded: false,
                candidates: 0,
                skipped_items: 0,
                failed_requests: 0,
                error: Some(error),
            }),
        }
    }

    let candidates: Vec<Candidate> = merged.into_values().collect();
    for status in &mut sources {
        status.candidates = candidates.iter().filter(|c| c.source == status.source).count();
    }
    sources.sort_by_key(|s| s.source);

    CandidateSet {
        run_id: ctx.run_id,
        run_date: ctx.fetched_at.date_naive(),
        fetched_at: ctx.fetched_at,
        sources,
        candidates,
    }
}

/// Runs every configured adapter concurrently and isolates their failures.
pub struct LeadAggregator<'a> {
    http: &'a HttpFetcher,
    sources: Vec<(&'a dyn SourceAdapter, &'a QueryConfig)>,
}

impl<'a> LeadAggregator<'a> {
    pub fn new(http: &'a HttpFetcher) -> Self {
        Self {
            http,
            sources: Vec::new(),
        }
    }

    pub fn source(mut self, adapter: &'a dyn SourceAdapter, query: &'a QueryConfig) -> Self {
        self.sources.push((adapter, query));
        self
    }

    pub async fn collect(&self, ctx: &AdapterContext) -> Vec<SourceResult> {
        let fetches = self.sources.iter().map(|(adapter, query)| async move {
            let source = adapter.source();
            let outcome = match adapter.fetch(self.http, ctx, query).await {
                Ok(outcome) => {
                    info!(
                        source = %source,
                        candidates = outcome.candidates.len(),
                        skipped = outcome.skipped,
                        failed_requests = outcome.failed_requests,
                        "source fetched"
                    );
                    Ok(outcome)
                }
                Err(err) => {
                    warn!(source = %source, error = %err, "source failed; continuing without it");
                    Err(err.to_string())
                }
            };
            SourceResult { source, outcome }
        });
        join_all(fetches).await
    }

    pub async fn run(&self, ctx: &AdapterContext) -> CandidateSet {
        aggregate(ctx, self.collect(ctx).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{candidate, ctx};

    #[test]
    fn rediscovery_updates_metrics_but_never_duplicates() {
        let mut first = candidate(Source::HackerNews, "1", "hackernews");
        first.matched_keywords = vec!["mcp".into()];
        first.engagement_metrics.points = 10;

        let mut again = candidate(Source::HackerNews, "1", "hackernews");
        again.matched_keywords = vec!["mcp server".into(), "mcp".into()];
        again.engagement_metrics.points = 25;
        again.discovered_at = first.discovered_at + chrono::Duration::minutes(5);

        let other_source_same_id = candidate(Source::Reddit, "1", "r/mcp");

        let set = aggregate(
            &ctx(),
            vec![
                SourceResult {
                    source: Source::HackerNews,
                    outcome: Ok(ListingOutcome {
                        candidates: vec![first.clone(), again],
                        skipped: 1,
                        failed_requests: 0,
                    }),
                },
                SourceResult {
                    source: Source::Reddit,
                    outcome: Ok(ListingOutcome {
                        candidates: vec![other_source_same_id],
                        ..Default::default()
                    }),
                },
            ],
        );

        assert_eq!(set.candidates.len(), 2);
        let hn = set.for_source(Source::HackerNews).next().expect("hn");
        assert_eq!(hn.engagement_metrics.points, 25, "metrics are last-write-wins");
        assert_eq!(hn.discovered_at, first.discovered_at, "discovered_at is first-write-wins");
        assert_eq!(hn.matched_keywords, vec!["mcp".to_string(), "mcp server".to_string()]);
        assert_eq!(set.sources[0].candidates, 1);
        assert_eq!(set.sources[0].skipped_items, 1);
    }

    #[test]
    fn failed_source_is_recorded_and_contributes_nothing() {
        let set = aggregate(
            &ctx(),
            vec![
                SourceResult {
                    source: Source::Bluesky,
                    outcome: Err("bluesky authentication failed".into()),
                },
                SourceResult {
                    source: Source::HackerNews,
                    outcome: Ok(ListingOutcome {
                        candidates: vec![candidate(Source::HackerNews, "7", "hackernews")],
                        ..Default::default()
                    }),
                },
            ],
        );
        assert_eq!(set.failed_sources(), vec![Source::Bluesky]);
        assert!(set.succeeded(Source::HackerNews));
        assert!(!set.succeeded(Source::Bluesky));
        assert_eq!(set.candidates.len(), 1);
    }

    #[tokio::test]
    async fn candidate_set_round_trips_through_the_store() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(tmp.path());
        let set = aggregate(
            &ctx(),
            vec![SourceResult {
                source: Source::HackerNews,
                outcome: Ok(ListingOutcome {
                    candidates: vec![candidate(Source::HackerNews, "7", "hackernews")],
                    ..Default::default()
                }),
            }],
        );
        let published = set.persist(&store).await.expect("persist");
        assert!(published.relative_path.ends_with("2026-02-24/candidates.json"));

        let loaded = CandidateSet::load(&store, set.run_date).await.expect("load");
        assert_eq!(loaded, set);

        let missing = CandidateSet::load(&store, NaiveDate::from_ymd_opt(2020, 1, 1).expect("date")).await;
        assert!(missing.is_err());
    }
}
