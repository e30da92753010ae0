//! Two-phase filter: a cheap deterministic pre-score, then thread enrichment of the shortlist.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use nitroscout_adapters::{QueryConfig, SourceAdapter};
use nitroscout_core::{Candidate, ContentDepth};
use nitroscout_storage::HttpFetcher;
use tracing::{debug, warn};

use crate::config::PrefilterSettings;

const TITLE_HIT: f64 = 3.0;
const EXCERPT_HIT: f64 = 1.0;
const RECENCY_MAX_BONUS: f64 = 2.0;

/// Keyword hits, log-damped engagement and a recency bonus that decays linearly over the lookback.
pub fn pre_score(candidate: &Candidate, query: &QueryConfig, now: DateTime<Utc>) -> f64 {
    let title = candidate.title.to_lowercase();
    let excerpt = candidate.body_excerpt.to_lowercase();
    let mut score = 0.0;
    for keyword in &query.keywords {
        let keyword = keyword.trim().to_lowercase();
        if keyword.is_empty() {
            continue;
        }
        if title.contains(&keyword) {
            score += TITLE_HIT;
        }
        if excerpt.contains(&keyword) {
            score += EXCERPT_HIT;
        }
    }

    score += (candidate.engagement_metrics.weight().max(0) as f64).ln_1p();

    let lookback_secs = query.lookback().num_seconds() as f64;
    if lookback_secs > 0.0 {
        let posted = candidate.published_at.unwrap_or(candidate.discovered_at);
        let age_secs = (now - posted).num_seconds().max(0) as f64;
        score += RECENCY_MAX_BONUS * (1.0 - age_secs / lookback_secs).max(0.0);
    }
    score
}

/// Result of phase 1: the kept candidates (best first) and how many were dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Shortlist {
    pub kept: Vec<Candidate>,
    pub dropped: usize,
}

pub fn shortlist(
    candidates: Vec<Candidate>,
    query: &QueryConfig,
    settings: &PrefilterSettings,
    now: DateTime<Utc>,
) -> Shortlist {
    let total = candidates.len();
    let mut ranked: Vec<(f64, Candidate)> = candidates
        .into_iter()
        .map(|c| (pre_score(&c, query, now), c))
        .filter(|(score, _)| *score >= settings.min_pre_score)
        .collect();
    ranked.sort_by(|(a_score, a), (b_score, b)| {
        b_score
            .total_cmp(a_score)
            .then_with(|| a.key().cmp(&b.key()))
    });
    if settings.shortlist_size > 0 {
        ranked.truncate(settings.shortlist_size);
    }

    let kept: Vec<Candidate> = ranked.into_iter().map(|(_, c)| c).collect();
    Shortlist {
        dropped: total - kept.len(),
        kept,
    }
}

/// Phase 2: attach discussion threads. Failures degrade to metadata-only and never drop a candidate.
pub async fn enrich(
    adapter: &dyn SourceAdapter,
    http: &HttpFetcher,
    query: &QueryConfig,
    candidates: Vec<Candidate>,
    concurrency: usize,
) -> Vec<Candidate> {
    let mut enriched: Vec<Candidate> = stream::iter(candidates)
        .map(|mut candidate| async move {
            match adapter.fetch_thread(http, &candidate, query).await {
                Ok(thread) => {
                    debug!(key = %candidate.key(), comments = thread.len(), "thread attached");
                    candidate.thread = thread;
                    candidate.content_depth = ContentDepth::FullThread;
                }
                Err(err) => {
                    warn!(key = %candidate.key(), error = %err, "thread fetch failed; scoring metadata only");
                    candidate.content_depth = ContentDepth::EnrichmentFailed;
                }
            }
            candidate
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;
    enriched.sort_by(|a, b| a.key().cmp(&b.key()));
    enriched
}
