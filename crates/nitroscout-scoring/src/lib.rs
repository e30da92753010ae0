//! Batched relevance scoring against a rate-limited language-model oracle.
//!
//! Candidates are grouped per community into bounded [`Batch`]es, each sent as one
//! [`OracleRequest`]. Responses must cover every submitted id exactly once; rate limits rotate
//! through a shared [`CredentialPool`].

mod batch;
mod credentials;
mod gemini;
mod oracle;
mod scorer;

pub use batch::{plan_batches, Batch, BatchLimits, CommunityBatches};
pub use credentials::{Credential, CredentialPool, Lease};
pub use gemini::{parse_scores, strip_code_blocks, truncate_to_char_boundary, GeminiOracle, DEFAULT_MODEL};
pub use oracle::{
    validate_coverage, CoverageError, CoveredScores, OracleError, OracleItem, OracleRequest,
    OracleScore, ScoringOracle,
};
pub use scorer::{BatchFailure, BatchScorer, FailedBatch, ScorerConfig, ScoringOutcome};

pub const CRATE_NAME: &str = "nitroscout-scoring";

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use nitroscout_core::{Candidate, ContentDepth, EngagementMetrics, Source};

    use super::*;

    pub fn candidate(id: &str, community: &str, body: &str) -> Candidate {
        let source = if community == "hackernews" {
            Source::HackerNews
        } else {
            Source::Reddit
        };
        Candidate {
            source,
            external_id: id.to_string(),
            community: community.to_string(),
            url: format!("https://example.test/{id}"),
            title: format!("Thread {id}"),
            body_excerpt: body.to_string(),
            engagement_metrics: EngagementMetrics {
                points: 10,
                replies: 2,
                reposts: 0,
            },
            discovered_at: Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().expect("ts"),
            published_at: None,
            matched_keywords: vec!["mcp".into()],
            raw_payload: serde_json::json!({ "id": id }),
            thread: Vec::new(),
            content_depth: ContentDepth::MetadataOnly,
        }
    }

    type ScoreFn = Box<dyn Fn(&str, usize) -> i64 + Send + Sync>;

    /// In-memory oracle whose behaviour is set per test.
    pub struct ScriptedOracle {
        score: ScoreFn,
        rate_limited: Vec<String>,
        dropped: Vec<String>,
        transport_failures: AtomicUsize,
        delay: Option<Duration>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedOracle {
        pub fn scoring(score: impl Fn(&str, usize) -> i64 + Send + Sync + 'static) -> Self {
            Self {
                score: Box::new(score),
                rate_limited: Vec::new(),
                dropped: Vec::new(),
                transport_failures: AtomicUsize::new(0),
                delay: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn rate_limit_key(mut self, secret: &str) -> Self {
            self.rate_limited.push(secret.to_string());
            self
        }

        pub fn drop_id(mut self, id: &str) -> Self {
            self.dropped.push(id.to_string());
            self
        }

        pub fn transport_failures(self, count: usize) -> Self {
            self.transport_failures.store(count, Ordering::SeqCst);
            self
        }

        pub fn delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        /// Secrets used, in call order.
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl ScoringOracle for ScriptedOracle {
        async fn score_batch(
            &self,
            credential: &Credential,
            request: &OracleRequest,
        ) -> Result<Vec<OracleScore>, OracleError> {
            self.calls
                .lock()
                .expect("calls lock")
                .push(credential.secret.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.rate_limited.contains(&credential.secret) {
                return Err(OracleError::RateLimited("429 RESOURCE_EXHAUSTED".into()));
            }
            let remaining = self.transport_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.transport_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(OracleError::Transport("connection reset".into()));
            }
            Ok(request
                .items
                .iter()
                .enumerate()
                .filter(|(_, item)| !self.dropped.contains(&item.id))
                .map(|(i, item)| OracleScore {
                    id: item.id.clone(),
                    score: (self.score)(&item.id, i),
                    rationale: format!("scored {}", item.id),
                })
                .collect())
        }
    }
}
