//! Per-batch scoring state machine and the community-level scheduler around it.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use nitroscout_core::{Candidate, CandidateKey, ScoredCandidate};
use nitroscout_storage::BackoffPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::batch::{plan_batches, Batch, BatchLimits, CommunityBatches};
use crate::credentials::{CredentialPool, Lease};
use crate::oracle::{validate_coverage, CoverageError, CoveredScores, OracleError, ScoringOracle};

#[derive(Debug, Clone)]
pub struct ScorerConfig {
    pub limits: BatchLimits,
    /// Transport/timeout attempts per batch before it is failed.
    pub max_attempts: usize,
    pub call_timeout: Duration,
    pub community_parallelism: usize,
    pub backoff: BackoffPolicy,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            limits: BatchLimits::default(),
            max_attempts: 3,
            call_timeout: Duration::from_secs(90),
            community_parallelism: 2,
            backoff: BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_secs(3),
                max_delay: Duration::from_secs(30),
            },
        }
    }
}

/// Why a batch ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchFailure {
    #[error("no oracle credentials configured")]
    NoCredentials,
    #[error("credential pool exhausted after {rate_limits} rate limit(s)")]
    PoolExhausted { rate_limits: usize },
    #[error("gave up after {attempts} transport attempt(s): {last_error}")]
    TransportExhausted { attempts: usize, last_error: String },
    #[error("oracle returned a malformed response: {0}")]
    Malformed(String),
    #[error("coverage validation failed: {0}")]
    Coverage(#[from] CoverageError),
}

/// Lifecycle of one batch. `Succeeded` and `Failed` are terminal.
#[derive(Debug)]
enum BatchState {
    Pending,
    Sending { lease: Lease },
    RateLimited { lease: Lease },
    Succeeded(CoveredScores),
    Failed(BatchFailure),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedBatch {
    pub community: String,
    pub index: usize,
    pub total: usize,
    pub candidates: Vec<CandidateKey>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoringOutcome {
    /// Sorted by candidate key.
    pub scored: Vec<ScoredCandidate>,
    pub failed_batches: Vec<FailedBatch>,
}

impl ScoringOutcome {
    /// Candidates of `community` left out because their batch failed.
    pub fn omitted_in(&self, community: &str) -> usize {
        self.failed_batches
            .iter()
            .filter(|b| b.community == community)
            .map(|b| b.candidates.len())
            .sum()
    }

    pub fn failed_batches_in(&self, community: &str) -> usize {
        self.failed_batches.iter().filter(|b| b.community == community).count()
    }
}

pub struct BatchScorer {
    oracle: Arc<dyn ScoringOracle>,
    pool: Arc<CredentialPool>,
    config: ScorerConfig,
}

impl BatchScorer {
    pub fn new(oracle: Arc<dyn ScoringOracle>, pool: Arc<CredentialPool>, config: ScorerConfig) -> Self {
        Self { oracle, pool, config }
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    /// Score every candidate. Batches of one community run in order; communities run
    /// concurrently up to `community_parallelism`.
    pub async fn score(&self, candidates: &[Candidate]) -> ScoringOutcome {
        let plan = plan_batches(candidates, &self.config.limits);
        let parallelism = self.config.community_parallelism.max(1);

        let futures: Vec<_> = plan
            .into_iter()
            .map(|community| self.score_community(community))
            .collect();
        let results: Vec<ScoringOutcome> = stream::iter(futures)
            .buffer_unordered(parallelism)
            .collect()
            .await;

        let mut outcome = ScoringOutcome::default();
        for result in results {
            outcome.scored.extend(result.scored);
            outcome.failed_batches.extend(result.failed_batches);
        }
        outcome.scored.sort_by_key(|s| s.key());
        outcome
            .failed_batches
            .sort_by(|a, b| (&a.community, a.index).cmp(&(&b.community, b.index)));
        outcome
    }

    async fn score_community(&self, community: CommunityBatches<'_>) -> ScoringOutcome {
        let mut outcome = ScoringOutcome::default();
        for batch in community.batches {
            info!(
                community = %batch.community,
                batch = batch.index,
                total = batch.total,
                candidates = batch.candidates.len(),
                estimated_tokens = batch.estimated_tokens,
                "scoring batch"
            );
            match self.run_batch(&batch).await {
                Ok(covered) => {
                    for candidate in &batch.candidates {
                        let id = candidate.key().to_string();
                        if let Some((score, rationale)) = covered.get(&id) {
                            outcome
                                .scored
                                .push(ScoredCandidate::new((*candidate).clone(), *score, rationale.clone()));
                        }
                    }
                }
                Err(failure) => {
                    warn!(
                        community = %batch.community,
                        batch = batch.index,
                        total = batch.total,
                        candidates = batch.candidates.len(),
                        error = %failure,
                        "batch failed; candidates omitted"
                    );
                    outcome.failed_batches.push(FailedBatch {
                        community: batch.community.clone(),
                        index: batch.index,
                        total: batch.total,
                        candidates: batch.candidates.iter().map(|c| c.key()).collect(),
                        reason: failure.to_string(),
                    });
                }
            }
        }
        outcome
    }

    /// Drive one batch from `Pending` to a terminal state.
    async fn run_batch(&self, batch: &Batch<'_>) -> Result<CoveredScores, BatchFailure> {
        let mut state = BatchState::Pending;
        let mut transport_attempts = 0usize;
        let mut rate_limits = 0usize;

        loop {
            state = match state {
                BatchState::Pending => match self.pool.current().await {
                    Some(lease) => BatchState::Sending { lease },
                    None if self.pool.is_empty() => BatchState::Failed(BatchFailure::NoCredentials),
                    None => BatchState::Failed(BatchFailure::PoolExhausted { rate_limits }),
                },
                BatchState::Sending { lease } => {
                    let call = self.oracle.score_batch(&lease.credential, &batch.request);
                    let result = match tokio::time::timeout(self.config.call_timeout, call).await {
                        Ok(result) => result,
                        Err(_) => Err(OracleError::Transport(format!(
                            "oracle call timed out after {:?}",
                            self.config.call_timeout
                        ))),
                    };
                    match result {
                        Ok(scores) => match validate_coverage(&batch.request, scores) {
                            Ok(covered) => BatchState::Succeeded(covered),
                            Err(err) => BatchState::Failed(err.into()),
                        },
                        Err(OracleError::RateLimited(_)) => BatchState::RateLimited { lease },
                        Err(OracleError::Malformed(message)) => {
                            BatchState::Failed(BatchFailure::Malformed(message))
                        }
                        Err(OracleError::Transport(message)) => {
                            transport_attempts += 1;
                            if transport_attempts >= self.config.max_attempts.max(1) {
                                BatchState::Failed(BatchFailure::TransportExhausted {
                                    attempts: transport_attempts,
                                    last_error: message,
                                })
                            } else {
                                warn!(
                                    community = %batch.community,
                                    batch = batch.index,
                                    attempt = transport_attempts,
                                    error = %message,
                                    "oracle transport error; retrying"
                                );
                                tokio::time::sleep(self.config.backoff.delay_for_attempt(transport_attempts - 1))
                                    .await;
                                BatchState::Sending { lease }
                            }
                        }
                    }
                }
                BatchState::RateLimited { lease } => {
                    rate_limits += 1;
                    match self.pool.report_rate_limited(&lease).await {
                        Some(next) => {
                            tokio::time::sleep(self.config.backoff.delay_for_attempt(rate_limits - 1)).await;
                            BatchState::Sending { lease: next }
                        }
                        None => BatchState::Failed(BatchFailure::PoolExhausted { rate_limits }),
                    }
                }
                BatchState::Succeeded(covered) => return Ok(covered),
                BatchState::Failed(failure) => return Err(failure),
            };
        }
    }
}
