//! Request/response contract of the external scoring service.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use nitroscout_core::{excerpt, Candidate, MAX_RELEVANCE_SCORE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

use crate::credentials::Credential;

/// One candidate summary as the oracle sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleItem {
    pub id: String,
    pub title: String,
    pub excerpt: String,
    pub metadata: JsonValue,
}

impl OracleItem {
    /// Summarise a candidate; thread comments are appended to the excerpt up to `thread_chars`.
    pub fn from_candidate(candidate: &Candidate, thread_chars: usize) -> Self {
        let mut text = candidate.body_excerpt.clone();
        if !candidate.thread.is_empty() && thread_chars > 0 {
            let thread = candidate
                .thread
                .iter()
                .map(|c| format!("{}> {}: {}", "-".repeat(c.depth as usize), c.author, c.text))
                .collect::<Vec<_>>()
                .join(" / ");
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            text.push_str("Discussion: ");
            text.push_str(&excerpt(&thread, thread_chars));
        }

        Self {
            id: candidate.key().to_string(),
            title: candidate.title.clone(),
            excerpt: text,
            metadata: json!({
                "source": candidate.source.display_name(),
                "community": candidate.community,
                "url": candidate.url,
                "points": candidate.engagement_metrics.points,
                "replies": candidate.engagement_metrics.replies,
                "reposts": candidate.engagement_metrics.reposts,
                "matched_keywords": candidate.matched_keywords,
                "content_depth": candidate.content_depth,
            }),
        }
    }

    /// Rough token cost: serialized characters / 4.
    pub fn estimated_tokens(&self) -> usize {
        let chars = self.title.chars().count()
            + self.excerpt.chars().count()
            + self.metadata.to_string().chars().count();
        chars.div_ceil(4)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleRequest {
    pub community: String,
    pub items: Vec<OracleItem>,
}

/// One scored entry of an oracle response. The score is kept wide so out-of-range values
/// are caught by validation instead of failing deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleScore {
    pub id: String,
    pub score: i64,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait ScoringOracle: Send + Sync {
    async fn score_batch(
        &self,
        credential: &Credential,
        request: &OracleRequest,
    ) -> Result<Vec<OracleScore>, OracleError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoverageError {
    #[error("response is missing {} id(s): {}", .0.len(), .0.join(", "))]
    Missing(Vec<String>),
    #[error("response scores {0} more than once")]
    Duplicate(String),
    #[error("response contains unknown id {0}")]
    Unknown(String),
    #[error("score {score} for {id} is outside 0..=10")]
    OutOfRange { id: String, score: i64 },
}

/// Accepted score and rationale, keyed by submitted id.
pub type CoveredScores = BTreeMap<String, (u8, String)>;

/// Check that `response` scores every submitted id exactly once and nothing else.
pub fn validate_coverage(
    request: &OracleRequest,
    response: Vec<OracleScore>,
) -> Result<CoveredScores, CoverageError> {
    let submitted: BTreeSet<&str> = request.items.iter().map(|i| i.id.as_str()).collect();
    let mut covered = CoveredScores::new();

    for entry in response {
        if !submitted.contains(entry.id.as_str()) {
            return Err(CoverageError::Unknown(entry.id));
        }
        let score = u8::try_from(entry.score)
            .ok()
            .filter(|s| *s <= MAX_RELEVANCE_SCORE)
            .ok_or_else(|| CoverageError::OutOfRange {
                id: entry.id.clone(),
                score: entry.score,
            })?;
        if covered.contains_key(&entry.id) {
            return Err(CoverageError::Duplicate(entry.id));
        }
        covered.insert(entry.id, (score, entry.rationale.trim().to_string()));
    }

    let missing: Vec<String> = submitted
        .into_iter()
        .filter(|id| !covered.contains_key(*id))
        .map(str::to_string)
        .collect();
    if !missing.is_empty() {
        return Err(CoverageError::Missing(missing));
    }
    Ok(covered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(ids: &[&str]) -> OracleRequest {
        OracleRequest {
            community: "r/mcp".into(),
            items: ids
                .iter()
                .map(|id| OracleItem {
                    id: id.to_string(),
                    title: format!("title {id}"),
                    excerpt: String::new(),
                    metadata: JsonValue::Null,
                })
                .collect(),
        }
    }

    fn score(id: &str, score: i64) -> OracleScore {
        OracleScore {
            id: id.into(),
            score,
            rationale: " fits ".into(),
        }
    }

    #[test]
    fn exact_coverage_is_accepted() {
        let covered = validate_coverage(&request(&["a", "b"]), vec![score("b", 3), score("a", 10)])
            .expect("valid");
        assert_eq!(covered.len(), 2);
        assert_eq!(covered["a"], (10, "fits".to_string()));
    }

    #[test]
    fn missing_duplicate_unknown_and_out_of_range_fail() {
        let req = request(&["a", "b", "c"]);
        assert_eq!(
            validate_coverage(&req, vec![score("a", 1)]),
            Err(CoverageError::Missing(vec!["b".into(), "c".into()]))
        );
        assert_eq!(
            validate_coverage(&req, vec![score("a", 1), score("a", 2), score("b", 1), score("c", 1)]),
            Err(CoverageError::Duplicate("a".into()))
        );
        assert_eq!(
            validate_coverage(&req, vec![score("a", 1), score("b", 1), score("c", 1), score("z", 1)]),
            Err(CoverageError::Unknown("z".into()))
        );
        assert!(matches!(
            validate_coverage(&req, vec![score("a", 11), score("b", 1), score("c", 1)]),
            Err(CoverageError::OutOfRange { score: 11, .. })
        ));
        assert!(matches!(
            validate_coverage(&req, vec![score("a", -1), score("b", 1), score("c", 1)]),
            Err(CoverageError::OutOfRange { score: -1, .. })
        ));
    }
}
