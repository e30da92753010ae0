//! Core domain model for NitroScout: candidates, scores and reports.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "nitroscout-core";

/// Score at or above which a lead is considered high signal.
pub const HIGH_SIGNAL_MIN: u8 = 7;
/// Score at or above which a lead is considered medium signal.
pub const MEDIUM_SIGNAL_MIN: u8 = 4;
/// Upper bound of the relevance scale.
pub const MAX_RELEVANCE_SCORE: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    HackerNews,
    Reddit,
    Bluesky,
    StackOverflow,
}

impl Source {
    pub const ALL: [Source; 4] = [
        Source::HackerNews,
        Source::Reddit,
        Source::Bluesky,
        Source::StackOverflow,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            Source::HackerNews => "hackernews",
            Source::Reddit => "reddit",
            Source::Bluesky => "bluesky",
            Source::StackOverflow => "stackoverflow",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Source::HackerNews => "Hacker News",
            Source::Reddit => "Reddit",
            Source::Bluesky => "Bluesky",
            Source::StackOverflow => "Stack Overflow",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.slug() == slug)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Identity of a candidate within a run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CandidateKey {
    pub source: Source,
    pub external_id: String,
}

impl CandidateKey {
    pub fn new(source: Source, external_id: impl Into<String>) -> Self {
        Self {
            source,
            external_id: external_id.into(),
        }
    }
}

impl fmt::Display for CandidateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source.slug(), self.external_id)
    }
}

/// Source-specific engagement counters folded into one envelope.
///
/// `points` holds HN points, Reddit upvotes, Bluesky likes or SO question score;
/// `replies` holds comments/answers; `reposts` holds reposts or views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngagementMetrics {
    pub points: i64,
    pub replies: u32,
    pub reposts: u32,
}

impl EngagementMetrics {
    pub fn weight(&self) -> i64 {
        self.points
            .saturating_add(i64::from(self.replies))
            .saturating_add(i64::from(self.reposts))
    }
}

/// One comment/answer in a fetched discussion thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadComment {
    pub author: String,
    pub text: String,
    pub score: Option<i64>,
    pub depth: u32,
}

/// How much content a candidate carries into scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentDepth {
    #[default]
    MetadataOnly,
    FullThread,
    EnrichmentFailed,
}

/// One discovered discussion item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub source: Source,
    pub external_id: String,
    /// Sub-community the item belongs to (`r/mcp`, `hackernews`, ...); reports are keyed by it.
    pub community: String,
    pub url: String,
    pub title: String,
    pub body_excerpt: String,
    pub engagement_metrics: EngagementMetrics,
    pub discovered_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub matched_keywords: Vec<String>,
    /// Opaque source payload kept so the thread can be fetched later.
    pub raw_payload: JsonValue,
    #[serde(default)]
    pub thread: Vec<ThreadComment>,
    #[serde(default)]
    pub content_depth: ContentDepth,
}

impl Candidate {
    pub fn key(&self) -> CandidateKey {
        CandidateKey::new(self.source, self.external_id.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalTier {
    High,
    Medium,
    Low,
}

impl SignalTier {
    pub fn from_score(score: u8) -> Self {
        if score >= HIGH_SIGNAL_MIN {
            SignalTier::High
        } else if score >= MEDIUM_SIGNAL_MIN {
            SignalTier::Medium
        } else {
            SignalTier::Low
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SignalTier::High => "high",
            SignalTier::Medium => "medium",
            SignalTier::Low => "low",
        }
    }
}

/// A candidate with an oracle-assigned relevance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub relevance_score: u8,
    pub rationale: String,
    pub signal_tier: SignalTier,
}

impl ScoredCandidate {
    pub fn new(candidate: Candidate, relevance_score: u8, rationale: impl Into<String>) -> Self {
        let relevance_score = relevance_score.min(MAX_RELEVANCE_SCORE);
        Self {
            candidate,
            relevance_score,
            rationale: rationale.into(),
            signal_tier: SignalTier::from_score(relevance_score),
        }
    }

    pub fn key(&self) -> CandidateKey {
        self.candidate.key()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReportIdentity {
    pub source: Source,
    pub community: String,
    pub date: NaiveDate,
}

impl ReportIdentity {
    pub fn slug(&self) -> String {
        slugify(&self.community)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub scored: usize,
    /// Candidates lost to failed batches.
    pub omitted: usize,
    pub failed_batches: usize,
    /// Candidates not shortlisted by the pre-score pass.
    #[serde(default)]
    pub prefiltered: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

/// Per-community, per-date scored lead listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub identity: ReportIdentity,
    pub briefing: String,
    pub summary: ReportSummary,
    pub entries: Vec<ScoredCandidate>,
}

/// Lowercase, `-`-separated form of an arbitrary label, safe for file names.
pub fn slugify(input: &str) -> String {
    input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Truncate to at most `max_chars` characters, appending an ellipsis when cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", collapsed[..idx].trim_end()),
        None => collapsed,
    }
}
