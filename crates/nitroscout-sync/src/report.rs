//! Report merger: one ordered, deterministic report per community and date.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use nitroscout_core::{
    ContentDepth, Report, ReportIdentity, ReportSummary, ScoredCandidate, SignalTier,
};
use nitroscout_storage::{ArtifactStore, PublishedArtifact};

/// What a failed or filtered stage took away from a community's report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Losses {
    pub omitted: usize,
    pub failed_batches: usize,
    pub prefiltered: usize,
}

/// Score desc, engagement desc, discovered_at asc, key asc. Total: no two distinct keys tie.
pub fn report_order(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.relevance_score
        .cmp(&a.relevance_score)
        .then_with(|| {
            b.candidate
                .engagement_metrics
                .weight()
                .cmp(&a.candidate.engagement_metrics.weight())
        })
        .then_with(|| a.candidate.discovered_at.cmp(&b.candidate.discovered_at))
        .then_with(|| a.key().cmp(&b.key()))
}

/// Combine every scored set for `identity` into a report. Entries for other communities are
/// ignored; a key seen twice keeps its best-ordered entry.
pub fn merge(
    scored_sets: impl IntoIterator<Item = Vec<ScoredCandidate>>,
    identity: ReportIdentity,
    losses: Losses,
) -> Report {
    let mut entries: Vec<ScoredCandidate> = scored_sets
        .into_iter()
        .flatten()
        .filter(|s| s.candidate.community == identity.community)
        .collect();
    entries.sort_by(report_order);
    let mut seen = BTreeSet::new();
    entries.retain(|s| seen.insert(s.key()));

    let tier_count = |tier: SignalTier| entries.iter().filter(|s| s.signal_tier == tier).count();
    let summary = ReportSummary {
        scored: entries.len(),
        omitted: losses.omitted,
        failed_batches: losses.failed_batches,
        prefiltered: losses.prefiltered,
        high: tier_count(SignalTier::High),
        medium: tier_count(SignalTier::Medium),
        low: tier_count(SignalTier::Low),
    };
    let briefing = synthesize_briefing(&identity, &summary, &entries);

    Report {
        identity,
        briefing,
        summary,
        entries,
    }
}

fn synthesize_briefing(
    identity: &ReportIdentity,
    summary: &ReportSummary,
    entries: &[ScoredCandidate],
) -> String {
    let mut briefing = if entries.is_empty() {
        format!("No leads were scored for {} on {}.", identity.community, identity.date)
    } else {
        format!(
            "{} leads scored for {} on {}: {} high, {} medium and {} low signal.",
            summary.scored,
            identity.community,
            identity.date,
            summary.high,
            summary.medium,
            summary.low
        )
    };

    if let Some(top) = entries.first().filter(|s| s.signal_tier == SignalTier::High) {
        let _ = write!(
            briefing,
            " Start with \"{}\" ({}/10): {}",
            top.candidate.title,
            top.relevance_score,
            top.rationale.trim()
        );
        if !briefing.ends_with('.') {
            briefing.push('.');
        }
    }

    if summary.omitted > 0 {
        let _ = write!(
            briefing,
            " {} candidates were omitted after {} failed scoring batch{}.",
            summary.omitted,
            summary.failed_batches,
            if summary.failed_batches == 1 { "" } else { "es" }
        );
    }
    if summary.prefiltered > 0 {
        let _ = write!(
            briefing,
            " {} low-signal candidates were filtered out before scoring.",
            summary.prefiltered
        );
    }
    briefing
}

fn depth_label(depth: ContentDepth) -> &'static str {
    match depth {
        ContentDepth::MetadataOnly => "metadata only",
        ContentDepth::FullThread => "full thread",
        ContentDepth::EnrichmentFailed => "metadata only (thread fetch failed)",
    }
}

pub fn render_markdown(report: &Report) -> String {
    let id = &report.identity;
    let s = &report.summary;
    let mut lines = vec![
        format!("# {} lead report: {}", id.source.display_name(), id.community),
        String::new(),
        format!("- Date: {}", id.date),
        format!("- Scored: {}", s.scored),
        format!("- Signal: {} high / {} medium / {} low", s.high, s.medium, s.low),
        format!("- Omitted: {} ({} failed batches)", s.omitted, s.failed_batches),
        format!("- Filtered before scoring: {}", s.prefiltered),
        String::new(),
        "## Briefing".to_string(),
        String::new(),
        report.briefing.clone(),
        String::new(),
        "## Leads".to_string(),
        String::new(),
    ];

    if report.entries.is_empty() {
        lines.push("_No leads today._".to_string());
        lines.push(String::new());
    }

    for (rank, entry) in report.entries.iter().enumerate() {
        let c = &entry.candidate;
        let m = &c.engagement_metrics;
        lines.push(format!("### {}. [{}]({})", rank + 1, c.title, c.url));
        lines.push(String::new());
        lines.push(format!(
            "- Score: {}/10 ({})",
            entry.relevance_score,
            entry.signal_tier.label()
        ));
        lines.push(format!(
            "- Engagement: {} points, {} replies, {} reposts",
            m.points, m.replies, m.reposts
        ));
        lines.push(format!("- Discovered: {}", c.discovered_at.to_rfc3339()));
        if !c.matched_keywords.is_empty() {
            lines.push(format!("- Keywords: {}", c.matched_keywords.join(", ")));
        }
        lines.push(format!("- Content: {}", depth_label(c.content_depth)));
        if !entry.rationale.trim().is_empty() {
            lines.push(String::new());
            lines.push(format!("> {}", entry.rationale.trim()));
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

pub fn render_json(report: &Report) -> Result<Vec<u8>> {
    let mut body = serde_json::to_vec_pretty(report).context("serializing report")?;
    body.push(b'\n');
    Ok(body)
}

pub fn reports_dir(date: NaiveDate) -> PathBuf {
    PathBuf::from("reports").join(date.format("%Y-%m-%d").to_string())
}

pub fn report_paths(identity: &ReportIdentity) -> (PathBuf, PathBuf) {
    let dir = reports_dir(identity.date);
    let slug = identity.slug();
    (
        dir.join(format!("{slug}_report.md")),
        dir.join(format!("{slug}_report.json")),
    )
}

#[derive(Debug, Clone)]
pub struct PublishedReport {
    pub identity: ReportIdentity,
    pub summary: ReportSummary,
    pub markdown: PublishedArtifact,
    pub json: PublishedArtifact,
}

/// Write both bodies atomically, replacing any earlier run of the same date.
pub async fn publish(store: &ArtifactStore, report: &Report) -> Result<PublishedReport> {
    let (md_path, json_path) = report_paths(&report.identity);
    let json_body = render_json(report)?;
    let markdown = store
        .publish(&md_path, render_markdown(report).as_bytes())
        .await
        .with_context(|| format!("publishing {}", md_path.display()))?;
    let json = store
        .publish(&json_path, &json_body)
        .await
        .with_context(|| format!("publishing {}", json_path.display()))?;
    Ok(PublishedReport {
        identity: report.identity.clone(),
        summary: report.summary.clone(),
        markdown,
        json,
    })
}
