//! Run summary: everything a run did, failed at or published, as JSON and Markdown.

use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use nitroscout_core::{ReportSummary, Source};
use nitroscout_scoring::FailedBatch;
use nitroscout_storage::{ArtifactStore, PublishedArtifact};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::SourceStatus;
use crate::report::{reports_dir, PublishedReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Aggregate,
    Prefilter,
    Score,
    Publish,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStage::Aggregate => "aggregate",
            RunStage::Prefilter => "prefilter",
            RunStage::Score => "score",
            RunStage::Publish => "publish",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Stopped by the run budget or Ctrl-C before `stage` ran; nothing was published.
    Cancelled { stage: RunStage, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub source: Source,
    pub community: String,
    pub markdown_path: PathBuf,
    pub markdown_sha256: String,
    pub json_path: PathBuf,
    pub json_sha256: String,
    pub summary: ReportSummary,
}

impl From<&PublishedReport> for ReportRecord {
    fn from(published: &PublishedReport) -> Self {
        Self {
            source: published.identity.source,
            community: published.identity.community.clone(),
            markdown_path: published.markdown.relative_path.clone(),
            markdown_sha256: published.markdown.sha256.clone(),
            json_path: published.json.relative_path.clone(),
            json_sha256: published.json.sha256.clone(),
            summary: published.summary.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub status: RunStatus,
    pub sources: Vec<SourceStatus>,
    pub candidates: usize,
    pub prefiltered: usize,
    pub enrichment_failures: usize,
    pub scored: usize,
    pub failed_batches: Vec<FailedBatch>,
    pub reports: Vec<ReportRecord>,
    /// Report files for this date written by an earlier run and not rewritten by this one.
    #[serde(default)]
    pub carried_over: Vec<PathBuf>,
}

impl RunSummary {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn omitted(&self) -> usize {
        self.failed_batches.iter().map(|b| b.candidates.len()).sum()
    }

    pub fn render_markdown(&self) -> String {
        let mut lines = vec![
            format!("# NitroScout run {}", self.run_date),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Started: {}", self.started_at.to_rfc3339()),
            format!("- Finished: {}", self.finished_at.to_rfc3339()),
        ];
        match &self.status {
            RunStatus::Completed => lines.push("- Status: completed".to_string()),
            RunStatus::Cancelled { stage, reason } => {
                lines.push(format!("- Status: cancelled before `{stage}` ({reason})"));
                lines.push("- No reports were published by this run.".to_string());
            }
        }
        lines.push(format!("- Candidates: {}", self.candidates));
        lines.push(format!("- Filtered before scoring: {}", self.prefiltered));
        lines.push(format!("- Thread fetch failures: {}", self.enrichment_failures));
        lines.push(format!("- Scored: {}", self.scored));
        lines.push(format!("- Omitted: {}", self.omitted()));

        lines.push(String::new());
        lines.push("## Sources".to_string());
        lines.push(String::new());
        for source in &self.sources {
            match &source.error {
                Some(error) => lines.push(format!("- {}: FAILED ({error})", source.source)),
                None => lines.push(format!(
                    "- {}: {} candidates, {} skipped items, {} failed requests",
                    source.source, source.candidates, source.skipped_items, source.failed_requests
                )),
            }
        }

        if !self.failed_batches.is_empty() {
            lines.push(String::new());
            lines.push("## Failed batches".to_string());
            lines.push(String::new());
            for batch in &self.failed_batches {
                lines.push(format!(
                    "- {} batch {}/{}: {} candidates omitted ({})",
                    batch.community,
                    batch.index,
                    batch.total,
                    batch.candidates.len(),
                    batch.reason
                ));
            }
        }

        lines.push(String::new());
        lines.push("## Reports".to_string());
        lines.push(String::new());
        if self.reports.is_empty() {
            lines.push("_none_".to_string());
        }
        for report in &self.reports {
            lines.push(format!(
                "- {}: `{}` (sha256 {}), {} scored, {} omitted",
                report.community,
                report.markdown_path.display(),
                report.markdown_sha256,
                report.summary.scored,
                report.summary.omitted
            ));
        }

        if !self.carried_over.is_empty() {
            lines.push(String::new());
            lines.push("## Earlier reports still on disk".to_string());
            lines.push(String::new());
            for path in &self.carried_over {
                lines.push(format!("- `{}` (not refreshed by this run)", path.display()));
            }
        }
        lines.push(String::new());
        lines.join("\n")
    }

    pub async fn publish(&self, store: &ArtifactStore) -> Result<(PublishedArtifact, PublishedArtifact)> {
        let dir = reports_dir(self.run_date);
        let mut json = serde_json::to_vec_pretty(self).context("serializing run summary")?;
        json.push(b'\n');
        let json = store
            .publish(dir.join("run_summary.json"), &json)
            .await
            .context("publishing run_summary.json")?;
        let markdown = store
            .publish(dir.join("run_summary.md"), self.render_markdown().as_bytes())
            .await
            .context("publishing run_summary.md")?;
        Ok((json, markdown))
    }

    pub async fn load(store: &ArtifactStore, run_date: NaiveDate) -> Result<Self> {
        let bytes = store
            .read(reports_dir(run_date).join("run_summary.json"))
            .await
            .with_context(|| format!("no run summary for {run_date}"))?;
        serde_json::from_slice(&bytes).context("parsing run_summary.json")
    }
}
