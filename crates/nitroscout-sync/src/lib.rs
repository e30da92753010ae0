//! Pipeline orchestration: aggregate, pre-filter, score, publish.

mod aggregate;
mod config;
mod prefilter;
mod report;
mod summary;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use nitroscout_adapters::{adapter_for_source, AdapterContext, AdapterSettings, SourceAdapter};
use nitroscout_core::{Candidate, ContentDepth, ReportIdentity, ScoredCandidate, Source};
use nitroscout_scoring::{BatchScorer, CredentialPool, GeminiOracle, ScoringOracle, ScoringOutcome};
use nitroscout_storage::{ArtifactStore, HttpClientConfig, HttpFetcher};
use tokio::time::Instant;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub use aggregate::{aggregate, CandidateSet, LeadAggregator, SourceResult, SourceStatus};
pub use config::{
    load_api_keys, HttpSettings, PrefilterSettings, ScoringSettings, ScoutRegistry,
    SourceSettings, SyncConfig,
};
pub use prefilter::{enrich, pre_score, shortlist, Shortlist};
pub use report::{
    merge, render_json, render_markdown, report_order, report_paths, reports_dir, Losses,
    PublishedReport,
};
pub use summary::{ReportRecord, RunStage, RunStatus, RunSummary};

pub const CRATE_NAME: &str = "nitroscout-sync";

/// Deadline and interrupt flag, checked between stages. A stage already running finishes.
#[derive(Debug, Clone)]
pub struct RunBudget {
    deadline: Option<Instant>,
    interrupted: Arc<AtomicBool>,
}

impl RunBudget {
    pub fn new(limit: Option<Duration>, interrupted: Arc<AtomicBool>) -> Self {
        Self {
            deadline: limit.map(|limit| Instant::now() + limit),
            interrupted,
        }
    }

    /// Why the run must stop, if it must.
    pub fn exhausted(&self) -> Option<String> {
        if self.interrupted.load(Ordering::SeqCst) {
            return Some("interrupted".to_string());
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some("run budget exceeded".to_string()),
            _ => None,
        }
    }
}

/// Candidates ready for scoring plus what the filter stages removed or degraded.
#[derive(Debug, Default)]
struct Prepared {
    candidates: Vec<Candidate>,
    prefiltered: BTreeMap<String, usize>,
    enrichment_failures: usize,
}

impl Prepared {
    fn prefiltered_total(&self) -> usize {
        self.prefiltered.values().sum()
    }
}

fn community_counts(candidates: &[Candidate]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for candidate in candidates {
        *counts.entry(candidate.community.clone()).or_default() += 1;
    }
    counts
}

/// Fetcher settings: deployment-wide limits from the environment, per-source pacing from
/// `scout.yaml`.
pub fn http_client_config(config: &SyncConfig, registry: &ScoutRegistry) -> HttpClientConfig {
    registry.enabled_sources().fold(
        HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            global_concurrency: config.http_concurrency,
            ..Default::default()
        },
        |http, settings| http.with_source_limits(settings.source.slug(), settings.http.limits()),
    )
}

pub struct ScoutPipeline {
    config: SyncConfig,
    registry: ScoutRegistry,
    store: ArtifactStore,
    http: HttpFetcher,
    adapters: BTreeMap<Source, Box<dyn SourceAdapter>>,
    oracle: Arc<dyn ScoringOracle>,
    interrupted: Arc<AtomicBool>,
}

impl ScoutPipeline {
    /// Load `scout.yaml` and the product knowledge file named by the config.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let registry = ScoutRegistry::load(&config.registry_path).await?;
        let knowledge = registry.load_knowledge(&config.workspace_root).await?;
        Self::new(config, registry, &knowledge)
    }

    pub fn new(config: SyncConfig, registry: ScoutRegistry, knowledge: &str) -> Result<Self> {
        let store = ArtifactStore::new(config.output_dir.clone());
        let http = HttpFetcher::new(http_client_config(&config, &registry))?;

        let settings = AdapterSettings {
            bluesky: config.bluesky.clone(),
        };
        let adapters = registry
            .enabled_sources()
            .map(|s| (s.source, adapter_for_source(s.source, &settings)))
            .collect();

        let mut oracle = GeminiOracle::new(&config.oracle_model)
            .with_knowledge(knowledge, registry.knowledge_max_bytes);
        if let Some(url) = &config.oracle_base_url {
            oracle = oracle.with_base_url(url);
        }

        Ok(Self {
            config,
            registry,
            store,
            http,
            adapters,
            oracle: Arc::new(oracle),
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Replace the adapter registered for the adapter's source.
    pub fn with_adapter(mut self, adapter: Box<dyn SourceAdapter>) -> Self {
        self.adapters.insert(adapter.source(), adapter);
        self
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn ScoringOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    /// Setting this flag stops the current run at the next stage boundary.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    fn budget(&self) -> RunBudget {
        RunBudget::new(self.config.run_budget, self.interrupted.clone())
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        self.run_at(Utc::now()).await
    }

    /// Full run for the day of `fetched_at`, overwriting that date's artifacts.
    pub async fn run_at(&self, fetched_at: DateTime<Utc>) -> Result<RunSummary> {
        let started_at = Utc::now();
        let budget = self.budget();
        let ctx = AdapterContext::new(fetched_at);

        if let Some(reason) = budget.exhausted() {
            let empty = CandidateSet {
                run_id: ctx.run_id,
                run_date: fetched_at.date_naive(),
                fetched_at,
                sources: Vec::new(),
                candidates: Vec::new(),
            };
            return self
                .stop(&empty, started_at, RunStage::Aggregate, reason, &Prepared::default(), None)
                .await;
        }

        let set = self.collect(&ctx).await;
        set.persist(&self.store).await?;
        self.score_and_publish(set, started_at, &budget).await
    }

    /// Query every source and persist the candidate set without scoring it.
    pub async fn aggregate_at(&self, fetched_at: DateTime<Utc>) -> Result<CandidateSet> {
        let set = self.collect(&AdapterContext::new(fetched_at)).await;
        let published = set.persist(&self.store).await?;
        info!(
            run_date = %set.run_date,
            candidates = set.candidates.len(),
            path = %published.relative_path.display(),
            "candidate set persisted"
        );
        Ok(set)
    }

    /// Score a previously aggregated date without re-querying the platforms.
    pub async fn score_date(&self, run_date: NaiveDate) -> Result<RunSummary> {
        let started_at = Utc::now();
        let set = CandidateSet::load(&self.store, run_date).await?;
        self.score_and_publish(set, started_at, &self.budget()).await
    }

    /// File names published for `run_date`.
    pub async fn list_reports(&self, run_date: NaiveDate) -> Result<Vec<String>> {
        self.store
            .list(reports_dir(run_date))
            .await
            .with_context(|| format!("no reports for {run_date}"))
    }

    async fn collect(&self, ctx: &AdapterContext) -> CandidateSet {
        let mut aggregator = LeadAggregator::new(&self.http);
        for settings in self.registry.enabled_sources() {
            match self.adapters.get(&settings.source) {
                Some(adapter) => aggregator = aggregator.source(adapter.as_ref(), &settings.query),
                None => warn!(source = %settings.source, "no adapter registered; skipping"),
            }
        }
        let set = aggregator.run(ctx).await;
        info!(
            run_id = %set.run_id,
            candidates = set.candidates.len(),
            failed_sources = set.failed_sources().len(),
            "aggregation finished"
        );
        set
    }

    async fn score_and_publish(
        &self,
        set: CandidateSet,
        started_at: DateTime<Utc>,
        budget: &RunBudget,
    ) -> Result<RunSummary> {
        if let Some(reason) = budget.exhausted() {
            return self
                .stop(&set, started_at, RunStage::Prefilter, reason, &Prepared::default(), None)
                .await;
        }
        let prepared = self.prepare(&set).await;

        if let Some(reason) = budget.exhausted() {
            return self
                .stop(&set, started_at, RunStage::Score, reason, &prepared, None)
                .await;
        }
        let outcome = self.score(&prepared.candidates).await;

        if let Some(reason) = budget.exhausted() {
            return self
                .stop(&set, started_at, RunStage::Publish, reason, &prepared, Some(&outcome))
                .await;
        }
        let published = self.publish_reports(&set, &prepared, &outcome).await?;

        let mut summary = self.summarize(
            &set,
            started_at,
            RunStatus::Completed,
            &prepared,
            Some(&outcome),
            published.iter().map(ReportRecord::from).collect(),
        );
        summary.carried_over = self.carried_over(summary.run_date, &summary.reports).await?;
        summary.publish(&self.store).await?;
        info!(
            run_date = %summary.run_date,
            reports = summary.reports.len(),
            scored = summary.scored,
            omitted = summary.omitted(),
            "run completed"
        );
        Ok(summary)
    }

    async fn prepare(&self, set: &CandidateSet) -> Prepared {
        let mut prepared = Prepared::default();
        for status in set.sources.iter().filter(|s| s.succeeded) {
            let (Some(settings), Some(adapter)) = (
                self.registry.settings_for(status.source),
                self.adapters.get(&status.source),
            ) else {
                continue;
            };

            let mut candidates: Vec<Candidate> = set.for_source(status.source).cloned().collect();
            if settings.prefilter.is_enabled(adapter.volume()) {
                let before = community_counts(&candidates);
                let list = shortlist(candidates, &settings.query, &settings.prefilter, set.fetched_at);
                let after = community_counts(&list.kept);
                for (community, count) in before {
                    let kept = after.get(&community).copied().unwrap_or(0);
                    *prepared.prefiltered.entry(community).or_default() += count - kept;
                }
                info!(source = %status.source, kept = list.kept.len(), dropped = list.dropped, "shortlist built");
                candidates = list.kept;
            }

            if settings.prefilter.enrich && !candidates.is_empty() {
                candidates = enrich(
                    adapter.as_ref(),
                    &self.http,
                    &settings.query,
                    candidates,
                    self.registry.enrichment_concurrency,
                )
                .await;
            }

            prepared.enrichment_failures += candidates
                .iter()
                .filter(|c| c.content_depth == ContentDepth::EnrichmentFailed)
                .count();
            prepared.candidates.extend(candidates);
        }
        prepared
    }

    async fn score(&self, candidates: &[Candidate]) -> ScoringOutcome {
        let pool = Arc::new(CredentialPool::new(self.config.api_keys.iter().cloned()));
        if pool.is_empty() && !candidates.is_empty() {
            warn!("no oracle credentials configured; every batch will fail");
        }
        BatchScorer::new(self.oracle.clone(), pool, self.registry.scoring.scorer_config())
            .score(candidates)
            .await
    }

    async fn publish_reports(
        &self,
        set: &CandidateSet,
        prepared: &Prepared,
        outcome: &ScoringOutcome,
    ) -> Result<Vec<PublishedReport>> {
        let mut published = Vec::new();
        for settings in self.registry.enabled_sources() {
            if !set.succeeded(settings.source) {
                warn!(source = %settings.source, "source failed this run; no report published");
                continue;
            }

            let mut communities: BTreeSet<String> = settings.expected_communities().into_iter().collect();
            communities.extend(set.for_source(settings.source).map(|c| c.community.clone()));
            let scored: Vec<ScoredCandidate> = outcome
                .scored
                .iter()
                .filter(|s| s.candidate.source == settings.source)
                .cloned()
                .collect();

            for community in communities {
                let losses = Losses {
                    omitted: outcome.omitted_in(&community),
                    failed_batches: outcome.failed_batches_in(&community),
                    prefiltered: prepared.prefiltered.get(&community).copied().unwrap_or(0),
                };
                let identity = ReportIdentity {
                    source: settings.source,
                    community,
                    date: set.run_date,
                };
                let report = merge([scored.clone()], identity, losses);
                let artifact = report::publish(&self.store, &report).await?;
                info!(
                    community = %artifact.identity.community,
                    scored = artifact.summary.scored,
                    omitted = artifact.summary.omitted,
                    path = %artifact.markdown.relative_path.display(),
                    "report published"
                );
                published.push(artifact);
            }
        }
        Ok(published)
    }

    fn summarize(
        &self,
        set: &CandidateSet,
        started_at: DateTime<Utc>,
        status: RunStatus,
        prepared: &Prepared,
        outcome: Option<&ScoringOutcome>,
        reports: Vec<ReportRecord>,
    ) -> RunSummary {
        RunSummary {
            run_id: set.run_id,
            run_date: set.run_date,
            started_at,
            finished_at: Utc::now(),
            status,
            sources: set.sources.clone(),
            candidates: set.candidates.len(),
            prefiltered: prepared.prefiltered_total(),
            enrichment_failures: prepared.enrichment_failures,
            scored: outcome.map(|o| o.scored.len()).unwrap_or(0),
            failed_batches: outcome.map(|o| o.failed_batches.clone()).unwrap_or_default(),
            reports,
            carried_over: Vec::new(),
        }
    }

    /// Report files for `run_date` that this run did not rewrite.
    async fn carried_over(&self, run_date: NaiveDate, reports: &[ReportRecord]) -> Result<Vec<PathBuf>> {
        let dir = reports_dir(run_date);
        let absolute = self.store.root().join(&dir);
        if !tokio::fs::try_exists(&absolute)
            .await
            .with_context(|| format!("checking {}", absolute.display()))?
        {
            return Ok(Vec::new());
        }
        let refreshed: BTreeSet<&Path> = reports
            .iter()
            .flat_map(|r| [r.markdown_path.as_path(), r.json_path.as_path()])
            .collect();
        let names = self.store.list(&dir).await?;
        let stale: Vec<PathBuf> = names
            .into_iter()
            .filter(|name| name.ends_with("_report.md") || name.ends_with("_report.json"))
            .map(|name| dir.join(name))
            .filter(|path| !refreshed.contains(path.as_path()))
            .collect();
        if !stale.is_empty() {
            warn!(run_date = %run_date, files = stale.len(), "earlier reports left in place");
        }
        Ok(stale)
    }

    /// Record a cancelled run. Nothing but the run summary is published.
    async fn stop(
        &self,
        set: &CandidateSet,
        started_at: DateTime<Utc>,
        stage: RunStage,
        reason: String,
        prepared: &Prepared,
        outcome: Option<&ScoringOutcome>,
    ) -> Result<RunSummary> {
        warn!(stage = %stage, reason = %reason, "run cancelled; no reports published");
        let mut summary = self.summarize(
            set,
            started_at,
            RunStatus::Cancelled { stage, reason },
            prepared,
            outcome,
            Vec::new(),
        );
        summary.carried_over = self.carried_over(summary.run_date, &[]).await?;
        summary.publish(&self.store).await?;
        Ok(summary)
    }
}

/// The scheduler expects a seconds field; plain five-field crons fire at second 0.
pub fn scheduler_expression(cron: &str) -> String {
    if cron.split_whitespace().count() == 5 {
        format!("0 {}", cron.trim())
    } else {
        cron.trim().to_string()
    }
}

/// Heartbeat: one full run per cron tick, when the scheduler is enabled.
pub async fn maybe_build_scheduler(pipeline: Arc<ScoutPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let cron = scheduler_expression(&pipeline.config.cron);
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(&cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_date = %summary.run_date,
                    completed = summary.is_completed(),
                    reports = summary.reports.len(),
                    "scheduled run finished"
                ),
                Err(err) => error!(error = ?err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    ScoutPipeline::from_config(SyncConfig::from_env())
        .await?
        .run_once()
        .await
}


#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::test_support::{candidate, now, FakeSource, FixedOracle};
    use super::*;

    const REGISTRY: &str = r#"
scoring:
  backoff_base_ms: 1
  backoff_max_ms: 1
sources:
  - source: hackernews
    query:
      keywords: [mcp]
  - source: reddit
    query:
      keywords: [mcp]
      communities: [mcp, LocalLLaMA]
    prefilter:
      shortlist_size: 10
      min_pre_score: 0.0
  - source: bluesky
    query:
      keywords: [mcp]
"#;

    fn config(dir: &Path, extra: &[(&str, &str)]) -> SyncConfig {
        let mut vars: BTreeMap<String, String> = extra
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        vars.insert("NITROSCOUT_OUTPUT_DIR".into(), dir.display().to_string());
        vars.entry("NITROSCOUT_API_KEYS".into()).or_insert_with(|| "k1".into());
        SyncConfig::from_lookup(move |key| vars.get(key).cloned())
    }

    fn hn_story(id: &str, points: i64) -> Candidate {
        let mut c = candidate(Source::HackerNews, id, "hackernews");
        c.engagement_metrics.points = points;
        c.engagement_metrics.replies = 0;
        c
    }

    fn pipeline(config: SyncConfig, oracle: FixedOracle) -> ScoutPipeline {
        let registry = ScoutRegistry::from_yaml_str(REGISTRY).expect("registry");
        ScoutPipeline::new(config, registry, "NitroStack builds MCP servers")
            .expect("pipeline")
            .with_adapter(Box::new(FakeSource::new(Source::HackerNews).with_candidates(vec![
                hn_story("a", 50),
                hn_story("b", 10),
                hn_story("c", 80),
            ])))
            .with_adapter(Box::new(
                FakeSource::new(Source::Reddit)
                    .with_candidates(vec![
                        candidate(Source::Reddit, "r1", "r/mcp"),
                        candidate(Source::Reddit, "r2", "r/mcp"),
                    ])
                    .broken_thread("r2"),
            ))
            .with_adapter(Box::new(FakeSource::new(Source::Bluesky).unavailable()))
            .with_oracle(Arc::new(oracle))
    }

    fn scores() -> FixedOracle {
        FixedOracle::default()
            .score("hackernews:a", 7)
            .score("hackernews:b", 9)
            .score("hackernews:c", 7)
    }

    async fn read_report(store: &ArtifactStore, name: &str) -> nitroscout_core::Report {
        let bytes = store
            .read(reports_dir(now().date_naive()).join(name))
            .await
            .expect("report");
        serde_json::from_slice(&bytes).expect("report json")
    }

    #[tokio::test]
    async fn full_run_publishes_ordered_reports_and_isolates_failed_sources() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let pipeline = pipeline(config(tmp.path(), &[]), scores());

        let summary = pipeline.run_at(now()).await.expect("run");

        assert!(summary.is_completed());
        assert_eq!(summary.candidates, 5);
        assert_eq!(summary.scored, 5);
        assert_eq!(summary.enrichment_failures, 1);
        let bluesky = summary
            .sources
            .iter()
            .find(|s| s.source == Source::Bluesky)
            .expect("bluesky status");
        assert!(!bluesky.succeeded);

        let names = pipeline.list_reports(now().date_naive()).await.expect("list");
        assert_eq!(
            names,
            vec![
                "hackernews_report.json",
                "hackernews_report.md",
                "r-localllama_report.json",
                "r-localllama_report.md",
                "r-mcp_report.json",
                "r-mcp_report.md",
                "run_summary.json",
                "run_summary.md",
            ]
        );

        let hn = read_report(pipeline.store(), "hackernews_report.json").await;
        let order: Vec<&str> = hn.entries.iter().map(|e| e.candidate.external_id.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
        assert!(hn.entries.iter().all(|e| e.candidate.content_depth == ContentDepth::FullThread));

        let reddit = read_report(pipeline.store(), "r-mcp_report.json").await;
        assert_eq!(reddit.summary.scored, 2);
        let degraded = reddit
            .entries
            .iter()
            .find(|e| e.candidate.external_id == "r2")
            .expect("r2 still scored");
        assert_eq!(degraded.candidate.content_depth, ContentDepth::EnrichmentFailed);

        let empty = read_report(pipeline.store(), "r-localllama_report.json").await;
        assert!(empty.entries.is_empty());
    }

    #[tokio::test]
    async fn rerunning_a_date_is_byte_identical() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let pipeline = pipeline(config(tmp.path(), &[]), scores());

        let first = pipeline.run_at(now()).await.expect("first run");
        let second = pipeline.run_at(now()).await.expect("second run");

        assert_eq!(first.reports.len(), second.reports.len());
        for (a, b) in first.reports.iter().zip(&second.reports) {
            assert_eq!(a.markdown_path, b.markdown_path);
            assert_eq!(a.markdown_sha256, b.markdown_sha256);
            assert_eq!(a.json_sha256, b.json_sha256);
        }
    }

    #[tokio::test]
    async fn failed_batch_is_counted_in_its_report_only() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let pipeline = pipeline(config(tmp.path(), &[]), scores().broken_community("r/mcp"));

        let summary = pipeline.run_at(now()).await.expect("run");

        assert_eq!(summary.omitted(), 2);
        assert_eq!(summary.failed_batches.len(), 1);
        let reddit = read_report(pipeline.store(), "r-mcp_report.json").await;
        assert!(reddit.entries.is_empty());
        assert_eq!(reddit.summary.omitted, 2);
        assert_eq!(reddit.summary.failed_batches, 1);
        let hn = read_report(pipeline.store(), "hackernews_report.json").await;
        assert_eq!(hn.summary.scored, 3);
        assert_eq!(hn.summary.omitted, 0);
    }

    #[tokio::test]
    async fn scoring_a_persisted_date_matches_a_full_run() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let pipeline = pipeline(config(tmp.path(), &[]), scores());

        let full = pipeline.run_at(now()).await.expect("full run");
        let set = pipeline.aggregate_at(now()).await.expect("aggregate");
        assert_eq!(set.candidates.len(), 5);
        let resumed = pipeline.score_date(now().date_naive()).await.expect("score");

        let hashes = |s: &RunSummary| {
            s.reports
                .iter()
                .map(|r| r.json_sha256.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(hashes(&full), hashes(&resumed));
    }

    #[tokio::test]
    async fn scoring_an_unaggregated_date_fails() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let pipeline = pipeline(config(tmp.path(), &[]), scores());
        let err = pipeline
            .score_date(NaiveDate::from_ymd_opt(2025, 1, 1).expect("date"))
            .await
            .expect_err("nothing aggregated");
        assert!(format!("{err:#}").contains("run `aggregate` first"));
    }

    #[tokio::test]
    async fn interrupt_after_aggregation_publishes_no_reports() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let oracle = Arc::new(scores());
        let registry = ScoutRegistry::from_yaml_str(REGISTRY).expect("registry");
        let base = ScoutPipeline::new(config(tmp.path(), &[]), registry, "").expect("pipeline");
        let flag = base.interrupt_flag();
        let pipeline = base
            .with_adapter(Box::new(
                FakeSource::new(Source::HackerNews)
                    .with_candidates(vec![hn_story("a", 1)])
                    .tripping(flag),
            ))
            .with_adapter(Box::new(FakeSource::new(Source::Reddit)))
            .with_adapter(Box::new(FakeSource::new(Source::Bluesky)))
            .with_oracle(oracle.clone());

        let summary = pipeline.run_at(now()).await.expect("run");

        assert_eq!(
            summary.status,
            RunStatus::Cancelled {
                stage: RunStage::Prefilter,
                reason: "interrupted".into()
            }
        );
        assert_eq!(oracle.calls(), 0);
        assert!(summary.reports.is_empty());
        let names = pipeline.list_reports(now().date_naive()).await.expect("list");
        assert_eq!(names, vec!["run_summary.json", "run_summary.md"]);
        assert!(CandidateSet::load(pipeline.store(), now().date_naive()).await.is_ok());
    }

    #[tokio::test]
    async fn reports_left_from_an_earlier_run_are_listed_in_the_summary() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let first = pipeline(config(tmp.path(), &[]), scores());
        let summary = first.run_at(now()).await.expect("first run");
        assert!(summary.carried_over.is_empty());

        let registry = ScoutRegistry::from_yaml_str(REGISTRY).expect("registry");
        let rerun = ScoutPipeline::new(config(tmp.path(), &[]), registry, "")
            .expect("pipeline")
            .with_adapter(Box::new(FakeSource::new(Source::HackerNews).unavailable()))
            .with_adapter(Box::new(
                FakeSource::new(Source::Reddit).with_candidates(vec![candidate(Source::Reddit, "r1", "r/mcp")]),
            ))
            .with_adapter(Box::new(FakeSource::new(Source::Bluesky).unavailable()))
            .with_oracle(Arc::new(scores()));
        let summary = rerun.run_at(now()).await.expect("rerun");
        let dir = reports_dir(now().date_naive());
        assert_eq!(
            summary.carried_over,
            vec![dir.join("hackernews_report.json"), dir.join("hackernews_report.md")]
        );
        assert!(summary
            .render_markdown()
            .contains("hackernews_report.md` (not refreshed by this run)"));

        rerun.interrupt_flag().store(true, Ordering::SeqCst);
        let cancelled = rerun.run_at(now()).await.expect("cancelled run");
        assert!(!cancelled.is_completed());
        assert_eq!(cancelled.carried_over.len(), 6);
        let reloaded = RunSummary::load(rerun.store(), now().date_naive()).await.expect("load");
        assert_eq!(reloaded.carried_over, cancelled.carried_over);
    }

    #[test]
    fn http_limits_come_from_env_and_registry() {
        let registry = ScoutRegistry::from_yaml_str(
            r#"
sources:
  - source: reddit
    http:
      max_concurrent: 1
      min_interval_ms: 2000
  - source: hackernews
"#,
        )
        .expect("registry");
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = config(tmp.path(), &[("NITROSCOUT_HTTP_CONCURRENCY", "6")]);

        let http = http_client_config(&config, &registry);
        assert_eq!(http.global_concurrency, 6);
        assert_eq!(http.user_agent.as_deref(), Some(config.user_agent.as_str()));
        let reddit = http.sources.get("reddit").expect("reddit limits");
        assert_eq!(reddit.concurrency, Some(1));
        assert_eq!(
            reddit.rate.map(|r| (r.burst, r.interval)),
            Some((1, Duration::from_secs(2)))
        );
        assert_eq!(http.sources.get("hackernews").copied(), Some(Default::default()));
    }

    #[tokio::test]
    async fn exhausted_budget_stops_before_aggregation() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut config = config(tmp.path(), &[]);
        config.run_budget = Some(Duration::ZERO);
        let pipeline = pipeline(config, scores());

        let summary = pipeline.run_at(now()).await.expect("run");

        assert!(matches!(
            summary.status,
            RunStatus::Cancelled {
                stage: RunStage::Aggregate,
                ..
            }
        ));
        assert_eq!(summary.candidates, 0);
        assert!(CandidateSet::load(pipeline.store(), now().date_naive()).await.is_err());
    }

    #[tokio::test]
    async fn missing_credentials_fail_batches_but_still_publish() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let pipeline = pipeline(config(tmp.path(), &[("NITROSCOUT_API_KEYS", " ")]), scores());

        let summary = pipeline.run_at(now()).await.expect("run");

        assert!(summary.is_completed());
        assert_eq!(summary.scored, 0);
        assert_eq!(summary.omitted(), 5);
        assert!(summary.failed_batches.iter().all(|b| b.reason.contains("no oracle credentials")));
        assert_eq!(summary.reports.len(), 3);
    }

    #[test]
    fn five_field_crons_gain_a_seconds_field() {
        assert_eq!(scheduler_expression("0 7 * * *"), "0 0 7 * * *");
        assert_eq!(scheduler_expression("30 0 7 * * *"), "30 0 7 * * *");
    }

    #[tokio::test]
    async fn disabled_scheduler_is_not_built() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let pipeline = Arc::new(pipeline(config(tmp.path(), &[]), scores()));
        let sched = maybe_build_scheduler(pipeline).await.expect("scheduler");
        assert!(sched.is_none());
    }
}
