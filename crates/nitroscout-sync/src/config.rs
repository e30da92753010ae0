use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use nitroscout_adapters::{BlueskyCredentials, QueryConfig, SourceVolume, MAX_LOOKBACK_HOURS};
use nitroscout_core::Source;
use nitroscout_scoring::{BatchLimits, ScorerConfig, DEFAULT_MODEL};
use nitroscout_storage::{BackoffPolicy, RateLimit, SourceLimits};
use serde::{Deserialize, Serialize};
use tokio::fs;

/// Oracle key variables, in priority order.
const API_KEY_VARS: [&str; 7] = [
    "GEMINI_API_KEY",
    "GOOGLE_API_KEY",
    "GOOGLE_API_KEY1",
    "GOOGLE_API_KEY2",
    "GOOGLE_API_KEY3",
    "GOOGLE_API_KEY4",
    "GOOGLE_API_KEY5",
];

/// Deployment settings read from the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    /// Root for `runs/` and `reports/`.
    pub output_dir: PathBuf,
    pub registry_path: PathBuf,
    pub scheduler_enabled: bool,
    pub cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// In-flight HTTP requests across all sources.
    pub http_concurrency: usize,
    pub run_budget: Option<Duration>,
    pub oracle_model: String,
    pub oracle_base_url: Option<String>,
    pub api_keys: Vec<String>,
    pub bluesky: Option<BlueskyCredentials>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let workspace_root = lookup("NITROSCOUT_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let output_dir = lookup("NITROSCOUT_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| workspace_root.clone());
        let registry_path = lookup("NITROSCOUT_REGISTRY")
            .map(PathBuf::from)
            .unwrap_or_else(|| workspace_root.join("scout.yaml"));
        let bluesky = match (lookup("BLUESKY_HANDLE"), lookup("BLUESKY_APP_PASSWORD")) {
            (Some(handle), Some(app_password)) if !handle.trim().is_empty() => Some(BlueskyCredentials {
                handle: handle.trim().to_string(),
                app_password,
            }),
            _ => None,
        };

        Self {
            scheduler_enabled: lookup("NITROSCOUT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            cron: lookup("NITROSCOUT_CRON").unwrap_or_else(|| "0 7 * * *".to_string()),
            user_agent: lookup("NITROSCOUT_USER_AGENT")
                .unwrap_or_else(|| "nitroscout/0.1 (lead research bot)".to_string()),
            http_timeout_secs: lookup("NITROSCOUT_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            http_concurrency: lookup("NITROSCOUT_HTTP_CONCURRENCY")
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(16),
            run_budget: lookup("NITROSCOUT_RUN_BUDGET_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            oracle_model: lookup("NITROSCOUT_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            oracle_base_url: lookup("NITROSCOUT_ORACLE_BASE_URL"),
            api_keys: load_api_keys(&lookup),
            bluesky,
            workspace_root,
            output_dir,
            registry_path,
        }
    }
}

/// `NITROSCOUT_API_KEYS` (comma separated) first, then the Gemini/Google variables.
/// Blank and repeated values are dropped; order is preserved.
pub fn load_api_keys(lookup: &impl Fn(&str) -> Option<String>) -> Vec<String> {
    let listed = lookup("NITROSCOUT_API_KEYS")
        .map(|v| v.split(',').map(str::to_string).collect::<Vec<_>>())
        .unwrap_or_default();
    let named = API_KEY_VARS.iter().filter_map(|name| lookup(name));

    let mut keys: Vec<String> = Vec::new();
    for key in listed.into_iter().chain(named) {
        let key = key.trim().to_string();
        if !key.is_empty() && !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

/// Per-source pre-filter knobs. `enabled` defaults from the adapter's volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefilterSettings {
    #[serde(default)]
    pub enabled: Option<bool>,
    /// 0 means no cap.
    #[serde(default = "default_shortlist_size")]
    pub shortlist_size: usize,
    #[serde(default = "default_min_pre_score")]
    pub min_pre_score: f64,
    #[serde(default = "default_true")]
    pub enrich: bool,
}

fn default_shortlist_size() -> usize {
    25
}

fn default_min_pre_score() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

impl Default for PrefilterSettings {
    fn default() -> Self {
        Self {
            enabled: None,
            shortlist_size: default_shortlist_size(),
            min_pre_score: default_min_pre_score(),
            enrich: true,
        }
    }
}

impl PrefilterSettings {
    pub fn is_enabled(&self, volume: SourceVolume) -> bool {
        self.enabled.unwrap_or(volume == SourceVolume::High)
    }
}

/// HTTP politeness for one source. Unset values keep the fetcher defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpSettings {
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    /// Spacing between requests once `burst` back-to-back requests are spent.
    #[serde(default)]
    pub min_interval_ms: Option<u64>,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

const MAX_REQUEST_INTERVAL_MS: u64 = 10 * 60 * 1000;

fn default_burst() -> u32 {
    1
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            max_concurrent: None,
            min_interval_ms: None,
            burst: default_burst(),
        }
    }
}

impl HttpSettings {
    pub fn limits(&self) -> SourceLimits {
        SourceLimits {
            concurrency: self.max_concurrent.map(|n| n.max(1)),
            rate: self
                .min_interval_ms
                .filter(|ms| *ms > 0)
                .map(|ms| RateLimit {
                    burst: self.burst.max(1),
                    interval: Duration::from_millis(ms.min(MAX_REQUEST_INTERVAL_MS)),
                }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSettings {
    pub source: Source,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub prefilter: PrefilterSettings,
    #[serde(default)]
    pub http: HttpSettings,
}

impl SourceSettings {
    /// Report communities this source owns even when nothing was found.
    pub fn expected_communities(&self) -> Vec<String> {
        match self.source {
            Source::Reddit if !self.query.communities.is_empty() => self
                .query
                .communities
                .iter()
                .map(|sub| format!("r/{}", sub.trim_start_matches("r/")))
                .collect(),
            source => vec![source.slug().to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringSettings {
    #[serde(flatten)]
    pub limits: BatchLimits,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_community_parallelism")]
    pub community_parallelism: usize,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_max_attempts() -> usize {
    3
}

fn default_call_timeout_secs() -> u64 {
    90
}

fn default_community_parallelism() -> usize {
    2
}

fn default_backoff_base_ms() -> u64 {
    3_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            limits: BatchLimits::default(),
            max_attempts: default_max_attempts(),
            call_timeout_secs: default_call_timeout_secs(),
            community_parallelism: default_community_parallelism(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl ScoringSettings {
    pub fn scorer_config(&self) -> ScorerConfig {
        ScorerConfig {
            limits: self.limits,
            max_attempts: self.max_attempts,
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            community_parallelism: self.community_parallelism,
            backoff: BackoffPolicy {
                max_retries: self.max_attempts,
                base_delay: Duration::from_millis(self.backoff_base_ms),
                max_delay: Duration::from_millis(self.backoff_max_ms),
            },
        }
    }
}

/// `scout.yaml`: what to search for and how to score it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoutRegistry {
    #[serde(default = "default_knowledge_file")]
    pub knowledge_file: PathBuf,
    #[serde(default = "default_knowledge_max_bytes")]
    pub knowledge_max_bytes: usize,
    #[serde(default = "default_enrichment_concurrency")]
    pub enrichment_concurrency: usize,
    #[serde(default)]
    pub scoring: ScoringSettings,
    pub sources: Vec<SourceSettings>,
}

fn default_knowledge_file() -> PathBuf {
    PathBuf::from("brain/nitro_marketing.md")
}

fn default_knowledge_max_bytes() -> usize {
    4_000
}

fn default_enrichment_concurrency() -> usize {
    4
}

impl ScoutRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let mut registry: Self = serde_yaml::from_str(text).context("parsing scout registry")?;
        let mut seen = Vec::new();
        for settings in &mut registry.sources {
            let lookback = settings.query.lookback_hours;
            settings.query.lookback_hours = lookback.clamp(0, MAX_LOOKBACK_HOURS);
            if settings.query.lookback_hours != lookback {
                tracing::warn!(
                    source = %settings.source,
                    configured = lookback,
                    used = settings.query.lookback_hours,
                    "lookback_hours out of range; clamped"
                );
            }
            anyhow::ensure!(
                !seen.contains(&settings.source),
                "source {} is configured more than once",
                settings.source
            );
            seen.push(settings.source);
        }
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceSettings> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn settings_for(&self, source: Source) -> Option<&SourceSettings> {
        self.sources.iter().find(|s| s.source == source)
    }

    /// Product knowledge text; a missing file is not an error.
    pub async fn load_knowledge(&self, workspace_root: &Path) -> Result<String> {
        let path = if self.knowledge_file.is_absolute() {
            self.knowledge_file.clone()
        } else {
            workspace_root.join(&self.knowledge_file)
        };
        match fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "knowledge file not found; scoring without product notes");
                Ok(String::new())
            }
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn api_keys_are_deduplicated_in_priority_order() {
        let env = lookup(&[
            ("NITROSCOUT_API_KEYS", "k0, k1,,"),
            ("GEMINI_API_KEY", "k1"),
            ("GOOGLE_API_KEY", "k2"),
            ("GOOGLE_API_KEY3", "k2"),
            ("GOOGLE_API_KEY5", "k5"),
        ]);
        assert_eq!(load_api_keys(&env), vec!["k0", "k1", "k2", "k5"]);
    }

    #[test]
    fn env_defaults_and_overrides() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("NITROSCOUT_SCHEDULER_ENABLED", "true"),
            ("NITROSCOUT_RUN_BUDGET_SECS", "600"),
            ("BLUESKY_HANDLE", "scout.bsky.social"),
            ("BLUESKY_APP_PASSWORD", "pw"),
        ]));
        assert!(config.scheduler_enabled);
        assert_eq!(config.cron, "0 7 * * *");
        assert_eq!(config.run_budget, Some(Duration::from_secs(600)));
        assert_eq!(config.registry_path, PathBuf::from("./scout.yaml"));
        assert_eq!(config.oracle_model, DEFAULT_MODEL);
        assert!(config.bluesky.is_some());
        assert!(config.api_keys.is_empty());
        assert_eq!(config.http_concurrency, 16);

        let config = SyncConfig::from_lookup(lookup(&[("NITROSCOUT_RUN_BUDGET_SECS", "0")]));
        assert_eq!(config.run_budget, None);
        assert!(config.bluesky.is_none());
    }

    #[test]
    fn registry_parses_with_defaults() {
        let registry = ScoutRegistry::from_yaml_str(
            r#"
scoring:
  max_items_per_batch: 10
sources:
  - source: reddit
    query:
      keywords: [mcp]
      communities: [mcp, "r/LocalLLaMA"]
  - source: hackernews
    enabled: false
"#,
        )
        .expect("registry");
        assert_eq!(registry.scoring.limits.max_items_per_batch, 10);
        assert_eq!(registry.scoring.limits.max_tokens_per_batch, 12_000);
        assert_eq!(registry.enrichment_concurrency, 4);
        assert_eq!(registry.enabled_sources().count(), 1);

        let reddit = registry.settings_for(Source::Reddit).expect("reddit");
        assert!(reddit.prefilter.is_enabled(SourceVolume::High));
        assert_eq!(reddit.query.lookback_hours, 24);
        assert_eq!(reddit.expected_communities(), vec!["r/mcp", "r/LocalLLaMA"]);

        let hn = registry.settings_for(Source::HackerNews).expect("hn");
        assert!(!hn.prefilter.is_enabled(SourceVolume::Targeted));
        assert_eq!(hn.expected_communities(), vec!["hackernews"]);
    }

    #[test]
    fn lookback_is_clamped_and_http_limits_map_to_fetcher_limits() {
        let registry = ScoutRegistry::from_yaml_str(&format!(
            r#"
sources:
  - source: reddit
    query:
      lookback_hours: {}
    http:
      max_concurrent: 2
      min_interval_ms: 1500
      burst: 3
  - source: hackernews
    query:
      lookback_hours: -5
"#,
            i64::MAX
        ))
        .expect("registry");

        let reddit = registry.settings_for(Source::Reddit).expect("reddit");
        assert_eq!(reddit.query.lookback_hours, MAX_LOOKBACK_HOURS);
        assert_eq!(
            reddit.http.limits(),
            SourceLimits {
                concurrency: Some(2),
                rate: Some(RateLimit {
                    burst: 3,
                    interval: Duration::from_millis(1500),
                }),
            }
        );

        let hn = registry.settings_for(Source::HackerNews).expect("hn");
        assert_eq!(hn.query.lookback_hours, 0);
        assert_eq!(hn.http.limits(), SourceLimits::default());
    }

    #[test]
    fn duplicate_sources_are_rejected() {
        let err = ScoutRegistry::from_yaml_str("sources:\n  - source: reddit\n  - source: reddit\n")
            .expect_err("duplicate");
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn workspace_registry_file_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../scout.yaml");
        let text = std::fs::read_to_string(path).expect("scout.yaml");
        let registry = ScoutRegistry::from_yaml_str(&text).expect("valid registry");
        assert_eq!(registry.sources.len(), Source::ALL.len());
    }
}
