//! Atomic artifact publishing + HTTP fetch utilities for NitroScout.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "nitroscout-storage";

#[derive(Debug, Clone)]
pub struct PublishedArtifact {
    pub sha256: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// True when an earlier artifact at the same path was overwritten.
    pub replaced: bool,
}

/// Filesystem root for run artifacts. All writes go through a temp file and a rename,
/// so readers only ever observe complete files.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Publish bytes at `relative_path`, replacing any previous artifact atomically.
    pub async fn publish(
        &self,
        relative_path: impl AsRef<Path>,
        bytes: &[u8],
    ) -> anyhow::Result<PublishedArtifact> {
        let relative_path = relative_path.as_ref().to_path_buf();
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        let replaced = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        if let Err(err) = write_temp(&temp_path, bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp artifact {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(PublishedArtifact {
            sha256: Self::sha256_hex(bytes),
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            replaced,
        })
    }

    pub async fn read(&self, relative_path: impl AsRef<Path>) -> anyhow::Result<Vec<u8>> {
        let path = self.root.join(relative_path.as_ref());
        fs::read(&path)
            .await
            .with_context(|| format!("reading artifact {}", path.display()))
    }

    /// File names directly under `relative_dir`, sorted; hidden temp files are skipped.
    pub async fn list(&self, relative_dir: impl AsRef<Path>) -> anyhow::Result<Vec<String>> {
        let dir = self.root.join(relative_dir.as_ref());
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("reading {}", dir.display()))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", dir.display()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

async fn write_temp(temp_path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp artifact file {}", temp_path.display()))?;
    Ok(())
}

/// Statuses worth another attempt: overload, throttling and gateway trouble.
fn retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn retryable_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Exponential backoff: `base_delay * 2^attempt`, never above `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt).unwrap_or(u32::MAX);
        let factor = 2u32.saturating_pow(exponent);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Request pacing for one source: up to `burst` requests back to back, then one per `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub burst: u32,
    pub interval: Duration,
}

/// Overrides for one source id; unset fields fall back to the fetcher-wide defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceLimits {
    pub concurrency: Option<usize>,
    pub rate: Option<RateLimit>,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    /// In-flight requests per source id unless overridden in `sources`.
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub sources: HashMap<String, SourceLimits>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
            sources: HashMap::new(),
        }
    }
}

impl HttpClientConfig {
    pub fn with_source_limits(mut self, source_id: impl Into<String>, limits: SourceLimits) -> Self {
        self.sources.insert(source_id.into(), limits);
        self
    }
}

/// Hands out request start times for one source. `next_slot` is the theoretical time the
/// next request would start if the burst allowance were already spent.
#[derive(Debug)]
struct Pacer {
    rate: RateLimit,
    next_slot: Mutex<Option<Instant>>,
}

impl Pacer {
    fn new(rate: RateLimit) -> Self {
        Self {
            rate,
            next_slot: Mutex::new(None),
        }
    }

    /// Reserve a slot and return when it opens. Reservations are handed out in call order.
    async fn reserve(&self) -> Instant {
        let allowance = self.rate.interval.saturating_mul(self.rate.burst.max(1) - 1);
        let mut next_slot = self.next_slot.lock().await;
        let now = Instant::now();
        let slot = next_slot.map_or(now, |slot| slot.max(now));
        *next_slot = Some(slot.checked_add(self.rate.interval).unwrap_or(slot));
        slot.checked_sub(allowance).map_or(now, |start| start.max(now))
    }

    async fn wait(&self) {
        let start = self.reserve().await;
        tokio::time::sleep_until(start).await;
    }
}

/// Concurrency permits plus optional pacing for one source id.
#[derive(Debug)]
struct SourceGate {
    permits: Semaphore,
    pacer: Option<Pacer>,
}

/// A single HTTP call description; rebuilt into a fresh request on every retry.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub bearer_token: Option<String>,
    pub json_body: Option<JsonValue>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            query: Vec::new(),
            bearer_token: None,
            json_body: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: JsonValue) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            query: Vec::new(),
            bearer_token: None,
            json_body: Some(body),
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Semaphore,
    default_concurrency: usize,
    source_limits: HashMap<String, SourceLimits>,
    gates: Mutex<HashMap<String, Arc<SourceGate>>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

/// Longest slice of an error body kept on [`FetchError::HttpStatus`].
const ERROR_DETAIL_CHARS: usize = 300;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    /// `detail` holds the start of the response body, e.g. an API error code.
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        detail: String,
    },
    #[error("invalid JSON from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Semaphore::new(config.global_concurrency.max(1)),
            default_concurrency: config.per_source_concurrency.max(1),
            source_limits: config.sources,
            gates: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn gate(&self, source_id: &str) -> Arc<SourceGate> {
        let mut gates = self.gates.lock().await;
        gates
            .entry(source_id.to_string())
            .or_insert_with(|| {
                let limits = self.source_limits.get(source_id).copied().unwrap_or_default();
                Arc::new(SourceGate {
                    permits: Semaphore::new(limits.concurrency.unwrap_or(self.default_concurrency).max(1)),
                    pacer: limits.rate.map(Pacer::new),
                })
            })
            .clone()
    }

    fn build(&self, request: &FetchRequest) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = &request.bearer_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.json_body {
            builder = builder.json(body);
        }
        builder
    }

    pub async fn fetch_bytes(
        &self,
        source_id: &str,
        request: &FetchRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let gate = self.gate(source_id).await;
        let _source = gate.permits.acquire().await.map_err(|_| FetchError::Closed)?;
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", source_id, url = %request.url);
        self.fetch_with_retries(request, gate.pacer.as_ref())
            .instrument(span)
            .await
    }

    /// Every attempt, retries included, waits for its own pacing slot.
    async fn fetch_with_retries(
        &self,
        request: &FetchRequest,
        pacer: Option<&Pacer>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            if let Some(pacer) = pacer {
                pacer.wait().await;
            }
            let retry = match self.build(request).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let url = resp.url().to_string();
                    let detail = resp
                        .text()
                        .await
                        .map(|text| text.chars().take(ERROR_DETAIL_CHARS).collect::<String>())
                        .unwrap_or_default();
                    let err = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url,
                        detail,
                    };
                    if !retryable_status(status) || attempt >= self.backoff.max_retries {
                        return Err(err);
                    }
                    err
                }
                Err(err) => {
                    if !retryable_transport(&err) || attempt >= self.backoff.max_retries {
                        return Err(FetchError::Request(err));
                    }
                    FetchError::Request(err)
                }
            };
            debug!(error = %retry, attempt, "retrying request");
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        source_id: &str,
        request: &FetchRequest,
    ) -> Result<T, FetchError> {
        let response = self.fetch_bytes(source_id, request).await?;
        serde_json::from_slice(&response.body).map_err(|e| FetchError::Decode {
            url: response.final_url,
            message: e.to_string(),
        })
    }
}
