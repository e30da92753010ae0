//! Shared pool of oracle API keys with rotation on rate limits.

use std::fmt;

use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// 1-based position in the pool, safe to log.
    pub label: String,
    pub secret: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("label", &self.label)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// A credential handed out by the pool, remembering which slot it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub index: usize,
    pub credential: Credential,
}

#[derive(Debug)]
struct PoolState {
    cursor: usize,
    exhausted: Vec<bool>,
}

impl PoolState {
    /// First live slot at or after the cursor, wrapping once.
    fn next_live(&self) -> Option<usize> {
        let len = self.exhausted.len();
        (0..len)
            .map(|offset| (self.cursor + offset) % len)
            .find(|idx| !self.exhausted[*idx])
    }
}

/// Credentials are tried in configuration order. A rate-limited credential stays exhausted
/// for the rest of the run.
#[derive(Debug)]
pub struct CredentialPool {
    credentials: Vec<Credential>,
    state: Mutex<PoolState>,
}

impl CredentialPool {
    /// Build a pool from raw secrets; blanks and duplicates are dropped, order preserved.
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut credentials: Vec<Credential> = Vec::new();
        for secret in secrets {
            let secret = secret.into().trim().to_string();
            if secret.is_empty() || credentials.iter().any(|c| c.secret == secret) {
                continue;
            }
            credentials.push(Credential {
                label: format!("key#{}", credentials.len() + 1),
                secret,
            });
        }
        let exhausted = vec![false; credentials.len()];
        Self {
            credentials,
            state: Mutex::new(PoolState {
                cursor: 0,
                exhausted,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// The credential every batch should currently use, or `None` once all are exhausted.
    pub async fn current(&self) -> Option<Lease> {
        let mut state = self.state.lock().await;
        let idx = state.next_live()?;
        state.cursor = idx;
        Some(self.lease(idx))
    }

    /// Mark `lease` exhausted and return the credential to retry with.
    ///
    /// If another batch already rotated past `lease`, the cursor is left where it is and
    /// the caller gets the current credential, so no live slot is skipped.
    pub async fn report_rate_limited(&self, lease: &Lease) -> Option<Lease> {
        let mut state = self.state.lock().await;
        if let Some(flag) = state.exhausted.get_mut(lease.index) {
            if !*flag {
                warn!(credential = %lease.credential.label, "credential rate limited; marking exhausted");
            }
            *flag = true;
        }
        let Some(idx) = state.next_live() else {
            warn!(pool_size = self.credentials.len(), "all oracle credentials exhausted");
            return None;
        };
        if idx != state.cursor {
            info!(from = %lease.credential.label, to = %self.credentials[idx].label, "rotating oracle credential");
        }
        state.cursor = idx;
        Some(self.lease(idx))
    }

    pub async fn live_count(&self) -> usize {
        let state = self.state.lock().await;
        state.exhausted.iter().filter(|e| !**e).count()
    }

    fn lease(&self, index: usize) -> Lease {
        Lease {
            index,
            credential: self.credentials[index].clone(),
        }
    }
}
