//! Grouping candidates into bounded oracle requests.

use std::collections::BTreeMap;

use nitroscout_core::Candidate;
use serde::{Deserialize, Serialize};

use crate::oracle::{OracleItem, OracleRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLimits {
    #[serde(default = "default_max_items")]
    pub max_items_per_batch: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens_per_batch: usize,
    /// Added to each item's estimate for the JSON framing around it.
    #[serde(default = "default_item_overhead")]
    pub per_item_overhead_tokens: usize,
    /// Thread text budget per item, in characters.
    #[serde(default = "default_thread_chars")]
    pub thread_chars: usize,
}

fn default_max_items() -> usize {
    15
}

fn default_max_tokens() -> usize {
    12_000
}

fn default_item_overhead() -> usize {
    24
}

fn default_thread_chars() -> usize {
    1_500
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_items_per_batch: default_max_items(),
            max_tokens_per_batch: default_max_tokens(),
            per_item_overhead_tokens: default_item_overhead(),
            thread_chars: default_thread_chars(),
        }
    }
}

/// One oracle request's worth of candidates from a single community.
#[derive(Debug, Clone)]
pub struct Batch<'a> {
    pub community: String,
    /// 1-based position within the community.
    pub index: usize,
    pub total: usize,
    pub candidates: Vec<&'a Candidate>,
    pub request: OracleRequest,
    pub estimated_tokens: usize,
}

/// All batches of one community, in submission order.
#[derive(Debug, Clone)]
pub struct CommunityBatches<'a> {
    pub community: String,
    pub batches: Vec<Batch<'a>>,
}

/// Group by community (sorted), then greedily fill batches in input order.
///
/// A candidate whose estimate alone exceeds the token cap still gets a batch of its own;
/// its content is never split.
pub fn plan_batches<'a>(candidates: &'a [Candidate], limits: &BatchLimits) -> Vec<CommunityBatches<'a>> {
    let max_items = limits.max_items_per_batch.max(1);
    let mut by_community: BTreeMap<&str, Vec<&'a Candidate>> = BTreeMap::new();
    for candidate in candidates {
        by_community.entry(candidate.community.as_str()).or_default().push(candidate);
    }

    by_community
        .into_iter()
        .map(|(community, members)| {
            let mut chunks: Vec<(Vec<&'a Candidate>, Vec<OracleItem>, usize)> = Vec::new();
            let mut current: (Vec<&'a Candidate>, Vec<OracleItem>, usize) = (Vec::new(), Vec::new(), 0);

            for candidate in members {
                let item = OracleItem::from_candidate(candidate, limits.thread_chars);
                let cost = item.estimated_tokens() + limits.per_item_overhead_tokens;
                let full = current.0.len() >= max_items
                    || (!current.0.is_empty() && current.2 + cost > limits.max_tokens_per_batch);
                if full {
                    chunks.push(std::mem::take(&mut current));
                }
                current.0.push(candidate);
                current.1.push(item);
                current.2 += cost;
            }
            if !current.0.is_empty() {
                chunks.push(current);
            }

            let total = chunks.len();
            let batches = chunks
                .into_iter()
                .enumerate()
                .map(|(i, (candidates, items, estimated_tokens))| Batch {
                    community: community.to_string(),
                    index: i + 1,
                    total,
                    candidates,
                    request: OracleRequest {
                        community: community.to_string(),
                        items,
                    },
                    estimated_tokens,
                })
                .collect();
            CommunityBatches {
                community: community.to_string(),
                batches,
            }
        })
        .collect()
}
