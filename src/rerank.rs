//! LLM reranking of the retrieval shortlist.
//!
//! A quality enhancement, never a correctness or availability dependency:
//! the scoring call races a hard deadline, and on timeout, failure, or a
//! disabled flag the hybrid order stands. Resulting key orders are cached so
//! a repeated query reorders without a model call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{self, JsonCache};
use crate::llm::{ChatModel, RerankItem};
use crate::model::RankedCandidate;
use crate::query::{sha256_hex, truncate_bytes};
use crate::telemetry;

/// UTF-8 byte budget per candidate sent to the scoring model.
const ITEM_TEXT_BUDGET: usize = 1800;

pub struct Reranker {
    model: Option<Arc<dyn ChatModel>>,
    cache: Arc<dyn JsonCache>,
    enabled: bool,
    timeout: Duration,
    candidates_sent: usize,
    hash_depth: usize,
    ttl: Duration,
    timeouts: AtomicU64,
}

impl Reranker {
    pub fn new(
        model: Option<Arc<dyn ChatModel>>,
        cache: Arc<dyn JsonCache>,
        enabled: bool,
        timeout: Duration,
        candidates_sent: usize,
        hash_depth: usize,
        ttl: Duration,
    ) -> Self {
        Self {
            model,
            cache,
            enabled,
            timeout,
            candidates_sent,
            hash_depth,
            ttl,
            timeouts: AtomicU64::new(0),
        }
    }

    /// How many rerank calls have hit their deadline so far.
    pub fn timeout_count(&self) -> u64 {
        self.timeouts.load(Ordering::SeqCst)
    }

    /// Reorder candidates by model-scored relevance, returning at most
    /// `take`. Infallible: every degraded path is the input order truncated.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<RankedCandidate>,
        take: usize,
    ) -> Vec<RankedCandidate> {
        let Some(model) = (self.enabled).then_some(self.model.as_ref()).flatten() else {
            return truncated(candidates, take);
        };
        if candidates.is_empty() {
            return candidates;
        }

        let cache_key = self.order_cache_key(query, &candidates);
        if let Some(order) = cache::get_json::<Vec<String>>(self.cache.as_ref(), &cache_key).await {
            debug!("rerank order cache hit");
            return truncated(apply_order(candidates, &order), take);
        }

        let items: Vec<RerankItem> = candidates
            .iter()
            .take(self.candidates_sent)
            .map(|c| RerankItem {
                work_key: c.record.work_key.clone(),
                text: truncate_bytes(&c.record.doc_text(), ITEM_TEXT_BUDGET).to_string(),
            })
            .collect();

        let scores = match tokio::time::timeout(
            self.timeout,
            model.score_relevance(query, &items),
        )
        .await
        {
            Ok(Ok(scores)) => scores,
            Ok(Err(e)) => {
                warn!(error = %e, "rerank call failed, keeping hybrid order");
                return truncated(candidates, take);
            }
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::SeqCst);
                telemetry::record_rerank_timeout();
                warn!(timeout = ?self.timeout, "rerank call timed out, keeping hybrid order");
                return truncated(candidates, take);
            }
        };

        let score_by_key: HashMap<&str, f64> = scores
            .iter()
            .map(|s| (s.work_key.as_str(), s.score))
            .collect();

        // Sort the scored slice, leave the remainder in hybrid order.
        let scored_len = items.len();
        let mut head: Vec<RankedCandidate> = candidates
            .iter()
            .take(scored_len)
            .cloned()
            .collect();
        head.sort_by(|a, b| {
            let sa = score_by_key.get(a.record.work_key.as_str()).unwrap_or(&0.0);
            let sb = score_by_key.get(b.record.work_key.as_str()).unwrap_or(&0.0);
            sb.partial_cmp(sa).unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut reordered = head;
        reordered.extend(candidates.into_iter().skip(scored_len));

        let order: Vec<String> = reordered
            .iter()
            .map(|c| c.record.work_key.clone())
            .collect();
        cache::set_json(self.cache.as_ref(), &cache_key, &order, self.ttl).await;

        truncated(reordered, take)
    }

    /// Cache key over the query and the leading work keys, so the same
    /// query against a changed candidate set misses.
    fn order_cache_key(&self, query: &str, candidates: &[RankedCandidate]) -> String {
        let keys: Vec<&str> = candidates
            .iter()
            .take(self.hash_depth)
            .map(|c| c.record.work_key.as_str())
            .collect();
        cache::cache_key(
            "rerank",
            &sha256_hex(&format!("{query}\n{}", keys.join("|"))),
        )
    }
}

fn truncated(mut candidates: Vec<RankedCandidate>, take: usize) -> Vec<RankedCandidate> {
    candidates.truncate(take);
    candidates
}

/// Replay a cached key order: listed candidates first in that order, then
/// any stragglers in their current order.
fn apply_order(candidates: Vec<RankedCandidate>, order: &[String]) -> Vec<RankedCandidate> {
    let mut by_key: HashMap<String, RankedCandidate> = candidates
        .into_iter()
        .map(|c| (c.record.work_key.clone(), c))
        .collect();
    let mut out = Vec::with_capacity(by_key.len());
    for key in order {
        if let Some(c) = by_key.remove(key) {
            out.push(c);
        }
    }
    let mut rest: Vec<RankedCandidate> = by_key.into_values().collect();
    rest.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    out.extend(rest);
    out
}
