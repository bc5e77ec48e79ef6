//! Hybrid retrieval: a nearest-neighbour scan and a full-text scan over the
//! index, merged under a fixed weighting plus categorical boosts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{self, JsonCache};
use crate::embedding::Embedder;
use crate::error::StoreError;
use crate::model::RankedCandidate;
use crate::query::sha256_hex;
use crate::store::{BookIndex, ScanRow};

const VECTOR_WEIGHT: f64 = 0.65;
const TEXT_WEIGHT: f64 = 0.35;
const LANGUAGE_BOOST: f64 = 0.05;
const FULLTEXT_BOOST: f64 = 0.03;
const COVER_BOOST: f64 = 0.02;

/// Floor for the per-scan candidate cap.
const MIN_SCAN_ROWS: usize = 30;

pub struct HybridRetriever {
    index: Arc<dyn BookIndex>,
    embedder: Option<Arc<dyn Embedder>>,
    cache: Arc<dyn JsonCache>,
    scan_multiplier: usize,
    overshoot_multiplier: usize,
    embedding_ttl: Duration,
}

impl HybridRetriever {
    pub fn new(
        index: Arc<dyn BookIndex>,
        embedder: Option<Arc<dyn Embedder>>,
        cache: Arc<dyn JsonCache>,
        scan_multiplier: usize,
        overshoot_multiplier: usize,
        embedding_ttl: Duration,
    ) -> Self {
        Self {
            index,
            embedder,
            cache,
            scan_multiplier,
            overshoot_multiplier,
            embedding_ttl,
        }
    }

    /// Rank candidates for a query. The vector side disappears silently when
    /// no embedder is configured or the embedding call fails; the text side
    /// is always attempted. Only index errors propagate.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        language_preference: Option<&str>,
    ) -> Result<Vec<RankedCandidate>, StoreError> {
        let k = (self.scan_multiplier * limit).max(MIN_SCAN_ROWS) as i64;

        let vector_rows = match self.query_embedding(query).await {
            Some(embedding) => self.index.vector_scan(&embedding, k).await?,
            None => Vec::new(),
        };
        let text_rows = self.index.text_scan(query, k).await?;

        let mut candidates = merge_and_score(vector_rows, text_rows, language_preference);
        candidates.truncate((self.overshoot_multiplier * limit).max(limit));
        Ok(candidates)
    }

    /// Embed the query, cache-fronted by its hash. Failures degrade to
    /// text-only scoring.
    async fn query_embedding(&self, query: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        let key = cache::cache_key("qemb", &sha256_hex(query));
        if let Some(cached) = cache::get_json::<Vec<f32>>(self.cache.as_ref(), &key).await {
            debug!("query embedding cache hit");
            return Some(cached);
        }
        match embedder.embed(&[query.to_string()]).await {
            Ok(mut vectors) if !vectors.is_empty() => {
                let embedding = vectors.swap_remove(0);
                cache::set_json(self.cache.as_ref(), &key, &embedding, self.embedding_ttl).await;
                Some(embedding)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "query embedding failed, text-only scoring");
                None
            }
        }
    }
}

/// Merge the two scans by work key and compute composite scores. A candidate
/// absent from a scan scores zero on that side. When both scans return a
/// row, the text scan's copy of the record wins (it never lacks fields the
/// vector side has).
pub fn merge_and_score(
    vector_rows: Vec<ScanRow>,
    text_rows: Vec<ScanRow>,
    language_preference: Option<&str>,
) -> Vec<RankedCandidate> {
    struct Entry {
        row: ScanRow,
        vector: f64,
        text: f64,
    }

    let mut by_key: HashMap<String, Entry> = HashMap::new();
    for row in vector_rows {
        let score = row.score;
        by_key.insert(
            row.record.work_key.clone(),
            Entry {
                row,
                vector: score,
                text: 0.0,
            },
        );
    }
    for row in text_rows {
        let score = row.score;
        match by_key.get_mut(&row.record.work_key) {
            Some(entry) => {
                entry.row = row;
                entry.text = score;
            }
            None => {
                by_key.insert(
                    row.record.work_key.clone(),
                    Entry {
                        row,
                        vector: 0.0,
                        text: score,
                    },
                );
            }
        }
    }

    let mut candidates: Vec<RankedCandidate> = by_key
        .into_values()
        .map(|entry| {
            let record = entry.row.record;
            let language_bonus = match language_preference {
                Some(pref) if record.languages.iter().any(|l| l == pref) => LANGUAGE_BOOST,
                _ => 0.0,
            };
            let fulltext_bonus = if record.has_fulltext { FULLTEXT_BOOST } else { 0.0 };
            let cover_bonus = if record.cover_id.is_some() { COVER_BOOST } else { 0.0 };
            let score = VECTOR_WEIGHT * entry.vector
                + TEXT_WEIGHT * entry.text
                + language_bonus
                + fulltext_bonus
                + cover_bonus;
            RankedCandidate {
                record,
                vector_score: entry.vector,
                text_score: entry.text,
                score,
            }
        })
        .collect();

    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    candidates
}
