//! In-memory fakes for the pipeline's external collaborators.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use booksearch::catalog::{Catalog, SearchVariant, WorkDetail};
use booksearch::embedding::Embedder;
use booksearch::error::StoreError;
use booksearch::llm::{ChatModel, RawIntent, RerankItem, RerankScore};
use booksearch::query::sha256_hex;
use booksearch::store::{BookIndex, EmbeddingState, IndexRow, ScanRow};

/// In-memory stand-in for the Postgres index. The text scan matches query
/// tokens as substrings of the document text; the vector scan ranks by
/// cosine similarity.
#[derive(Default)]
pub struct MemoryIndex {
    rows: Mutex<HashMap<String, IndexRow>>,
    pub vector_scans: AtomicUsize,
    pub text_scans: AtomicUsize,
    pub analyze_runs: AtomicUsize,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn row(&self, work_key: &str) -> Option<IndexRow> {
        self.rows.lock().ok()?.get(work_key).cloned()
    }

    pub fn seed(&self, rows: Vec<IndexRow>) {
        let mut map = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        for row in rows {
            map.insert(row.record.work_key.clone(), row);
        }
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let na: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl BookIndex for MemoryIndex {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn embedding_state(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, EmbeddingState>, StoreError> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        Ok(keys
            .iter()
            .filter_map(|k| {
                rows.get(k).map(|row| {
                    (
                        k.clone(),
                        EmbeddingState {
                            content_hash: row.content_hash.clone(),
                            has_embedding: row.embedding.is_some(),
                        },
                    )
                })
            })
            .collect())
    }

    async fn upsert_rows(&self, incoming: &[IndexRow]) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        for row in incoming {
            // A missing fresh embedding keeps the stored one.
            let embedding = row.embedding.clone().or_else(|| {
                rows.get(&row.record.work_key)
                    .and_then(|prev| prev.embedding.clone())
            });
            rows.insert(
                row.record.work_key.clone(),
                IndexRow {
                    record: row.record.clone(),
                    content_hash: row.content_hash.clone(),
                    embedding,
                },
            );
        }
        Ok(())
    }

    async fn vector_scan(&self, embedding: &[f32], k: i64) -> Result<Vec<ScanRow>, StoreError> {
        self.vector_scans.fetch_add(1, Ordering::SeqCst);
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let mut scored: Vec<ScanRow> = rows
            .values()
            .filter_map(|row| {
                row.embedding.as_ref().map(|v| ScanRow {
                    record: row.record.clone(),
                    score: cosine(embedding, v),
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k as usize);
        Ok(scored)
    }

    async fn text_scan(&self, query: &str, k: i64) -> Result<Vec<ScanRow>, StoreError> {
        self.text_scans.fetch_add(1, Ordering::SeqCst);
        let tokens: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let mut scored: Vec<ScanRow> = rows
            .values()
            .filter_map(|row| {
                let text = row.record.doc_text().to_lowercase();
                let matched = tokens.iter().filter(|t| text.contains(t.as_str())).count();
                (matched > 0).then(|| ScanRow {
                    record: row.record.clone(),
                    score: matched as f64 / tokens.len() as f64,
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k as usize);
        Ok(scored)
    }

    async fn analyze(&self) -> Result<(), StoreError> {
        self.analyze_runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Deterministic embedder: vectors derive from the text's hash, so equal
/// texts embed equally and callers can count batches.
#[derive(Default)]
pub struct MockEmbedder {
    pub batches: AtomicUsize,
    pub texts_embedded: AtomicUsize,
    pub failing: AtomicBool,
}

impl MockEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("embedding provider unavailable");
        }
        self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| {
                sha256_hex(t)
                    .bytes()
                    .take(8)
                    .map(|b| b as f32 / 255.0)
                    .collect()
            })
            .collect())
    }
}

/// Scripted chat model with per-call counters and an optional delay.
pub struct MockChatModel {
    pub intent: Option<RawIntent>,
    pub translation: Option<String>,
    pub scores: Vec<RerankScore>,
    pub delay: Option<Duration>,
    pub extract_calls: AtomicUsize,
    pub translate_calls: AtomicUsize,
    pub score_calls: AtomicUsize,
}

impl MockChatModel {
    pub fn new() -> Self {
        Self {
            intent: None,
            translation: None,
            scores: Vec::new(),
            delay: None,
            extract_calls: AtomicUsize::new(0),
            translate_calls: AtomicUsize::new(0),
            score_calls: AtomicUsize::new(0),
        }
    }
}

impl Default for MockChatModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatModel for MockChatModel {
    async fn extract_intent(&self, _query: &str) -> anyhow::Result<RawIntent> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.intent
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no scripted intent"))
    }

    async fn translate_to_english(&self, _text: &str) -> anyhow::Result<String> {
        self.translate_calls.fetch_add(1, Ordering::SeqCst);
        self.translation
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no scripted translation"))
    }

    async fn score_relevance(
        &self,
        _query: &str,
        _items: &[RerankItem],
    ) -> anyhow::Result<Vec<RerankScore>> {
        self.score_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.scores.clone())
    }
}

/// Canned catalog: every search variant returns the same document page.
pub struct MockCatalog {
    pub docs: Vec<Value>,
    pub details: HashMap<String, WorkDetail>,
    pub search_calls: AtomicUsize,
    pub detail_calls: AtomicUsize,
}

impl MockCatalog {
    pub fn new(docs: Vec<Value>) -> Self {
        Self {
            docs,
            details: HashMap::new(),
            search_calls: AtomicUsize::new(0),
            detail_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Catalog for MockCatalog {
    async fn search(&self, _variant: &SearchVariant) -> anyhow::Result<Vec<Value>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.docs.clone())
    }

    async fn work_detail(&self, work_key: &str) -> anyhow::Result<Option<WorkDetail>> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.details.get(work_key).cloned())
    }
}
