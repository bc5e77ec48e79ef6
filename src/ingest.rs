//! Upsert orchestration: content-hash gating, batched embedding, and the
//! throttled statistics refresh.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::embedding::Embedder;
use crate::error::StoreError;
use crate::model::BookRecord;
use crate::store::{AnalyzeThrottle, BookIndex, IndexRow};
use crate::telemetry;

pub struct Indexer {
    index: Arc<dyn BookIndex>,
    embedder: Option<Arc<dyn Embedder>>,
    throttle: Arc<AnalyzeThrottle>,
    batch_size: usize,
}

impl Indexer {
    pub fn new(
        index: Arc<dyn BookIndex>,
        embedder: Option<Arc<dyn Embedder>>,
        throttle: Arc<AnalyzeThrottle>,
        batch_size: usize,
    ) -> Self {
        Self {
            index,
            embedder,
            throttle,
            batch_size: batch_size.max(1),
        }
    }

    /// Upsert a batch of records. Rows whose content hash already matches a
    /// stored row with a populated embedding are written without a fresh
    /// embedding; the `COALESCE` in the store keeps their old vector. An
    /// embedding batch failure leaves its rows vector-less, nothing worse.
    ///
    /// Returns the number of rows written.
    pub async fn upsert(&self, records: Vec<BookRecord>) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let hashes: Vec<String> = records.iter().map(BookRecord::content_hash).collect();
        let keys: Vec<String> = records.iter().map(|r| r.work_key.clone()).collect();
        let existing = self.index.embedding_state(&keys).await?;

        // Rows that keep their stored vector: same content, vector present.
        let needs_embedding: Vec<bool> = records
            .iter()
            .zip(&hashes)
            .map(|(r, hash)| {
                !existing
                    .get(&r.work_key)
                    .is_some_and(|s| s.has_embedding && s.content_hash == *hash)
            })
            .collect();
        let skipped = needs_embedding.iter().filter(|n| !**n).count();
        if skipped > 0 {
            telemetry::record_embed_skipped(skipped as u64);
        }

        let mut embeddings: Vec<Option<Vec<f32>>> = vec![None; records.len()];
        if let Some(embedder) = &self.embedder {
            let pending: Vec<usize> = needs_embedding
                .iter()
                .enumerate()
                .filter_map(|(i, n)| n.then_some(i))
                .collect();
            let mut embedded = 0u64;
            for chunk in pending.chunks(self.batch_size) {
                let texts: Vec<String> =
                    chunk.iter().map(|&i| records[i].doc_text()).collect();
                match embedder.embed(&texts).await {
                    Ok(vectors) if vectors.len() == texts.len() => {
                        for (&i, vector) in chunk.iter().zip(vectors) {
                            embeddings[i] = Some(vector);
                            embedded += 1;
                        }
                    }
                    Ok(vectors) => {
                        warn!(
                            expected = texts.len(),
                            got = vectors.len(),
                            "embedding batch returned wrong cardinality, dropping it"
                        );
                    }
                    Err(e) => {
                        warn!(rows = chunk.len(), error = %e, "embedding batch failed");
                    }
                }
            }
            if embedded > 0 {
                telemetry::record_embedded(embedded);
            }
        } else {
            debug!("no embedding provider configured, rows stored without vectors");
        }

        let rows: Vec<IndexRow> = records
            .into_iter()
            .zip(hashes)
            .zip(embeddings)
            .map(|((record, content_hash), embedding)| IndexRow {
                record,
                content_hash,
                embedding,
            })
            .collect();
        let written = rows.len();
        self.index.upsert_rows(&rows).await?;

        if self.throttle.try_acquire() {
            match self.index.analyze().await {
                Ok(()) => {
                    telemetry::record_analyze();
                    info!(rows = written, "refreshed index statistics after batch write");
                }
                Err(e) => warn!(error = %e, "statistics refresh failed"),
            }
        }

        Ok(written)
    }
}
