//! Request-level orchestration.
//!
//! `CacheCheck -> DbShortCircuit -> [FullPipeline] -> Respond`. The
//! short-circuit check always precedes any external call: repeated
//! OpenLibrary and LLM traffic for a query the index already answers well is
//! pure waste. Every response, whichever path produced it, is written to the
//! whole-response cache before being returned.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::cache::{self, JsonCache};
use crate::catalog::{build_variants, CatalogFetcher};
use crate::error::SearchError;
use crate::expand::QueryExpander;
use crate::ingest::Indexer;
use crate::model::{RankedCandidate, ResultItem, SearchResponse, Suggestions};
use crate::query::{looks_rtl, normalize, sha256_hex, truncate_bytes};
use crate::rerank::Reranker;
use crate::retrieve::HybridRetriever;
use crate::telemetry;

/// Validated inbound request.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub q: String,
    pub limit: usize,
    pub lang: Option<String>,
}

pub const MIN_LIMIT: usize = 1;
pub const MAX_LIMIT: usize = 25;
pub const DEFAULT_LIMIT: usize = 10;

/// Language code assumed for RTL queries with no explicit preference.
const RTL_DEFAULT_LANG: &str = "heb";

/// Tunables the orchestrator needs; everything else lives in the
/// collaborators.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub shortcircuit_min_text_ratio: f64,
    pub max_variants: usize,
    pub response_ttl: Duration,
    pub catalog_base: String,
    pub covers_base: String,
}

pub struct SearchPipeline {
    cache: Arc<dyn JsonCache>,
    expander: QueryExpander,
    fetcher: CatalogFetcher,
    indexer: Indexer,
    retriever: HybridRetriever,
    reranker: Reranker,
    config: PipelineConfig,
}

impl SearchPipeline {
    pub fn new(
        cache: Arc<dyn JsonCache>,
        expander: QueryExpander,
        fetcher: CatalogFetcher,
        indexer: Indexer,
        retriever: HybridRetriever,
        reranker: Reranker,
        config: PipelineConfig,
    ) -> Self {
        Self {
            cache,
            expander,
            fetcher,
            indexer,
            retriever,
            reranker,
            config,
        }
    }

    /// Run one search request through the state machine.
    pub async fn run(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError> {
        validate(request)?;
        telemetry::record_request();
        let started = Instant::now();

        let normalized = normalize(&request.q);
        let language_preference = request
            .lang
            .clone()
            .or_else(|| looks_rtl(&request.q).then(|| RTL_DEFAULT_LANG.to_string()));

        // State: CacheCheck.
        let response_key = self.response_cache_key(request, &normalized);
        if let Some(cached) =
            cache::get_json::<SearchResponse>(self.cache.as_ref(), &response_key).await
        {
            telemetry::record_response_cache_hit();
            info!(
                query = truncate_bytes(&normalized, 120),
                "served from response cache"
            );
            return Ok(cached);
        }

        // State: DbShortCircuit. No external dependency may be touched
        // before this check resolves.
        let t_hybrid = Instant::now();
        let direct = self
            .retriever
            .search(&normalized, request.limit, language_preference.as_deref())
            .await?;
        telemetry::record_phase("hybrid", t_hybrid.elapsed());

        if self.index_suffices(&direct, request.limit) {
            telemetry::record_shortcircuit();
            let t_rerank = Instant::now();
            let reranked = self
                .reranker
                .rerank(&normalized, direct, request.limit)
                .await;
            telemetry::record_phase("rerank", t_rerank.elapsed());

            let response =
                self.assemble(normalized.clone(), Suggestions::default(), &reranked);
            cache::set_json(
                self.cache.as_ref(),
                &response_key,
                &response,
                self.config.response_ttl,
            )
            .await;
            telemetry::record_phase("total", started.elapsed());
            info!(
                query = truncate_bytes(&normalized, 120),
                results = response.results.len(),
                total_ms = started.elapsed().as_millis() as u64,
                "index short-circuit satisfied request"
            );
            return Ok(response);
        }

        // State: FullPipeline.
        let t_expand = Instant::now();
        let intent = self.expander.expand(&normalized).await;
        telemetry::record_phase("expand", t_expand.elapsed());

        let variants = build_variants(
            &intent,
            language_preference.as_deref(),
            self.config.max_variants,
        );
        let t_fetch = Instant::now();
        let docs = self.fetcher.fetch_docs(&variants).await;
        telemetry::record_phase("openlibrary", t_fetch.elapsed());

        let t_enrich = Instant::now();
        let records = self.fetcher.enrich(docs).await;
        let fetched = records.len();
        let written = self.indexer.upsert(records).await?;
        telemetry::record_phase("enrich_upsert", t_enrich.elapsed());

        let t_hybrid = Instant::now();
        let candidates = self
            .retriever
            .search(
                intent.best_query(),
                request.limit,
                language_preference.as_deref(),
            )
            .await?;
        telemetry::record_phase("hybrid", t_hybrid.elapsed());

        let t_rerank = Instant::now();
        let reranked = self
            .reranker
            .rerank(intent.best_query(), candidates, request.limit)
            .await;
        telemetry::record_phase("rerank", t_rerank.elapsed());

        let response = self.assemble(
            intent.best_query().to_string(),
            Suggestions::from(&intent),
            &reranked,
        );
        cache::set_json(
            self.cache.as_ref(),
            &response_key,
            &response,
            self.config.response_ttl,
        )
        .await;

        telemetry::record_phase("total", started.elapsed());
        info!(
            query = truncate_bytes(&normalized, 120),
            variants = variants.len(),
            fetched,
            written,
            results = response.results.len(),
            total_ms = started.elapsed().as_millis() as u64,
            "full pipeline completed"
        );
        Ok(response)
    }

    /// The index alone suffices when it fills the requested limit and enough
    /// of the candidates carry a real text match.
    fn index_suffices(&self, candidates: &[RankedCandidate], limit: usize) -> bool {
        if candidates.len() < limit || candidates.is_empty() {
            return false;
        }
        let text_hits = candidates.iter().filter(|c| c.text_score > 0.0).count();
        let ratio = text_hits as f64 / candidates.len() as f64;
        ratio >= self.config.shortcircuit_min_text_ratio
    }

    fn response_cache_key(&self, request: &SearchRequest, normalized: &str) -> String {
        let discriminator = format!(
            "{}:{}:{}",
            request.lang.as_deref().unwrap_or("-"),
            request.limit,
            sha256_hex(normalized)
        );
        cache::cache_key("resp", &discriminator)
    }

    fn assemble(
        &self,
        query_used: String,
        suggestions: Suggestions,
        candidates: &[RankedCandidate],
    ) -> SearchResponse {
        SearchResponse {
            query_used,
            suggestions,
            results: candidates
                .iter()
                .map(|c| {
                    ResultItem::from_candidate(
                        c,
                        &self.config.catalog_base,
                        &self.config.covers_base,
                    )
                })
                .collect(),
        }
    }
}

fn validate(request: &SearchRequest) -> Result<(), SearchError> {
    if request.q.trim().is_empty() {
        return Err(SearchError::InvalidRequest("q must be non-empty".into()));
    }
    if !(MIN_LIMIT..=MAX_LIMIT).contains(&request.limit) {
        return Err(SearchError::InvalidRequest(format!(
            "limit must be between {MIN_LIMIT} and {MAX_LIMIT}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_and_out_of_range() {
        let bad = SearchRequest {
            q: "   ".into(),
            limit: 10,
            lang: None,
        };
        assert!(validate(&bad).is_err());

        let zero = SearchRequest {
            q: "x".into(),
            limit: 0,
            lang: None,
        };
        assert!(validate(&zero).is_err());

        let big = SearchRequest {
            q: "x".into(),
            limit: 26,
            lang: None,
        };
        assert!(validate(&big).is_err());

        let ok = SearchRequest {
            q: "x".into(),
            limit: 25,
            lang: None,
        };
        assert!(validate(&ok).is_ok());
    }
}
