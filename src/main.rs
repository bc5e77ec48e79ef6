use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use booksearch::cache::{JsonCache, NoopCache, RedisCache};
use booksearch::catalog::{CatalogFetcher, OpenLibraryClient};
use booksearch::config::AppConfig;
use booksearch::embedding::{Embedder, OpenAiEmbedder};
use booksearch::expand::QueryExpander;
use booksearch::http;
use booksearch::ingest::Indexer;
use booksearch::llm::{ChatModel, OpenAiChatModel};
use booksearch::pipeline::{PipelineConfig, SearchPipeline};
use booksearch::rerank::Reranker;
use booksearch::retrieve::HybridRetriever;
use booksearch::store::{build_pool, AnalyzeThrottle, BookIndex, PgBookIndex};
use booksearch::telemetry;

const POOL_MAX_SIZE: usize = 16;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();
    telemetry::init(config.metrics_port)?;

    let pool = build_pool(&config.database_url, POOL_MAX_SIZE)
        .context("invalid DATABASE_URL")?;
    let index: Arc<dyn BookIndex> =
        Arc::new(PgBookIndex::new(pool, config.embedding_dimensions));
    index
        .ensure_schema()
        .await
        .context("schema initialization failed")?;
    info!("index schema ready");

    let cache: Arc<dyn JsonCache> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisCache::connect(url)
                .await
                .context("redis connection failed")?,
        ),
        None => {
            warn!("REDIS_URL not set, caching disabled");
            Arc::new(NoopCache)
        }
    };

    let (chat_model, embedder): (Option<Arc<dyn ChatModel>>, Option<Arc<dyn Embedder>>) =
        match &config.openai_api_key {
            Some(key) => (
                Some(Arc::new(OpenAiChatModel::new(key, &config.chat_model))),
                Some(Arc::new(OpenAiEmbedder::new(
                    key,
                    &config.embedding_model,
                    config.embedding_dimensions,
                ))),
            ),
            None => {
                warn!("OPENAI_API_KEY not set, expansion/embeddings/reranking disabled");
                (None, None)
            }
        };

    let catalog = Arc::new(OpenLibraryClient::new(
        Arc::clone(&cache),
        &config.openlibrary_base,
        config.openlibrary_timeout,
        config.variant_limit,
        config.ol_search_ttl,
        config.ol_work_ttl,
    )?);

    let pipeline = Arc::new(SearchPipeline::new(
        Arc::clone(&cache),
        QueryExpander::new(chat_model.clone(), Arc::clone(&cache), config.intent_ttl),
        CatalogFetcher::new(catalog, config.enrich_top, config.enrich_concurrency),
        Indexer::new(
            Arc::clone(&index),
            embedder.clone(),
            Arc::new(AnalyzeThrottle::new(config.analyze_min_interval)),
            config.embed_batch_size,
        ),
        HybridRetriever::new(
            Arc::clone(&index),
            embedder,
            Arc::clone(&cache),
            config.scan_multiplier,
            config.overshoot_multiplier,
            config.query_embedding_ttl,
        ),
        Reranker::new(
            chat_model,
            Arc::clone(&cache),
            config.rerank_enabled,
            config.rerank_timeout,
            config.rerank_candidates,
            config.rerank_hash_depth,
            config.rerank_ttl,
        ),
        PipelineConfig {
            shortcircuit_min_text_ratio: config.shortcircuit_min_text_ratio,
            max_variants: config.max_variants,
            response_ttl: config.response_ttl,
            catalog_base: config.openlibrary_base.clone(),
            covers_base: config.covers_base.clone(),
        },
    ));

    let app = http::router(pipeline);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "search service listening");
    axum::serve(listener, app).await?;
    Ok(())
}
