//! Service configuration, read from the environment.
//!
//! Every tunable in the pipeline (short-circuit threshold, overshoot
//! multipliers, enrichment cutoff, TTLs) is surfaced here rather than
//! hard-coded. The threshold and multiplier defaults have not been
//! empirically tuned.

use std::env;
use std::time::Duration;

/// Runtime configuration for the search service.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Port for the search HTTP endpoint.
    pub port: u16,
    /// Port for the Prometheus metrics listener.
    pub metrics_port: u16,

    /// Postgres connection string. The index is the one hard dependency.
    pub database_url: String,
    /// Redis URL; absent means caching is a no-op.
    pub redis_url: Option<String>,
    /// OpenAI API key; absent disables expansion, embeddings and reranking.
    pub openai_api_key: Option<String>,

    /// Chat model used for query expansion, translation and reranking.
    pub chat_model: String,
    /// Embedding model for both documents and queries.
    pub embedding_model: String,
    /// Output dimensionality of the embedding model.
    pub embedding_dimensions: usize,
    /// Rows per embedding-provider batch call.
    pub embed_batch_size: usize,

    /// OpenLibrary base URL (overridable for tests).
    pub openlibrary_base: String,
    /// Cover image base URL.
    pub covers_base: String,
    /// Per-request timeout for OpenLibrary calls.
    pub openlibrary_timeout: Duration,
    /// Result cap requested per search variant.
    pub variant_limit: u32,
    /// Maximum number of distinct search variants per request.
    pub max_variants: usize,
    /// How many summary docs get a per-work detail fetch. Cost cutoff by
    /// arrival order, not a ranking step.
    pub enrich_top: usize,
    /// Maximum in-flight detail fetches.
    pub enrich_concurrency: usize,

    /// Candidate count must reach the requested limit and this fraction of
    /// candidates must carry a nonzero text score for the DB-only path to
    /// satisfy a request without touching external APIs.
    pub shortcircuit_min_text_ratio: f64,
    /// Each index scan fetches `max(scan_multiplier * limit, 30)` rows.
    pub scan_multiplier: usize,
    /// Retrieval returns up to `max(overshoot_multiplier * limit, limit)`
    /// candidates so the reranker has material to work with.
    pub overshoot_multiplier: usize,

    /// Whether LLM reranking is enabled (requires a chat model).
    pub rerank_enabled: bool,
    /// Hard deadline for the rerank call; on expiry the hybrid order stands.
    pub rerank_timeout: Duration,
    /// How many candidates are sent to the scoring model.
    pub rerank_candidates: usize,
    /// How many leading work keys participate in the rerank cache key.
    pub rerank_hash_depth: usize,

    /// Minimum interval between `ANALYZE` runs on the index table.
    pub analyze_min_interval: Duration,

    /// Whole-response cache TTL.
    pub response_ttl: Duration,
    /// Query-intent cache TTL.
    pub intent_ttl: Duration,
    /// OpenLibrary search-page cache TTL.
    pub ol_search_ttl: Duration,
    /// OpenLibrary work-detail cache TTL.
    pub ol_work_ttl: Duration,
    /// Query-embedding cache TTL.
    pub query_embedding_ttl: Duration,
    /// Rerank-order cache TTL.
    pub rerank_ttl: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            metrics_port: 9091,
            database_url: "postgresql://localhost:5432/booksearch".to_string(),
            redis_url: None,
            openai_api_key: None,
            chat_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimensions: 1536,
            embed_batch_size: 64,
            openlibrary_base: "https://openlibrary.org".to_string(),
            covers_base: "https://covers.openlibrary.org".to_string(),
            openlibrary_timeout: Duration::from_secs(15),
            variant_limit: 60,
            max_variants: 6,
            enrich_top: 80,
            enrich_concurrency: 8,
            shortcircuit_min_text_ratio: 0.4,
            scan_multiplier: 3,
            overshoot_multiplier: 2,
            rerank_enabled: true,
            rerank_timeout: Duration::from_secs(6),
            rerank_candidates: 30,
            rerank_hash_depth: 15,
            analyze_min_interval: Duration::from_secs(120),
            response_ttl: Duration::from_secs(900),
            intent_ttl: Duration::from_secs(86_400),
            ol_search_ttl: Duration::from_secs(3_600),
            ol_work_ttl: Duration::from_secs(86_400),
            query_embedding_ttl: Duration::from_secs(86_400),
            rerank_ttl: Duration::from_secs(86_400),
        }
    }
}

impl AppConfig {
    /// Build a config from the environment, falling back to defaults.
    ///
    /// A `.env` file is honoured when present. `DATABASE_URL` has no useful
    /// default in production but keeps its local-dev fallback so the binary
    /// can start against a dockerised Postgres without any setup.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let d = Self::default();

        Self {
            port: env_parse("PORT", d.port),
            metrics_port: env_parse("METRICS_PORT", d.metrics_port),
            database_url: env_string("DATABASE_URL", &d.database_url),
            redis_url: env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            openai_api_key: env::var("OPENAI_API_KEY").ok().filter(|s| !s.is_empty()),
            chat_model: env_string("CHAT_MODEL", &d.chat_model),
            embedding_model: env_string("EMBEDDING_MODEL", &d.embedding_model),
            embedding_dimensions: env_parse("EMBEDDING_DIMENSIONS", d.embedding_dimensions),
            embed_batch_size: env_parse("EMBED_BATCH_SIZE", d.embed_batch_size),
            openlibrary_base: env_string("OPENLIBRARY_BASE_URL", &d.openlibrary_base),
            covers_base: env_string("COVERS_BASE_URL", &d.covers_base),
            openlibrary_timeout: env_secs("OPENLIBRARY_TIMEOUT_SECS", d.openlibrary_timeout),
            variant_limit: env_parse("VARIANT_LIMIT", d.variant_limit),
            max_variants: env_parse("MAX_VARIANTS", d.max_variants),
            enrich_top: env_parse("ENRICH_TOP", d.enrich_top),
            enrich_concurrency: env_parse("ENRICH_CONCURRENCY", d.enrich_concurrency),
            shortcircuit_min_text_ratio: env_parse(
                "SHORTCIRCUIT_MIN_TEXT_RATIO",
                d.shortcircuit_min_text_ratio,
            ),
            scan_multiplier: env_parse("SCAN_MULTIPLIER", d.scan_multiplier),
            overshoot_multiplier: env_parse("OVERSHOOT_MULTIPLIER", d.overshoot_multiplier),
            rerank_enabled: env_parse("RERANK_ENABLED", d.rerank_enabled),
            rerank_timeout: env_secs("RERANK_TIMEOUT_SECS", d.rerank_timeout),
            rerank_candidates: env_parse("RERANK_CANDIDATES", d.rerank_candidates),
            rerank_hash_depth: env_parse("RERANK_HASH_DEPTH", d.rerank_hash_depth),
            analyze_min_interval: env_secs("ANALYZE_MIN_INTERVAL_SECS", d.analyze_min_interval),
            response_ttl: env_secs("RESPONSE_TTL_SECS", d.response_ttl),
            intent_ttl: env_secs("INTENT_TTL_SECS", d.intent_ttl),
            ol_search_ttl: env_secs("OL_SEARCH_TTL_SECS", d.ol_search_ttl),
            ol_work_ttl: env_secs("OL_WORK_TTL_SECS", d.ol_work_ttl),
            query_embedding_ttl: env_secs("QUERY_EMBEDDING_TTL_SECS", d.query_embedding_ttl),
            rerank_ttl: env_secs("RERANK_TTL_SECS", d.rerank_ttl),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
