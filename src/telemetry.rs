//! Tracing and metrics setup.

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured logging and the Prometheus metrics listener.
///
/// The exporter serves `/metrics` on its own port so the search endpoint
/// stays single-purpose. Call once at startup.
pub fn init(metrics_port: u16) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus exporter: {e}"))?;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    metrics::counter!("booksearch_startup_total").increment(1);
    Ok(())
}

/// Record one search request.
pub fn record_request() {
    metrics::counter!("booksearch_requests_total").increment(1);
}

/// Record the duration of one pipeline phase.
pub fn record_phase(phase: &'static str, elapsed: Duration) {
    metrics::histogram!("booksearch_phase_duration_seconds", "phase" => phase)
        .record(elapsed.as_secs_f64());
}

/// Record a cache hit for a keyed cache type (`ol_search`, `work`, ...).
pub fn record_cache_hit(kind: &'static str) {
    metrics::counter!("booksearch_cache_hits_total", "type" => kind).increment(1);
}

/// Record a cache miss for a keyed cache type.
pub fn record_cache_miss(kind: &'static str) {
    metrics::counter!("booksearch_cache_misses_total", "type" => kind).increment(1);
}

/// The DB-only path satisfied a request without external calls.
pub fn record_shortcircuit() {
    metrics::counter!("booksearch_db_shortcircuit_total").increment(1);
}

/// A whole-response cache hit.
pub fn record_response_cache_hit() {
    metrics::counter!("booksearch_response_cache_hits_total").increment(1);
}

/// Embeddings skipped because content was unchanged.
pub fn record_embed_skipped(n: u64) {
    metrics::counter!("booksearch_embed_skipped_total").increment(n);
}

/// Embeddings actually produced.
pub fn record_embedded(n: u64) {
    metrics::counter!("booksearch_embeddings_total").increment(n);
}

/// An `ANALYZE` pass ran after a batch write.
pub fn record_analyze() {
    metrics::counter!("booksearch_analyze_total").increment(1);
}

/// The rerank call hit its deadline and the hybrid order was kept.
pub fn record_rerank_timeout() {
    metrics::counter!("booksearch_rerank_timeouts_total").increment(1);
}
