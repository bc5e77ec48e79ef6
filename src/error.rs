//! Error types for the search service.
//!
//! The taxonomy is deliberately small. Malformed input becomes
//! [`SearchError::InvalidRequest`] and surfaces as a 400. Postgres trouble is
//! the one dependency failure allowed to reach the caller (as a 500): without
//! the index there is neither a short-circuit nor a retrieval data source.
//! Every other collaborator failure (cache, embeddings, OpenLibrary, chat
//! model) is handled at its call site and degrades quality, not availability
//! — those paths never construct a `SearchError`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

/// Failures originating in the Postgres index.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Query or statement execution failed.
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Could not obtain a pooled connection.
    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
}

/// Request-level errors surfaced by the pipeline.
#[derive(Debug, Error)]
pub enum SearchError {
    /// The request failed validation; never retried, never logged as an error.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The relational index was unreachable or misbehaved.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Anything unexpected. Details stay server-side.
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for SearchError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            SearchError::InvalidRequest(reason) => {
                warn!(reason = %reason, "rejected search request");
                (StatusCode::BAD_REQUEST, "Bad Request")
            }
            other => {
                error!(error = %other, "search request failed");
                metrics::counter!("booksearch_errors_total", "type" => "internal").increment(1);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
