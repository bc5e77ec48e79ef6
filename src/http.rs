//! HTTP surface: the search endpoint and a liveness probe.

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;

use crate::error::SearchError;
use crate::pipeline::{SearchPipeline, SearchRequest, DEFAULT_LIMIT};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SearchPipeline>,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    lang: Option<String>,
}

pub fn router(pipeline: Arc<SearchPipeline>) -> Router {
    Router::new()
        .route("/search", get(search))
        .route("/health", get(health))
        .with_state(AppState { pipeline })
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, SearchError> {
    let request = SearchRequest {
        q: params.q.unwrap_or_default(),
        limit: params.limit.unwrap_or(DEFAULT_LIMIT),
        lang: params.lang.filter(|l| !l.trim().is_empty()),
    };
    let response = state.pipeline.run(&request).await?;
    Ok(Json(response))
}

async fn health() -> &'static str {
    "ok"
}
