//! Query expansion: raw query in, structured [`QueryIntent`] out.
//!
//! One structured-extraction call, plus one translation call for RTL
//! queries. Results are cached by content hash of the normalized query.
//! Every failure path collapses to the identity transform; this stage can
//! never fail a request.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cache::{self, JsonCache};
use crate::llm::ChatModel;
use crate::model::QueryIntent;
use crate::query::{looks_rtl, sha256_hex};

const MAX_TITLE_HINTS: usize = 3;
const MAX_AUTHOR_HINTS: usize = 3;
const MAX_KEYWORDS: usize = 6;

pub struct QueryExpander {
    model: Option<Arc<dyn ChatModel>>,
    cache: Arc<dyn JsonCache>,
    ttl: Duration,
}

impl QueryExpander {
    pub fn new(model: Option<Arc<dyn ChatModel>>, cache: Arc<dyn JsonCache>, ttl: Duration) -> Self {
        Self { model, cache, ttl }
    }

    /// Expand a normalized query into an intent. Infallible by design.
    pub async fn expand(&self, normalized: &str) -> QueryIntent {
        let key = cache::cache_key("intent", &sha256_hex(normalized));
        if let Some(hit) = cache::get_json::<QueryIntent>(self.cache.as_ref(), &key).await {
            debug!(query = normalized, "intent cache hit");
            return hit;
        }

        let rtl = looks_rtl(normalized);
        let Some(model) = &self.model else {
            return QueryIntent::identity(normalized, rtl);
        };

        // A transient translation failure must not be pinned for the full
        // TTL; the next request should get another chance at translating.
        let mut cacheable = true;
        let intent = match model.extract_intent(normalized).await {
            Ok(raw) => {
                let mut intent = QueryIntent {
                    primary_query: raw
                        .primary_query
                        .filter(|q| !q.trim().is_empty())
                        .unwrap_or_else(|| normalized.to_string()),
                    english_query: None,
                    title_hints: clamp(raw.title_hints, MAX_TITLE_HINTS),
                    author_hints: clamp(raw.author_hints, MAX_AUTHOR_HINTS),
                    keywords: clamp(raw.keywords, MAX_KEYWORDS),
                };
                if rtl {
                    intent.english_query = match model.translate_to_english(normalized).await {
                        Ok(t) if !t.is_empty() => Some(t),
                        Ok(_) => Some(normalized.to_string()),
                        Err(e) => {
                            warn!(error = %e, "translation failed, using original query");
                            cacheable = false;
                            Some(normalized.to_string())
                        }
                    };
                }
                intent
            }
            Err(e) => {
                warn!(error = %e, "query expansion failed, using identity intent");
                return QueryIntent::identity(normalized, rtl);
            }
        };

        if cacheable {
            cache::set_json(self.cache.as_ref(), &key, &intent, self.ttl).await;
        }
        intent
    }
}

fn clamp(mut list: Vec<String>, max: usize) -> Vec<String> {
    list.retain(|s| !s.trim().is_empty());
    list.truncate(max);
    list
}
