//! OpenLibrary catalog access: variant construction, concurrent search
//! fan-out, and bounded per-work enrichment.
//!
//! Every network call is cache-fronted and independently failable: a dead
//! variant shrinks the result set, a dead detail call degrades one document
//! to its summary fields. The API has no first-class language parameter, so
//! the language filter travels as a request token alongside the query.

use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{self, JsonCache};
use crate::model::{BookRecord, QueryIntent};
use crate::query::sha256_hex;
use crate::telemetry;

/// Summary fields requested from the search endpoint.
const SEARCH_FIELDS: &str =
    "key,title,author_name,first_publish_year,language,cover_i,has_fulltext,public_scan_b,ia";

/// One parameter set for the search endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchVariant {
    pub q: String,
    pub lang: Option<String>,
}

/// Construct up to `max` deduplicated variants from an intent: the
/// primary/English query, one per title hint, one per author hint, and one
/// joining all keywords.
pub fn build_variants(intent: &QueryIntent, lang: Option<&str>, max: usize) -> Vec<SearchVariant> {
    let mut queries = vec![intent.best_query().to_string()];
    for t in &intent.title_hints {
        queries.push(format!("title:{t}"));
    }
    for a in &intent.author_hints {
        queries.push(format!("author:{a}"));
    }
    if !intent.keywords.is_empty() {
        queries.push(intent.keywords.join(" "));
    }

    let mut seen = HashSet::new();
    let mut variants = Vec::new();
    for q in queries {
        let variant = SearchVariant {
            q,
            lang: lang.map(str::to_string),
        };
        if seen.insert(variant.clone()) {
            variants.push(variant);
        }
        if variants.len() == max {
            break;
        }
    }
    variants
}

/// Normalize a catalog key to its canonical `/works/...` form.
pub fn canonical_work_key(key: &str) -> Option<String> {
    if key.is_empty() {
        return None;
    }
    if key.starts_with("/works/") {
        Some(key.to_string())
    } else {
        Some(format!("/works/{key}"))
    }
}

/// Summary document shape from the search endpoint. Everything is optional;
/// a document failing shape validation degrades to defaults rather than
/// failing the page.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SummaryDoc {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author_name: Vec<String>,
    #[serde(default)]
    pub first_publish_year: Option<i32>,
    #[serde(default)]
    pub language: Vec<String>,
    #[serde(default)]
    pub subject: Vec<String>,
    #[serde(default)]
    pub cover_i: Option<i32>,
    #[serde(default)]
    pub has_fulltext: bool,
    #[serde(default)]
    pub public_scan_b: bool,
    #[serde(default)]
    pub ia: Vec<String>,
}

/// A summary document plus its raw JSON (retained as row metadata).
#[derive(Debug, Clone)]
pub struct RawDoc {
    pub work_key: String,
    pub summary: SummaryDoc,
    pub raw: Value,
}

/// Enriched fields from the per-work detail endpoint.
#[derive(Debug, Clone, Default)]
pub struct WorkDetail {
    pub description: Option<String>,
    pub subjects: Vec<String>,
    pub languages: Vec<String>,
}

impl WorkDetail {
    /// Parse a raw work document. The description is either a bare string or
    /// a `{"type": ..., "value": ...}` object; languages arrive as
    /// `{"key": "/languages/xxx"}` references.
    pub fn from_value(value: &Value) -> Self {
        let description = match value.get("description") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Object(obj)) => obj
                .get("value")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        };
        let subjects = value
            .get("subjects")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let languages = value
            .get("languages")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|l| l.get("key").and_then(Value::as_str))
                    .filter_map(|k| k.rsplit('/').next())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            description,
            subjects,
            languages,
        }
    }
}

/// Bibliographic catalog contract: keyword search and per-work detail.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Run one search variant, returning the raw document list.
    async fn search(&self, variant: &SearchVariant) -> anyhow::Result<Vec<Value>>;

    /// Fetch the detail document for one work. `Ok(None)` when the work is
    /// unavailable; the caller degrades that document to summary fields.
    async fn work_detail(&self, work_key: &str) -> anyhow::Result<Option<WorkDetail>>;
}

/// OpenLibrary HTTP client, cache-fronted on both endpoints.
pub struct OpenLibraryClient {
    http: reqwest::Client,
    cache: Arc<dyn JsonCache>,
    base_url: String,
    variant_limit: u32,
    search_ttl: Duration,
    work_ttl: Duration,
}

impl OpenLibraryClient {
    pub fn new(
        cache: Arc<dyn JsonCache>,
        base_url: &str,
        timeout: Duration,
        variant_limit: u32,
        search_ttl: Duration,
        work_ttl: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            cache,
            base_url: base_url.trim_end_matches('/').to_string(),
            variant_limit,
            search_ttl,
            work_ttl,
        })
    }
}

#[async_trait]
impl Catalog for OpenLibraryClient {
    async fn search(&self, variant: &SearchVariant) -> anyhow::Result<Vec<Value>> {
        let discriminator = sha256_hex(&format!(
            "{}|{}|{}",
            variant.q,
            variant.lang.as_deref().unwrap_or(""),
            self.variant_limit
        ));
        let key = cache::cache_key("ol:search", &discriminator);
        if let Some(page) = cache::get_json::<Value>(self.cache.as_ref(), &key).await {
            telemetry::record_cache_hit("ol_search");
            return Ok(docs_of(&page));
        }
        telemetry::record_cache_miss("ol_search");

        let url = format!("{}/search.json", self.base_url);
        let mut params: Vec<(&str, String)> = vec![
            ("q", variant.q.clone()),
            ("fields", SEARCH_FIELDS.to_string()),
            ("limit", self.variant_limit.to_string()),
        ];
        if let Some(lang) = &variant.lang {
            params.push(("lang", lang.clone()));
        }
        let page: Value = self
            .http
            .get(&url)
            .query(&params)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        cache::set_json(self.cache.as_ref(), &key, &page, self.search_ttl).await;
        Ok(docs_of(&page))
    }

    async fn work_detail(&self, work_key: &str) -> anyhow::Result<Option<WorkDetail>> {
        let key = cache::cache_key("ol:work", work_key);
        if let Some(doc) = cache::get_json::<Value>(self.cache.as_ref(), &key).await {
            telemetry::record_cache_hit("work");
            return Ok(match doc {
                Value::Null => None,
                other => Some(WorkDetail::from_value(&other)),
            });
        }
        telemetry::record_cache_miss("work");

        let url = format!("{}{}.json", self.base_url, work_key);
        // A failed detail call is cached as null: one flaky work must not be
        // re-fetched on every request for a day.
        let doc: Value = match self.http.get(&url).send().await {
            Ok(resp) => match resp.error_for_status() {
                Ok(resp) => resp.json().await.unwrap_or(Value::Null),
                Err(e) => {
                    debug!(work_key, error = %e, "work detail fetch rejected");
                    Value::Null
                }
            },
            Err(e) => {
                debug!(work_key, error = %e, "work detail fetch failed");
                Value::Null
            }
        };

        cache::set_json(self.cache.as_ref(), &key, &doc, self.work_ttl).await;
        Ok(match doc {
            Value::Null => None,
            other => Some(WorkDetail::from_value(&other)),
        })
    }
}

fn docs_of(page: &Value) -> Vec<Value> {
    page.get("docs")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Drives the fan-out across variants and the bounded enrichment pass.
pub struct CatalogFetcher {
    catalog: Arc<dyn Catalog>,
    enrich_top: usize,
    enrich_concurrency: usize,
}

impl CatalogFetcher {
    pub fn new(catalog: Arc<dyn Catalog>, enrich_top: usize, enrich_concurrency: usize) -> Self {
        Self {
            catalog,
            enrich_top,
            enrich_concurrency,
        }
    }

    /// Run all variants concurrently and deduplicate the returned documents
    /// by canonical work key, preserving first-seen order. A single
    /// variant's failure shrinks the result set, nothing more.
    pub async fn fetch_docs(&self, variants: &[SearchVariant]) -> Vec<RawDoc> {
        let results = join_all(variants.iter().map(|v| self.catalog.search(v))).await;

        let mut seen = HashSet::new();
        let mut docs = Vec::new();
        for (variant, result) in variants.iter().zip(results) {
            let raw_docs = match result {
                Ok(d) => d,
                Err(e) => {
                    warn!(query = %variant.q, error = %e, "search variant failed");
                    continue;
                }
            };
            for raw in raw_docs {
                let summary: SummaryDoc =
                    serde_json::from_value(raw.clone()).unwrap_or_default();
                let Some(work_key) = canonical_work_key(&summary.key) else {
                    continue;
                };
                if seen.insert(work_key.clone()) {
                    docs.push(RawDoc {
                        work_key,
                        summary,
                        raw,
                    });
                }
            }
        }
        docs
    }

    /// Enrich the top slice of documents (arrival order, cost cutoff) with
    /// per-work detail calls, at most `enrich_concurrency` in flight.
    pub async fn enrich(&self, docs: Vec<RawDoc>) -> Vec<BookRecord> {
        stream::iter(docs.into_iter().take(self.enrich_top))
            .map(|doc| {
                let catalog = Arc::clone(&self.catalog);
                async move {
                    let detail = match catalog.work_detail(&doc.work_key).await {
                        Ok(d) => d,
                        Err(e) => {
                            warn!(work_key = %doc.work_key, error = %e, "enrichment failed");
                            None
                        }
                    };
                    map_record(doc, detail)
                }
            })
            .buffered(self.enrich_concurrency.max(1))
            .collect()
            .await
    }
}

/// Merge a summary document and its optional detail into a persistable
/// record. Detail wins for description and subjects; the summary's language
/// list wins when present (the search endpoint's codes are already short).
pub fn map_record(doc: RawDoc, detail: Option<WorkDetail>) -> BookRecord {
    let detail = detail.unwrap_or_default();
    let languages = if doc.summary.language.is_empty() {
        detail.languages
    } else {
        doc.summary.language.clone()
    };
    let subjects = if detail.subjects.is_empty() {
        doc.summary.subject.clone()
    } else {
        detail.subjects
    };
    BookRecord {
        work_key: doc.work_key,
        title: doc.summary.title.clone(),
        authors: doc.summary.author_name.clone(),
        first_publish_year: doc.summary.first_publish_year,
        languages,
        subjects,
        description: detail.description,
        cover_id: doc.summary.cover_i,
        has_fulltext: doc.summary.has_fulltext,
        public_scan: doc.summary.public_scan_b,
        ia: doc.summary.ia.clone(),
        metadata: doc.raw,
    }
}
