//! End-to-end pipeline tests against in-memory collaborators.

#![allow(clippy::unwrap_used)]

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use booksearch::cache::{JsonCache, MemoryCache};
use booksearch::catalog::{Catalog, CatalogFetcher};
use booksearch::embedding::Embedder;
use booksearch::expand::QueryExpander;
use booksearch::ingest::Indexer;
use booksearch::llm::{ChatModel, RawIntent};
use booksearch::model::BookRecord;
use booksearch::pipeline::{PipelineConfig, SearchPipeline, SearchRequest};
use booksearch::rerank::Reranker;
use booksearch::retrieve::HybridRetriever;
use booksearch::store::{AnalyzeThrottle, BookIndex, IndexRow};
use booksearch::SearchError;

use common::{MemoryIndex, MockCatalog, MockChatModel, MockEmbedder};

struct Harness {
    cache: Arc<MemoryCache>,
    index: Arc<MemoryIndex>,
    embedder: Arc<MockEmbedder>,
    model: Arc<MockChatModel>,
    catalog: Arc<MockCatalog>,
    pipeline: SearchPipeline,
}

fn harness(model: MockChatModel, catalog: MockCatalog) -> Harness {
    let cache = Arc::new(MemoryCache::new());
    let index = Arc::new(MemoryIndex::new());
    let embedder = Arc::new(MockEmbedder::new());
    let model = Arc::new(model);
    let catalog = Arc::new(catalog);

    let dyn_cache: Arc<dyn JsonCache> = cache.clone();
    let dyn_index: Arc<dyn BookIndex> = index.clone();
    let dyn_embedder: Arc<dyn Embedder> = embedder.clone();
    let dyn_model: Arc<dyn ChatModel> = model.clone();
    let dyn_catalog: Arc<dyn Catalog> = catalog.clone();

    let pipeline = SearchPipeline::new(
        dyn_cache.clone(),
        QueryExpander::new(
            Some(dyn_model.clone()),
            dyn_cache.clone(),
            Duration::from_secs(86_400),
        ),
        CatalogFetcher::new(dyn_catalog, 80, 8),
        Indexer::new(
            dyn_index.clone(),
            Some(dyn_embedder.clone()),
            Arc::new(AnalyzeThrottle::new(Duration::from_secs(120))),
            64,
        ),
        HybridRetriever::new(
            dyn_index,
            Some(dyn_embedder),
            dyn_cache.clone(),
            3,
            2,
            Duration::from_secs(86_400),
        ),
        Reranker::new(
            Some(dyn_model),
            dyn_cache,
            true,
            Duration::from_secs(2),
            30,
            15,
            Duration::from_secs(86_400),
        ),
        PipelineConfig {
            shortcircuit_min_text_ratio: 0.4,
            max_variants: 6,
            response_ttl: Duration::from_secs(900),
            catalog_base: "https://openlibrary.org".into(),
            covers_base: "https://covers.openlibrary.org".into(),
        },
    );

    Harness {
        cache,
        index,
        embedder,
        model,
        catalog,
        pipeline,
    }
}

fn req(q: &str, limit: usize, lang: Option<&str>) -> SearchRequest {
    SearchRequest {
        q: q.to_string(),
        limit,
        lang: lang.map(str::to_string),
    }
}

fn summary_doc(key: &str, title: &str, author: &str) -> Value {
    json!({
        "key": format!("/works/{key}"),
        "title": title,
        "author_name": [author],
        "first_publish_year": 1954,
        "language": ["eng"],
        "cover_i": 1,
        "has_fulltext": true,
        "public_scan_b": false,
    })
}

fn tolkien_docs() -> Vec<Value> {
    vec![
        summary_doc("OL1W", "The Lord of the Rings", "J. R. R. Tolkien"),
        summary_doc("OL2W", "The Hobbit", "J. R. R. Tolkien"),
        summary_doc("OL3W", "Dune", "Frank Herbert"),
    ]
}

fn intent(primary: &str) -> RawIntent {
    RawIntent {
        primary_query: Some(primary.to_string()),
        title_hints: vec!["The Lord of the Rings".into()],
        author_hints: vec!["J. R. R. Tolkien".into()],
        keywords: vec!["fantasy".into()],
    }
}

fn stored_row(key: &str, title: &str, author: &str) -> IndexRow {
    let record = BookRecord {
        work_key: format!("/works/{key}"),
        title: Some(title.to_string()),
        authors: vec![author.to_string()],
        ..BookRecord::default()
    };
    let content_hash = record.content_hash();
    IndexRow {
        record,
        content_hash,
        embedding: None,
    }
}

#[tokio::test]
async fn empty_query_rejected_before_any_collaborator() {
    let mut model = MockChatModel::new();
    model.intent = Some(intent("tolkien ring"));
    let h = harness(model, MockCatalog::new(tolkien_docs()));

    let err = h.pipeline.run(&req("   ", 10, None)).await.unwrap_err();
    assert!(matches!(err, SearchError::InvalidRequest(_)));
    assert_eq!(h.catalog.search_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.model.extract_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.index.text_scans.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn out_of_range_limit_is_rejected() {
    let h = harness(MockChatModel::new(), MockCatalog::new(vec![]));
    assert!(h.pipeline.run(&req("tolkien", 0, None)).await.is_err());
    assert!(h.pipeline.run(&req("tolkien", 26, None)).await.is_err());
}

#[tokio::test]
async fn full_pipeline_ingests_and_ranks() {
    let mut model = MockChatModel::new();
    model.intent = Some(intent("tolkien ring"));
    let h = harness(model, MockCatalog::new(tolkien_docs()));

    let response = h.pipeline.run(&req("Tolkien Ring", 10, None)).await.unwrap();

    assert_eq!(response.query_used, "tolkien ring");
    assert_eq!(h.index.row_count(), 3);
    assert!(h.catalog.search_calls.load(Ordering::SeqCst) >= 1);
    assert_eq!(h.catalog.detail_calls.load(Ordering::SeqCst), 3);
    assert!(h.embedder.batches.load(Ordering::SeqCst) >= 1);

    assert!(!response.results.is_empty());
    assert_eq!(response.results[0].work_key, "/works/OL1W");
    assert!(response
        .results
        .iter()
        .any(|r| r.work_key == "/works/OL2W"));
    assert_eq!(response.suggestions.title_hints, vec!["The Lord of the Rings"]);
    assert_eq!(response.suggestions.author_hints, vec!["J. R. R. Tolkien"]);
    assert_eq!(
        response.results[0].openlibrary_url,
        "https://openlibrary.org/works/OL1W"
    );
    assert_eq!(
        response.results[0].cover_url.as_deref(),
        Some("https://covers.openlibrary.org/b/id/1-L.jpg")
    );
}

#[tokio::test]
async fn well_covered_query_never_touches_external_services() {
    let mut model = MockChatModel::new();
    model.intent = Some(intent("tolkien"));
    let h = harness(model, MockCatalog::new(tolkien_docs()));
    h.index.seed(vec![
        stored_row("OL10W", "The Silmarillion", "J. R. R. Tolkien"),
        stored_row("OL11W", "Unfinished Tales", "J. R. R. Tolkien"),
        stored_row("OL12W", "The Children of Hurin", "J. R. R. Tolkien"),
    ]);

    let response = h.pipeline.run(&req("tolkien", 2, None)).await.unwrap();

    assert_eq!(response.results.len(), 2);
    assert_eq!(h.catalog.search_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.model.extract_calls.load(Ordering::SeqCst), 0);
    assert!(response.suggestions.title_hints.is_empty());
    assert_eq!(response.query_used, "tolkien");
}

#[tokio::test]
async fn sparse_index_still_goes_to_the_catalog() {
    let mut model = MockChatModel::new();
    model.intent = Some(intent("tolkien ring"));
    let h = harness(model, MockCatalog::new(tolkien_docs()));
    // One matching row cannot satisfy limit 5.
    h.index
        .seed(vec![stored_row("OL10W", "The Silmarillion", "J. R. R. Tolkien")]);

    h.pipeline.run(&req("tolkien ring", 5, None)).await.unwrap();
    assert!(h.catalog.search_calls.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn repeated_request_is_served_from_the_response_cache() {
    let mut model = MockChatModel::new();
    model.intent = Some(intent("tolkien ring"));
    let h = harness(model, MockCatalog::new(tolkien_docs()));

    let first = h.pipeline.run(&req("tolkien ring", 10, None)).await.unwrap();
    let searches = h.catalog.search_calls.load(Ordering::SeqCst);
    let extracts = h.model.extract_calls.load(Ordering::SeqCst);
    let scans = h.index.text_scans.load(Ordering::SeqCst);
    let embeds = h.embedder.batches.load(Ordering::SeqCst);

    let second = h.pipeline.run(&req("tolkien ring", 10, None)).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.catalog.search_calls.load(Ordering::SeqCst), searches);
    assert_eq!(h.model.extract_calls.load(Ordering::SeqCst), extracts);
    assert_eq!(h.index.text_scans.load(Ordering::SeqCst), scans);
    assert_eq!(h.embedder.batches.load(Ordering::SeqCst), embeds);
}

#[tokio::test]
async fn limit_and_lang_discriminate_the_response_cache() {
    let mut model = MockChatModel::new();
    model.intent = Some(intent("tolkien ring"));
    let h = harness(model, MockCatalog::new(tolkien_docs()));

    h.pipeline.run(&req("tolkien ring", 10, None)).await.unwrap();
    let searches = h.catalog.search_calls.load(Ordering::SeqCst);

    h.pipeline.run(&req("tolkien ring", 5, None)).await.unwrap();
    assert!(h.catalog.search_calls.load(Ordering::SeqCst) > searches);
}

#[tokio::test]
async fn cache_outage_degrades_to_a_slower_request_not_a_failure() {
    let mut model = MockChatModel::new();
    model.intent = Some(intent("tolkien ring"));
    let h = harness(model, MockCatalog::new(tolkien_docs()));
    h.cache.set_failing(true);

    let first = h.pipeline.run(&req("tolkien ring", 10, None)).await.unwrap();
    let searches = h.catalog.search_calls.load(Ordering::SeqCst);
    let second = h.pipeline.run(&req("tolkien ring", 10, None)).await.unwrap();

    assert_eq!(first.query_used, second.query_used);
    // Nothing was cached, so the second request repeats the catalog work.
    assert!(h.catalog.search_calls.load(Ordering::SeqCst) > searches);
}

#[tokio::test]
async fn hebrew_query_is_translated_and_reported() {
    let mut model = MockChatModel::new();
    model.intent = Some(RawIntent {
        primary_query: Some("הארי פוטר".into()),
        ..RawIntent::default()
    });
    model.translation = Some("harry potter".into());
    let h = harness(
        model,
        MockCatalog::new(vec![summary_doc("OL20W", "Harry Potter", "J. K. Rowling")]),
    );

    let response = h.pipeline.run(&req("הארי פוטר", 10, None)).await.unwrap();

    assert_eq!(response.query_used, "harry potter");
    assert_eq!(h.model.translate_calls.load(Ordering::SeqCst), 1);
    assert!(!response.results.is_empty());
    assert_eq!(response.results[0].work_key, "/works/OL20W");
}

#[tokio::test]
async fn rtl_query_prefers_hebrew_editions_by_default() {
    let h = harness(MockChatModel::new(), MockCatalog::new(vec![]));
    // Two editions of the same work, identical text, differing only in
    // language. With no explicit lang parameter the Hebrew edition must win
    // on the language boost alone.
    let mut hebrew = stored_row("OL30W", "הארי פוטר ואבן החכמים", "J. K. Rowling");
    hebrew.record.languages = vec!["heb".into()];
    hebrew.content_hash = hebrew.record.content_hash();
    let mut english = stored_row("OL31W", "הארי פוטר ואבן החכמים", "J. K. Rowling");
    english.record.languages = vec!["eng".into()];
    english.content_hash = english.record.content_hash();
    h.index.seed(vec![english, hebrew]);

    let response = h.pipeline.run(&req("הארי פוטר", 2, None)).await.unwrap();

    assert_eq!(response.results.len(), 2);
    assert_eq!(response.results[0].work_key, "/works/OL30W");
    assert_eq!(response.results[0].languages, vec!["heb"]);
    // The index answered alone; the default preference never reached the
    // catalog or the chat model.
    assert_eq!(h.catalog.search_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.model.extract_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn explicit_lang_overrides_the_rtl_default() {
    let h = harness(MockChatModel::new(), MockCatalog::new(vec![]));
    let mut hebrew = stored_row("OL30W", "הארי פוטר ואבן החכמים", "J. K. Rowling");
    hebrew.record.languages = vec!["heb".into()];
    hebrew.content_hash = hebrew.record.content_hash();
    let mut english = stored_row("OL31W", "הארי פוטר ואבן החכמים", "J. K. Rowling");
    english.record.languages = vec!["eng".into()];
    english.content_hash = english.record.content_hash();
    h.index.seed(vec![hebrew, english]);

    let response = h
        .pipeline
        .run(&req("הארי פוטר", 2, Some("eng")))
        .await
        .unwrap();
    assert_eq!(response.results[0].work_key, "/works/OL31W");
}

#[tokio::test]
async fn reingesting_unchanged_records_skips_embedding() {
    let index = Arc::new(MemoryIndex::new());
    let embedder = Arc::new(MockEmbedder::new());
    let indexer = Indexer::new(
        index.clone() as Arc<dyn BookIndex>,
        Some(embedder.clone() as Arc<dyn Embedder>),
        Arc::new(AnalyzeThrottle::new(Duration::from_secs(120))),
        64,
    );

    let records = || {
        vec![
            stored_row("OL1W", "The Lord of the Rings", "J. R. R. Tolkien").record,
            stored_row("OL2W", "The Hobbit", "J. R. R. Tolkien").record,
        ]
    };

    assert_eq!(indexer.upsert(records()).await.unwrap(), 2);
    assert_eq!(embedder.texts_embedded.load(Ordering::SeqCst), 2);

    // Same content: both rows rewritten, neither re-embedded.
    assert_eq!(indexer.upsert(records()).await.unwrap(), 2);
    assert_eq!(embedder.texts_embedded.load(Ordering::SeqCst), 2);

    // One changed description: exactly one fresh embedding.
    let mut changed = records();
    changed[0].description = Some("There and back again, at length.".into());
    indexer.upsert(changed).await.unwrap();
    assert_eq!(embedder.texts_embedded.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn embedding_failure_preserves_the_stored_vector() {
    let index = Arc::new(MemoryIndex::new());
    let embedder = Arc::new(MockEmbedder::new());
    let indexer = Indexer::new(
        index.clone() as Arc<dyn BookIndex>,
        Some(embedder.clone() as Arc<dyn Embedder>),
        Arc::new(AnalyzeThrottle::new(Duration::from_secs(120))),
        64,
    );

    let original = stored_row("OL1W", "The Lord of the Rings", "J. R. R. Tolkien").record;
    indexer.upsert(vec![original.clone()]).await.unwrap();
    let before = index.row("/works/OL1W").unwrap();
    assert!(before.embedding.is_some());

    embedder.set_failing(true);
    let mut changed = original;
    changed.description = Some("A longer description.".into());
    let new_hash = changed.content_hash();
    indexer.upsert(vec![changed]).await.unwrap();

    let after = index.row("/works/OL1W").unwrap();
    // The row was rewritten, the stale-but-valid vector survived.
    assert_eq!(after.content_hash, new_hash);
    assert_eq!(after.embedding, before.embedding);
    assert_eq!(
        after.record.description.as_deref(),
        Some("A longer description.")
    );
}

#[tokio::test]
async fn analyze_runs_at_most_once_per_interval() {
    let index = Arc::new(MemoryIndex::new());
    let indexer = Indexer::new(
        index.clone() as Arc<dyn BookIndex>,
        None,
        Arc::new(AnalyzeThrottle::new(Duration::from_secs(3600))),
        64,
    );

    let records = || vec![stored_row("OL1W", "The Hobbit", "J. R. R. Tolkien").record];
    indexer.upsert(records()).await.unwrap();
    indexer.upsert(records()).await.unwrap();
    assert_eq!(index.analyze_runs.load(Ordering::SeqCst), 1);
}
