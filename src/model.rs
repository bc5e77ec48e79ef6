//! Core data shapes: the persisted book record, the per-request query
//! intent, ranked candidates, and the client-facing response.

use serde::{Deserialize, Serialize};

use crate::query::sha256_hex;

/// One unit of the persisted index, keyed by its canonical OpenLibrary work
/// key (`/works/OL...W`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookRecord {
    pub work_key: String,
    pub title: Option<String>,
    /// Author order reflects the external source, not alphabetical order.
    pub authors: Vec<String>,
    pub first_publish_year: Option<i32>,
    pub languages: Vec<String>,
    /// Free-text subject tags; unbounded cardinality, deduplication not
    /// guaranteed by the source.
    pub subjects: Vec<String>,
    pub description: Option<String>,
    pub cover_id: Option<i32>,
    pub has_fulltext: bool,
    pub public_scan: bool,
    /// Internet Archive identifiers, carried through for the client.
    pub ia: Vec<String>,
    /// Raw summary document as returned by the catalog. Traceability only,
    /// never used in ranking.
    pub metadata: serde_json::Value,
}

impl BookRecord {
    /// Text fed to the embedding model and hashed for change detection:
    /// title, authors, subjects, description and languages, newline-joined,
    /// empty parts skipped.
    pub fn doc_text(&self) -> String {
        let parts = [
            self.title.clone().unwrap_or_default(),
            self.authors.join(" "),
            self.subjects.join(" "),
            self.description.clone().unwrap_or_default(),
            self.languages.join(" "),
        ];
        parts
            .iter()
            .filter(|p| !p.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Digest over the textual fields. An unchanged hash means re-embedding
    /// can be skipped even when the row is rewritten for other fields.
    pub fn content_hash(&self) -> String {
        sha256_hex(&self.doc_text())
    }

    /// Derived cover image URL, when the record carries a cover id.
    pub fn cover_url(&self, covers_base: &str) -> Option<String> {
        self.cover_id
            .map(|id| format!("{covers_base}/b/id/{id}-L.jpg"))
    }

    /// Canonical catalog URL for the work.
    pub fn openlibrary_url(&self, catalog_base: &str) -> String {
        format!("{catalog_base}{}", self.work_key)
    }
}

/// Structured intent extracted from a raw query. Ephemeral: built fresh per
/// request or pulled whole from cache, never persisted past its TTL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryIntent {
    pub primary_query: String,
    /// Present only for non-Latin-script queries, filled by translation (or
    /// by the original text when translation was unavailable).
    pub english_query: Option<String>,
    pub title_hints: Vec<String>,
    pub author_hints: Vec<String>,
    pub keywords: Vec<String>,
}

impl QueryIntent {
    /// Identity transform: the pipeline must stay functional without the
    /// expansion provider.
    pub fn identity(query: &str, rtl: bool) -> Self {
        Self {
            primary_query: query.to_string(),
            english_query: rtl.then(|| query.to_string()),
            title_hints: Vec::new(),
            author_hints: Vec::new(),
            keywords: Vec::new(),
        }
    }

    /// The query string retrieval and reranking should use.
    pub fn best_query(&self) -> &str {
        self.english_query.as_deref().unwrap_or(&self.primary_query)
    }
}

/// A book plus its per-scan and composite scores. The list order produced by
/// the retriever is the contract; this carries no independent identity.
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub record: BookRecord,
    pub vector_score: f64,
    pub text_score: f64,
    pub score: f64,
}

/// Hint lists echoed back to the client; empty when the request was answered
/// from the index alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Suggestions {
    pub title_hints: Vec<String>,
    pub author_hints: Vec<String>,
    pub keywords: Vec<String>,
}

impl From<&QueryIntent> for Suggestions {
    fn from(intent: &QueryIntent) -> Self {
        Self {
            title_hints: intent.title_hints.clone(),
            author_hints: intent.author_hints.clone(),
            keywords: intent.keywords.clone(),
        }
    }
}

/// One result row in the client-facing payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultItem {
    pub work_key: String,
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub year: Option<i32>,
    pub languages: Vec<String>,
    pub subjects: Vec<String>,
    pub description: Option<String>,
    pub cover_url: Option<String>,
    pub openlibrary_url: String,
    pub has_fulltext: bool,
    pub public_scan: bool,
}

impl ResultItem {
    pub fn from_candidate(c: &RankedCandidate, catalog_base: &str, covers_base: &str) -> Self {
        let r = &c.record;
        Self {
            work_key: r.work_key.clone(),
            title: r.title.clone(),
            authors: r.authors.clone(),
            year: r.first_publish_year,
            languages: r.languages.clone(),
            subjects: r.subjects.clone(),
            description: r.description.clone(),
            cover_url: r.cover_url(covers_base),
            openlibrary_url: r.openlibrary_url(catalog_base),
            has_fulltext: r.has_fulltext,
            public_scan: r.public_scan,
        }
    }
}

/// The whole search response. Serializable both ways so it can live in the
/// response cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResponse {
    /// The query string actually used for retrieval (English variant when
    /// one was produced).
    pub query_used: String,
    pub suggestions: Suggestions,
    pub results: Vec<ResultItem>,
}
