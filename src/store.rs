//! The persisted index: trait, Postgres implementation, and the ANALYZE
//! throttle.
//!
//! The table carries both a pgvector embedding column (ivfflat, cosine) and
//! a tsvector column maintained by a server-side trigger, so the text index
//! can never drift from the row content regardless of which writer touched
//! it. Schema creation is idempotent and runs on every boot.

use async_trait::async_trait;
use pgvector::Vector;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_postgres::types::ToSql;

use crate::error::StoreError;
use crate::model::BookRecord;

/// Per-key state used to decide re-embedding eligibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingState {
    pub content_hash: String,
    pub has_embedding: bool,
}

/// A record ready to be written, with its precomputed hash and an optional
/// fresh embedding. `embedding: None` must never clobber a stored vector.
#[derive(Debug, Clone)]
pub struct IndexRow {
    pub record: BookRecord,
    pub content_hash: String,
    pub embedding: Option<Vec<f32>>,
}

/// One row returned by a scan, with that scan's score.
#[derive(Debug, Clone)]
pub struct ScanRow {
    pub record: BookRecord,
    pub score: f64,
}

/// Contract for the vector + full-text index. Upsert-by-key is the only
/// write path; both scans are independent and bounded.
#[async_trait]
pub trait BookIndex: Send + Sync {
    /// Create extension, table, trigger and indexes. Safe on every boot.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Content hash and embedding presence for the given keys. Missing keys
    /// are simply absent from the map.
    async fn embedding_state(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, EmbeddingState>, StoreError>;

    /// Multi-row upsert. On conflict all scalar/array/JSON fields are
    /// overwritten; the embedding only when a fresh one is present.
    async fn upsert_rows(&self, rows: &[IndexRow]) -> Result<(), StoreError>;

    /// Nearest-neighbour scan by cosine similarity, rows with embeddings only.
    async fn vector_scan(&self, embedding: &[f32], k: i64) -> Result<Vec<ScanRow>, StoreError>;

    /// Full-text scan; rows not matching the query are excluded, not scored
    /// zero.
    async fn text_scan(&self, query: &str, k: i64) -> Result<Vec<ScanRow>, StoreError>;

    /// Refresh planner statistics on the index table.
    async fn analyze(&self) -> Result<(), StoreError>;
}

/// Best-effort throttle for `ANALYZE` runs after batch writes. A race
/// between two concurrent batches is a harmless duplicate pass, so this is
/// a timestamp check, not a mutual-exclusion lock.
pub struct AnalyzeThrottle {
    min_interval: Duration,
    last_run: Mutex<Option<Instant>>,
}

impl AnalyzeThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_run: Mutex::new(None),
        }
    }

    /// True when enough time has passed since the last acquisition; marks
    /// the run as taken.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut last) = self.last_run.lock() else {
            return false;
        };
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev) < self.min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Forget the last run. Test hook.
    pub fn reset(&self) {
        if let Ok(mut last) = self.last_run.lock() {
            *last = None;
        }
    }
}

const SELECT_COLUMNS: &str = "work_key, title, authors, first_publish_year, languages, \
subjects, description, cover_id, has_fulltext, public_scan, ia";

/// Postgres-backed index over a deadpool connection pool.
pub struct PgBookIndex {
    pool: deadpool_postgres::Pool,
    dimensions: usize,
}

impl PgBookIndex {
    pub fn new(pool: deadpool_postgres::Pool, dimensions: usize) -> Self {
        Self { pool, dimensions }
    }

    fn schema_sql(&self) -> String {
        format!(
            r#"
CREATE EXTENSION IF NOT EXISTS vector;
CREATE TABLE IF NOT EXISTS books (
    work_key TEXT PRIMARY KEY,
    title TEXT,
    authors TEXT[] NOT NULL DEFAULT '{{}}',
    first_publish_year INT,
    languages TEXT[] NOT NULL DEFAULT '{{}}',
    subjects TEXT[] NOT NULL DEFAULT '{{}}',
    description TEXT,
    cover_id INT,
    has_fulltext BOOLEAN NOT NULL DEFAULT FALSE,
    public_scan BOOLEAN NOT NULL DEFAULT FALSE,
    ia TEXT[] NOT NULL DEFAULT '{{}}',
    metadata JSONB,
    content_hash TEXT,
    embedding VECTOR({dims})
);
DO $$ BEGIN
    CREATE INDEX books_embedding_idx ON books
        USING ivfflat (embedding vector_cosine_ops) WITH (lists = 100);
EXCEPTION WHEN duplicate_table THEN NULL; END $$;
ALTER TABLE books ADD COLUMN IF NOT EXISTS tsv tsvector;
CREATE OR REPLACE FUNCTION books_tsv_update() RETURNS trigger AS $$
BEGIN
    NEW.tsv := to_tsvector('simple',
        coalesce(NEW.title, '') || ' ' ||
        array_to_string(NEW.authors, ' ') || ' ' ||
        coalesce(NEW.description, '') || ' ' ||
        array_to_string(NEW.subjects, ' ')
    );
    RETURN NEW;
END
$$ LANGUAGE plpgsql;
DO $$ BEGIN
    CREATE TRIGGER books_tsv_trg
        BEFORE INSERT OR UPDATE ON books
        FOR EACH ROW EXECUTE FUNCTION books_tsv_update();
EXCEPTION WHEN duplicate_object THEN NULL; END $$;
CREATE INDEX IF NOT EXISTS books_tsv_idx ON books USING gin (tsv);
"#,
            dims = self.dimensions
        )
    }
}

fn record_of(row: &tokio_postgres::Row) -> BookRecord {
    BookRecord {
        work_key: row.get("work_key"),
        title: row.get("title"),
        authors: row.get("authors"),
        first_publish_year: row.get("first_publish_year"),
        languages: row.get("languages"),
        subjects: row.get("subjects"),
        description: row.get("description"),
        cover_id: row.get("cover_id"),
        has_fulltext: row.get("has_fulltext"),
        public_scan: row.get("public_scan"),
        ia: row.get("ia"),
        metadata: serde_json::Value::Null,
    }
}

#[async_trait]
impl BookIndex for PgBookIndex {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client.batch_execute(&self.schema_sql()).await?;
        Ok(())
    }

    async fn embedding_state(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, EmbeddingState>, StoreError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let client = self.pool.get().await?;
        let key_list = keys.to_vec();
        let rows = client
            .query(
                "SELECT work_key, content_hash, (embedding IS NOT NULL) AS has_embedding \
                 FROM books WHERE work_key = ANY($1)",
                &[&key_list],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let key: String = row.get("work_key");
                let state = EmbeddingState {
                    content_hash: row
                        .get::<_, Option<String>>("content_hash")
                        .unwrap_or_default(),
                    has_embedding: row.get("has_embedding"),
                };
                (key, state)
            })
            .collect())
    }

    async fn upsert_rows(&self, rows: &[IndexRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        const COLS: usize = 14;
        let placeholders: Vec<String> = (0..rows.len())
            .map(|i| {
                let ps: Vec<String> = (1..=COLS).map(|j| format!("${}", i * COLS + j)).collect();
                format!("({})", ps.join(","))
            })
            .collect();
        let sql = format!(
            "INSERT INTO books (work_key, title, authors, first_publish_year, languages, \
             subjects, description, cover_id, has_fulltext, public_scan, ia, metadata, \
             content_hash, embedding) VALUES {} \
             ON CONFLICT (work_key) DO UPDATE SET \
             title = EXCLUDED.title, authors = EXCLUDED.authors, \
             first_publish_year = EXCLUDED.first_publish_year, \
             languages = EXCLUDED.languages, subjects = EXCLUDED.subjects, \
             description = EXCLUDED.description, cover_id = EXCLUDED.cover_id, \
             has_fulltext = EXCLUDED.has_fulltext, public_scan = EXCLUDED.public_scan, \
             ia = EXCLUDED.ia, metadata = EXCLUDED.metadata, \
             content_hash = EXCLUDED.content_hash, \
             embedding = COALESCE(EXCLUDED.embedding, books.embedding)",
            placeholders.join(",")
        );

        let vectors: Vec<Option<Vector>> = rows
            .iter()
            .map(|r| r.embedding.clone().map(Vector::from))
            .collect();
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(rows.len() * COLS);
        for (row, vector) in rows.iter().zip(vectors.iter()) {
            params.push(&row.record.work_key);
            params.push(&row.record.title);
            params.push(&row.record.authors);
            params.push(&row.record.first_publish_year);
            params.push(&row.record.languages);
            params.push(&row.record.subjects);
            params.push(&row.record.description);
            params.push(&row.record.cover_id);
            params.push(&row.record.has_fulltext);
            params.push(&row.record.public_scan);
            params.push(&row.record.ia);
            params.push(&row.record.metadata);
            params.push(&row.content_hash);
            params.push(vector);
        }

        let client = self.pool.get().await?;
        client.execute(&sql, &params).await?;
        Ok(())
    }

    async fn vector_scan(&self, embedding: &[f32], k: i64) -> Result<Vec<ScanRow>, StoreError> {
        let client = self.pool.get().await?;
        let vector = Vector::from(embedding.to_vec());
        let sql = format!(
            "SELECT {SELECT_COLUMNS}, 1 - (embedding <=> $1) AS score \
             FROM books WHERE embedding IS NOT NULL \
             ORDER BY embedding <=> $1 LIMIT $2"
        );
        let rows = client.query(&sql, &[&vector, &k]).await?;
        Ok(rows
            .iter()
            .map(|row| ScanRow {
                record: record_of(row),
                score: row.get("score"),
            })
            .collect())
    }

    async fn text_scan(&self, query: &str, k: i64) -> Result<Vec<ScanRow>, StoreError> {
        let client = self.pool.get().await?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS}, \
             ts_rank(tsv, plainto_tsquery('simple', $1))::float8 AS score \
             FROM books WHERE tsv @@ plainto_tsquery('simple', $1) \
             ORDER BY score DESC LIMIT $2"
        );
        let rows = client.query(&sql, &[&query, &k]).await?;
        Ok(rows
            .iter()
            .map(|row| ScanRow {
                record: record_of(row),
                score: row.get("score"),
            })
            .collect())
    }

    async fn analyze(&self) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client.batch_execute("ANALYZE books").await?;
        Ok(())
    }
}

/// Build a connection pool from a Postgres URL.
pub fn build_pool(database_url: &str, max_size: usize) -> anyhow::Result<deadpool_postgres::Pool> {
    let pg_config: tokio_postgres::Config = database_url.parse()?;
    let manager = deadpool_postgres::Manager::from_config(
        pg_config,
        tokio_postgres::NoTls,
        deadpool_postgres::ManagerConfig {
            recycling_method: deadpool_postgres::RecyclingMethod::Fast,
        },
    );
    Ok(deadpool_postgres::Pool::builder(manager)
        .max_size(max_size)
        .build()?)
}
