//! Hybrid book search: a retrieval-augmented query pipeline over a
//! PostgreSQL vector + full-text index, fed by the OpenLibrary catalog.
//!
//! A request flows one direction:
//!
//! ```text
//! raw query -> normalize -> response cache check -> DB short-circuit
//!           -> [expand -> OpenLibrary fetch -> enrich -> upsert]
//!           -> hybrid retrieval -> rerank -> response
//! ```
//!
//! Every external collaborator (Redis, Postgres, OpenAI, OpenLibrary) sits
//! behind a trait so the pipeline can run against in-memory fakes in tests.
//! Apart from Postgres, every dependency is optional at runtime: losing one
//! degrades result quality, never availability.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod embedding;
pub mod error;
pub mod expand;
pub mod http;
pub mod ingest;
pub mod llm;
pub mod model;
pub mod pipeline;
pub mod query;
pub mod rerank;
pub mod retrieve;
pub mod store;
pub mod telemetry;

pub use config::AppConfig;
pub use error::{SearchError, StoreError};
pub use model::{BookRecord, QueryIntent, RankedCandidate, SearchResponse};
pub use pipeline::{SearchPipeline, SearchRequest};
