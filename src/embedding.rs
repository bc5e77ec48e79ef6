//! Embedding provider seam.

use async_openai::config::OpenAIConfig;
use async_openai::types::CreateEmbeddingRequestArgs;
use async_openai::Client;
use async_trait::async_trait;

/// Batch text-to-vector provider.
///
/// The provider may be entirely absent at runtime; callers hold an
/// `Option<Arc<dyn Embedder>>` and degrade to text-only scoring without it.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

/// OpenAI embeddings client. The requested dimensionality must match the
/// index's vector column; it is sent with every request so the provider can
/// never return vectors of another width.
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
    dimensions: u32,
}

impl OpenAiEmbedder {
    pub fn new(api_key: &str, model: &str, dimensions: usize) -> Self {
        Self {
            client: Client::with_config(OpenAIConfig::new().with_api_key(api_key)),
            model: model.to_string(),
            dimensions: dimensions as u32,
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(texts.to_vec())
            .dimensions(self.dimensions)
            .build()?;
        let response = self.client.embeddings().create(request).await?;
        let mut out: Vec<(u32, Vec<f32>)> = response
            .data
            .into_iter()
            .map(|d| (d.index, d.embedding))
            .collect();
        // The API documents input order but indexes each item; sort to be safe.
        out.sort_by_key(|(i, _)| *i);
        Ok(out.into_iter().map(|(_, v)| v).collect())
    }
}
