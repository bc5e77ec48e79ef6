//! Chat-model seam: structured query expansion, translation, and relevance
//! scoring.
//!
//! Every payload that crosses this boundary gets an explicit schema with
//! serde defaults. Model output is untrusted: missing fields become empty,
//! unparseable JSON becomes an error the caller degrades on, and list
//! bounds are enforced by the caller regardless of what came back.

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs, ResponseFormat,
};
use async_openai::Client;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const EXTRACT_SYSTEM_PROMPT: &str = "Extract book search hints from a vague user query. \
Return JSON {\"primaryQuery\":string,\"titleHints\":string[],\"authorHints\":string[],\"keywords\":string[]}";

const TRANSLATE_SYSTEM_PROMPT: &str = "Translate to English, return only the translation.";

const RERANK_SYSTEM_PROMPT: &str = "You are a ranking model. Score each item for how well it \
matches the user's intent. Return JSON {\"rank\":[{\"work_key\":string,\"score\":number}]}.";

/// Raw extraction payload, before clamping.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawIntent {
    #[serde(rename = "primaryQuery", default)]
    pub primary_query: Option<String>,
    #[serde(rename = "titleHints", default)]
    pub title_hints: Vec<String>,
    #[serde(rename = "authorHints", default)]
    pub author_hints: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// One candidate sent to the scoring model.
#[derive(Debug, Clone, Serialize)]
pub struct RerankItem {
    pub work_key: String,
    pub text: String,
}

/// One score returned by the scoring model.
#[derive(Debug, Clone, Deserialize)]
pub struct RerankScore {
    #[serde(default)]
    pub work_key: String,
    #[serde(default)]
    pub score: f64,
}

#[derive(Debug, Deserialize)]
struct RerankPayload {
    #[serde(default)]
    rank: Vec<RerankScore>,
}

#[derive(Serialize)]
struct RerankPrompt<'a> {
    query: &'a str,
    items: &'a [RerankItem],
}

/// The three call shapes the pipeline needs from a chat model. Optional and
/// latency-risky by contract; callers must treat every error as a quality
/// degradation, never a failure.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Structured-extraction call for query expansion.
    async fn extract_intent(&self, query: &str) -> anyhow::Result<RawIntent>;

    /// Translate free text to English, returning the bare translation.
    async fn translate_to_english(&self, text: &str) -> anyhow::Result<String>;

    /// Score a small candidate list against a query.
    async fn score_relevance(
        &self,
        query: &str,
        items: &[RerankItem],
    ) -> anyhow::Result<Vec<RerankScore>>;
}

/// OpenAI chat completions client.
pub struct OpenAiChatModel {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiChatModel {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            client: Client::with_config(OpenAIConfig::new().with_api_key(api_key)),
            model: model.to_string(),
        }
    }

    async fn complete(
        &self,
        system: &str,
        user: String,
        temperature: f32,
        json_mode: bool,
    ) -> anyhow::Result<String> {
        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&self.model)
            .temperature(temperature)
            .messages([
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system)
                    .build()?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(user)
                    .build()?
                    .into(),
            ]);
        if json_mode {
            builder.response_format(ResponseFormat::JsonObject);
        }
        let response = self.client.chat().create(builder.build()?).await?;
        response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| anyhow::anyhow!("chat completion returned no content"))
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn extract_intent(&self, query: &str) -> anyhow::Result<RawIntent> {
        let content = self
            .complete(EXTRACT_SYSTEM_PROMPT, format!("Query: {query}"), 0.2, true)
            .await?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn translate_to_english(&self, text: &str) -> anyhow::Result<String> {
        let content = self
            .complete(TRANSLATE_SYSTEM_PROMPT, text.to_string(), 0.2, false)
            .await?;
        Ok(content.trim().to_string())
    }

    async fn score_relevance(
        &self,
        query: &str,
        items: &[RerankItem],
    ) -> anyhow::Result<Vec<RerankScore>> {
        let user = serde_json::to_string(&RerankPrompt { query, items })?;
        let content = self.complete(RERANK_SYSTEM_PROMPT, user, 0.0, true).await?;
        let payload: RerankPayload = serde_json::from_str(&content)?;
        Ok(payload.rank)
    }
}
