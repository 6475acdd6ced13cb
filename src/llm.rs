use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ollama_rs::{
    generation::completion::request::GenerationRequest,
    generation::embeddings::request::{EmbeddingsInput, GenerateEmbeddingsRequest},
    Ollama,
};
use tracing::debug;

/// Model-provider seam for every prompt-driven step (intent classification,
/// filter extraction, SQL generation, answer generation) and for embeddings.
/// The pipeline only ever talks to this trait, so the provider can be swapped
/// without touching the orchestrator.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, prompt: &str, request_id: &str) -> Result<String>;
    async fn embed(&self, text: &str, request_id: &str) -> Result<Vec<f32>>;
}

/// Ollama-backed implementation.
pub struct OllamaModel {
    client: Ollama,
    completion_model: String,
    embedding_model: String,
}

impl OllamaModel {
    pub fn new(url: &str, completion_model: &str, embedding_model: &str) -> Result<Self> {
        Ok(Self {
            client: Ollama::try_new(url)?,
            completion_model: completion_model.to_string(),
            embedding_model: embedding_model.to_string(),
        })
    }
}

#[async_trait]
impl LanguageModel for OllamaModel {
    async fn generate(&self, prompt: &str, request_id: &str) -> Result<String> {
        debug!(
            request_id,
            model = %self.completion_model,
            "sending completion request"
        );
        let response = self
            .client
            .generate(GenerationRequest::new(
                self.completion_model.clone(),
                prompt.to_string(),
            ))
            .await?;
        Ok(response.response)
    }

    async fn embed(&self, text: &str, request_id: &str) -> Result<Vec<f32>> {
        debug!(
            request_id,
            model = %self.embedding_model,
            "sending embedding request"
        );
        let response = self
            .client
            .generate_embeddings(GenerateEmbeddingsRequest::new(
                self.embedding_model.clone(),
                EmbeddingsInput::Single(text.to_string()),
            ))
            .await?;
        response
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("embedding service returned no vectors"))
    }
}
