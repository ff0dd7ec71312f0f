use crate::domain::ChatMessage;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            temperature: None,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("model provider unavailable: {0}")]
    Unavailable(String),
    #[error("model provider returned invalid response: {0}")]
    InvalidResponse(String),
}

/// Seam between the agent and whatever produces completions. Backends live
/// outside this crate; tests script one in-process.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        options: &CompletionOptions,
    ) -> Result<String, CompletionError>;

    /// Streaming variant. Backends that cannot stream fall back to a single
    /// chunk carrying the whole completion.
    async fn complete_stream(
        &self,
        messages: Vec<ChatMessage>,
        options: &CompletionOptions,
    ) -> Result<BoxStream<'static, Result<String, CompletionError>>, CompletionError> {
        let full = self.complete(messages, options).await?;
        Ok(stream::once(async move { Ok(full) }).boxed())
    }
}
