use async_trait::async_trait;

use crate::types::{CompletionRequest, CompletionResponse, CompletionStream, ProviderCapabilities};
use crate::LLMError;

pub mod scripted;

/// The LLM client capability agents and LLM-backed metrics are built on.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError>;

    async fn stream_completion(
        &self,
        _request: CompletionRequest,
    ) -> Result<CompletionStream, LLMError> {
        Err(LLMError::Unsupported("streaming completions"))
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::default()
    }

    fn name(&self) -> &'static str;
}
