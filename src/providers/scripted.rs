use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    functions::{FunctionCall, ToolCall},
    providers::LLMProvider,
    types::{
        ChatMessage, CompletionRequest, CompletionResponse, CompletionStream,
        ProviderCapabilities, StreamEvent, TokenUsage,
    },
    LLMError,
};

/// One canned provider reply.
#[derive(Debug, Clone, Default)]
pub struct ScriptedResponse {
    text: Option<String>,
    tool_calls: Vec<(String, Value)>,
    usage: Option<TokenUsage>,
    delay: Option<Duration>,
    error: Option<String>,
}

impl ScriptedResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn tool_use(name: impl Into<String>, input: Value) -> Self {
        Self::default().with_tool_call(name, input)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_tool_call(mut self, name: impl Into<String>, input: Value) -> Self {
        self.tool_calls.push((name.into(), input));
        self
    }

    pub fn with_usage(mut self, prompt_tokens: u32, completion_tokens: u32) -> Self {
        self.usage = Some(TokenUsage::new(prompt_tokens, completion_tokens));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Provider that replays a queue of canned responses and fails once it runs dry.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    tool_call_counter: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let provider = Self::new();
        for text in texts {
            provider.push(ScriptedResponse::text(text));
        }
        provider
    }

    pub fn with_response(self, response: ScriptedResponse) -> Self {
        self.push(response);
        self
    }

    pub fn push(&self, response: ScriptedResponse) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(response);
    }

    pub fn remaining(&self) -> usize {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn next_response(&self) -> Result<CompletionResponse, LLMError> {
        let next = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let scripted = next.ok_or(LLMError::Exhausted)?;

        if let Some(delay) = scripted.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = scripted.error {
            return Err(LLMError::Provider(message));
        }

        let tool_calls = scripted
            .tool_calls
            .into_iter()
            .map(|(name, input)| {
                let index = self.tool_call_counter.fetch_add(1, Ordering::Relaxed);
                ToolCall::new(FunctionCall::new(name, input)).with_id(format!("tooluse_{index}"))
            })
            .collect();

        let mut message = ChatMessage::assistant(scripted.text.unwrap_or_default());
        message.tool_calls = tool_calls;

        Ok(CompletionResponse {
            message,
            usage: scripted.usage,
        })
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        self.next_response().await
    }

    async fn stream_completion(
        &self,
        _request: CompletionRequest,
    ) -> Result<CompletionStream, LLMError> {
        let response = self.next_response().await?;
        let fragments: Vec<String> = response
            .message
            .text()
            .unwrap_or_default()
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();

        Ok(Box::pin(async_stream::stream! {
            for fragment in fragments {
                yield Ok(StreamEvent::MessageDelta(fragment));
            }
            yield Ok(StreamEvent::Completed(response));
        }))
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::new(true)
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
