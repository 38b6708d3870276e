use std::{
    fmt,
    pin::Pin,
    sync::Arc,
    time::{Duration, Instant},
};

use async_stream::try_stream;
use async_trait::async_trait;
use futures_core::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::{
    functions::{FunctionRegistry, Tool, ToolCall, ToolChoice},
    history::{ConversationHistory, InMemoryConversationHistory},
    permute::Parameters,
    trace::{LlmRequest, LlmResponse, ToolRequest, ToolResponse, Trace},
    tracer::{InMemoryTracer, Tracer},
    types::{ChatMessage, CompletionRequest, CompletionResponse, StreamEvent},
    LLMError, LLMProvider,
};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("maximum successive tool invocations ({0}) reached")]
    MaxToolInvocationsReached(usize),
    #[error("invalid agent parameters: {0}")]
    InvalidParameters(String),
    #[error("provider stream ended without a completed response")]
    IncompleteStream,
    #[error(transparent)]
    Provider(#[from] LLMError),
    #[error("{0}")]
    Other(String),
}

/// Per-call overrides passed along with a user input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConverseOptions {
    /// Restricts the tools offered to the model; an empty list disables tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ConverseOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_tools() -> Self {
        Self {
            tools: Some(Vec::new()),
            ..Self::default()
        }
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

pub type ResponseStream<'a> = Pin<Box<dyn Stream<Item = Result<String, AgentError>> + Send + 'a>>;

/// An agent that holds exactly one conversation at a time.
#[async_trait]
pub trait ConversationalAgent: Send {
    fn conversation_id(&self) -> &str;

    fn set_conversation_id(&mut self, conversation_id: String);

    fn auth_context(&self) -> Option<&str> {
        None
    }

    fn set_auth_context(&mut self, _auth_context: Option<String>) {}

    fn messages(&self) -> Vec<ChatMessage>;

    /// Traces of the current conversation, in creation order.
    fn traces(&self) -> Vec<Trace>;

    /// Starts a new conversation with an empty history.
    fn reset(&mut self);

    async fn converse(&mut self, user_input: &str, options: &ConverseOptions) -> Result<String, AgentError>;

    /// Agents without native streaming yield the whole reply as a single fragment.
    fn converse_stream<'a>(
        &'a mut self,
        user_input: &'a str,
        options: &'a ConverseOptions,
    ) -> ResponseStream<'a> {
        Box::pin(try_stream! {
            let reply = self.converse(user_input, options).await?;
            yield reply;
        })
    }
}

pub fn new_conversation_id() -> String {
    Ulid::new().to_string()
}

/// Agent parameters as they arrive from a permutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolAgentConfig {
    pub model_id: String,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub max_successive_tool_invocations: Option<usize>,
}

impl ToolAgentConfig {
    pub fn from_parameters(parameters: &Parameters) -> Result<Self, AgentError> {
        serde_json::from_value(Value::Object(parameters.clone()))
            .map_err(|error| AgentError::InvalidParameters(error.to_string()))
    }
}

/// Reference agent: drives an [`LLMProvider`] and a tool registry, tracing
/// every LLM call and every tool invocation.
pub struct ToolAgent {
    name: String,
    model: String,
    instructions: Option<String>,
    provider: Arc<dyn LLMProvider>,
    functions: Option<Arc<FunctionRegistry>>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    max_successive_tool_invocations: usize,
    tracer: Arc<dyn Tracer>,
    history: Arc<dyn ConversationHistory>,
    conversation_id: String,
    auth_context: Option<String>,
}

impl fmt::Debug for ToolAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolAgent")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("provider", &self.provider.name())
            .field("has_functions", &self.functions.is_some())
            .field("conversation_id", &self.conversation_id)
            .finish()
    }
}

impl ToolAgent {
    pub fn new(name: impl Into<String>, provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            instructions: None,
            provider,
            functions: None,
            temperature: None,
            max_tokens: None,
            max_successive_tool_invocations: 10,
            tracer: Arc::new(InMemoryTracer::new()),
            history: Arc::new(InMemoryConversationHistory::new()),
            conversation_id: new_conversation_id(),
            auth_context: None,
        }
    }

    pub fn from_config(name: impl Into<String>, provider: Arc<dyn LLMProvider>, config: ToolAgentConfig) -> Self {
        let mut agent = Self::new(name, provider, config.model_id);
        agent.instructions = config.instructions;
        agent.temperature = config.temperature;
        agent.max_tokens = config.max_tokens;
        if let Some(max) = config.max_successive_tool_invocations {
            agent.max_successive_tool_invocations = max;
        }
        agent
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_function_registry(mut self, registry: Arc<FunctionRegistry>) -> Self {
        self.functions = Some(registry);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_max_successive_tool_invocations(mut self, max: usize) -> Self {
        self.max_successive_tool_invocations = max;
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn with_history(mut self, history: Arc<dyn ConversationHistory>) -> Self {
        self.history = history;
        self
    }

    fn offered_tools(&self, options: &ConverseOptions) -> Vec<Tool> {
        let Some(functions) = &self.functions else {
            return Vec::new();
        };
        let tools = functions.tools();
        match &options.tools {
            Some(allowed) => tools
                .into_iter()
                .filter(|tool| allowed.contains(&tool.function.name))
                .collect(),
            None => tools,
        }
    }

    fn build_request(&self, tools: &[Tool], options: &ConverseOptions) -> CompletionRequest {
        let history = self.messages();
        let mut messages = Vec::with_capacity(history.len() + 1);
        if let Some(instructions) = &self.instructions {
            messages.push(ChatMessage::system(instructions.clone()));
        }
        messages.extend(history);

        let mut request = CompletionRequest::new(self.model.clone(), messages);
        if let Some(max_tokens) = options.max_tokens.or(self.max_tokens) {
            request = request.with_max_tokens(max_tokens);
        }
        if let Some(temperature) = options.temperature.or(self.temperature) {
            request = request.with_temperature(temperature);
        }
        if !tools.is_empty() {
            request = request
                .with_tools(tools.iter().cloned())
                .with_tool_choice(ToolChoice::Auto);
        }
        request
    }

    fn record_message(&self, message: ChatMessage) {
        self.history
            .add_message(&self.conversation_id, self.auth_context.as_deref(), message);
    }

    fn record_trace(&self, trace: Trace) {
        let trace = trace
            .with_auth_context(self.auth_context.clone())
            .with_info("agent", Value::from(self.name.clone()));
        self.tracer.persist(trace);
    }

    /// Records the LLM call, runs requested tools, and returns the reply once
    /// the model stops asking for tools.
    async fn complete_step(
        &self,
        request: CompletionRequest,
        response: CompletionResponse,
        latency: Duration,
        tools: &[Tool],
    ) -> Option<String> {
        self.record_trace(Trace::llm(
            self.conversation_id.clone(),
            LlmRequest {
                model: request.model,
                messages: request.messages,
                tools: request.tools.into_iter().map(|tool| tool.function.name).collect(),
            },
            LlmResponse {
                message: response.message.clone(),
                usage: response.usage,
                latency_ms: millis(latency),
            },
        ));

        let tool_calls = response.message.tool_calls.clone();
        let reply = response.message.text().unwrap_or_default().to_string();
        self.record_message(response.message);

        if tool_calls.is_empty() {
            return Some(reply);
        }

        for (index, call) in tool_calls.iter().enumerate() {
            self.invoke_tool(call, index, tools).await;
        }
        None
    }

    async fn invoke_tool(&self, call: &ToolCall, index: usize, tools: &[Tool]) {
        let tool_use_id = call
            .id
            .clone()
            .unwrap_or_else(|| format!("{}_{index}", self.conversation_id));
        let offered = tools.iter().any(|tool| tool.function.name == call.function.name);

        let started = Instant::now();
        let result = match (&self.functions, offered) {
            (Some(functions), true) => functions.invoke(&call.function).await,
            _ => Err(LLMError::UnknownFunction(call.function.name.clone())),
        };
        let latency_ms = millis(started.elapsed());

        let (output, error, content) = match result {
            Ok(output) => {
                let content = match &output {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                (Some(output), None, content)
            }
            Err(error) => {
                tracing::debug!(tool = %call.function.name, %error, "tool invocation failed");
                (None, Some(error.to_string()), format!("Error: {error}"))
            }
        };

        self.record_trace(Trace::tool(
            self.conversation_id.clone(),
            ToolRequest {
                tool_name: call.function.name.clone(),
                tool_use_id: Some(tool_use_id.clone()),
                input: call.function.arguments.clone(),
            },
            ToolResponse {
                output,
                error,
                latency_ms,
            },
        ));
        self.record_message(ChatMessage::tool(tool_use_id, content));
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl ConversationalAgent for ToolAgent {
    fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    fn set_conversation_id(&mut self, conversation_id: String) {
        self.conversation_id = conversation_id;
    }

    fn auth_context(&self) -> Option<&str> {
        self.auth_context.as_deref()
    }

    fn set_auth_context(&mut self, auth_context: Option<String>) {
        self.auth_context = auth_context;
    }

    fn messages(&self) -> Vec<ChatMessage> {
        self.history
            .messages(&self.conversation_id, self.auth_context.as_deref())
    }

    fn traces(&self) -> Vec<Trace> {
        self.tracer
            .get_traces(&self.conversation_id, self.auth_context.as_deref())
    }

    fn reset(&mut self) {
        self.conversation_id = new_conversation_id();
    }

    async fn converse(&mut self, user_input: &str, options: &ConverseOptions) -> Result<String, AgentError> {
        self.record_message(ChatMessage::user(user_input));
        let tools = self.offered_tools(options);

        for _ in 0..=self.max_successive_tool_invocations {
            let request = self.build_request(&tools, options);
            let started = Instant::now();
            let response = self.provider.complete(request.clone()).await?;
            if let Some(reply) = self
                .complete_step(request, response, started.elapsed(), &tools)
                .await
            {
                return Ok(reply);
            }
        }

        Err(AgentError::MaxToolInvocationsReached(
            self.max_successive_tool_invocations,
        ))
    }

    fn converse_stream<'a>(
        &'a mut self,
        user_input: &'a str,
        options: &'a ConverseOptions,
    ) -> ResponseStream<'a> {
        if !self.provider.capabilities().supports_streaming {
            return Box::pin(try_stream! {
                let reply = self.converse(user_input, options).await?;
                yield reply;
            });
        }

        Box::pin(try_stream! {
            self.record_message(ChatMessage::user(user_input));
            let tools = self.offered_tools(options);
            let mut finished = false;

            for _ in 0..=self.max_successive_tool_invocations {
                let request = self.build_request(&tools, options);
                let started = Instant::now();
                let mut events = self.provider.stream_completion(request.clone()).await?;
                let mut completed = None;
                while let Some(event) = events.next().await {
                    match event? {
                        StreamEvent::MessageDelta(delta) => yield delta,
                        StreamEvent::Completed(response) => completed = Some(response),
                    }
                }
                let response = completed.ok_or(AgentError::IncompleteStream)?;
                if self
                    .complete_step(request, response, started.elapsed(), &tools)
                    .await
                    .is_some()
                {
                    finished = true;
                    break;
                }
            }

            if !finished {
                Err::<(), _>(AgentError::MaxToolInvocationsReached(self.max_successive_tool_invocations))?;
            }
        })
    }
}
