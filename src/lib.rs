pub mod error;
pub mod providers;
pub mod types;
pub mod functions;
pub mod trace;
pub mod tracer;
pub mod history;
pub mod agent;
pub mod case;
pub mod simulator;
pub mod permute;
pub mod generate;
pub mod metrics;
pub mod evaluate;
pub mod results;
pub mod expect;

pub use error::LLMError;
pub use providers::LLMProvider;
pub use types::{
    ChatMessage, CompletionRequest, CompletionResponse, CompletionStream, MessageRole,
    ProviderCapabilities, StreamEvent, TokenUsage,
};
pub use functions::{
    DynKernelFunction, FunctionCall, FunctionDefinition, FunctionRegistry, KernelFunction, Tool,
    ToolCall, ToolChoice,
};
pub use trace::{CaseRun, Trace, TraceBody, TraceId, TraceTo};
pub use tracer::{InMemoryTracer, LogTracer, NoopTracer, TeeTracer, Tracer};
pub use history::{ConversationHistory, InMemoryConversationHistory};
pub use agent::{
    AgentError, ConversationalAgent, ConverseOptions, ResponseStream, ToolAgent, ToolAgentConfig,
};
pub use case::{load_cases, Case, CaseError, CaseFileError, Findings, UserInputProducer};
pub use simulator::LlmUserSimulator;
pub use permute::{AgentParameters, Parameters, Permute, PermutationError};
pub use generate::{
    generate_traces, CaseRunFailure, CaseRunTraces, GenerateError, GenerateOptions, TraceStream,
};
pub use metrics::{Measurement, Metric, MetricError, Unit};
pub use evaluate::{
    evaluate, evaluate_traces, ConversationMeasurements, MeasurementStream, MetricFailure,
    TraceBatch, TraceMeasurements,
};
pub use results::{EvalResults, FailedCaseRun, MeasurementRecord, PermutationSummary, Summary};
pub use expect::{Expect, ExpectationError};
pub use schemars::JsonSchema;
