//! Trace records for LLM and tool invocations.
//!
//! Every trace carries a ULID based [`TraceId`], handed out by a process-wide
//! monotonic generator, so sorting the traces of a conversation by id yields
//! their creation order.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::{Duration, SystemTime},
};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::{Generator, Ulid};

use crate::{
    case::Case,
    permute::Parameters,
    types::{ChatMessage, MessageRole, TokenUsage},
};

static TRACE_IDS: Lazy<Mutex<Generator>> = Lazy::new(|| Mutex::new(Generator::new()));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(Ulid);

impl TraceId {
    /// Returns an id strictly greater than every id handed out before it.
    pub fn generate() -> Self {
        let mut generator = TRACE_IDS.lock().unwrap_or_else(PoisonError::into_inner);
        Self(next_monotonic(&mut generator, SystemTime::now))
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.0.datetime())
    }
}

/// Draws the next id from `generator`. When the random part of the current
/// millisecond is used up, waits for the clock to move on.
fn next_monotonic(generator: &mut Generator, mut now: impl FnMut() -> SystemTime) -> Ulid {
    loop {
        match generator.generate_from_datetime(now()) {
            Ok(ulid) => return ulid,
            Err(_) => thread::yield_now(),
        }
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TraceTo {
    #[serde(rename = "LLM")]
    Llm,
    #[serde(rename = "TOOL")]
    Tool,
}

impl fmt::Display for TraceTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceTo::Llm => f.write_str("LLM"),
            TraceTo::Tool => f.write_str("TOOL"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub message: ChatMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    pub tool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    pub input: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "to")]
pub enum TraceBody {
    #[serde(rename = "LLM")]
    Llm {
        request: LlmRequest,
        response: LlmResponse,
    },
    #[serde(rename = "TOOL")]
    Tool {
        request: ToolRequest,
        response: ToolResponse,
    },
}

/// Provenance attached to traces produced by bulk generation.
#[derive(Debug, Clone)]
pub struct CaseRun {
    pub case: Arc<Case>,
    pub case_nr: usize,
    pub run_nr: usize,
    pub permutation: Arc<Parameters>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub conversation_id: String,
    pub trace_id: TraceId,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub body: TraceBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_context: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub additional_info: Map<String, Value>,
    #[serde(skip)]
    case_run: Option<Arc<CaseRun>>,
}

impl Trace {
    pub fn new(conversation_id: impl Into<String>, body: TraceBody) -> Self {
        let trace_id = TraceId::generate();
        Self {
            conversation_id: conversation_id.into(),
            trace_id,
            created_at: trace_id.timestamp(),
            body,
            auth_context: None,
            additional_info: Map::new(),
            case_run: None,
        }
    }

    pub fn llm(conversation_id: impl Into<String>, request: LlmRequest, response: LlmResponse) -> Self {
        Self::new(conversation_id, TraceBody::Llm { request, response })
    }

    pub fn tool(conversation_id: impl Into<String>, request: ToolRequest, response: ToolResponse) -> Self {
        Self::new(conversation_id, TraceBody::Tool { request, response })
    }

    pub fn with_auth_context(mut self, auth_context: Option<String>) -> Self {
        self.auth_context = auth_context;
        self
    }

    pub fn with_info(mut self, key: impl Into<String>, value: Value) -> Self {
        self.additional_info.insert(key.into(), value);
        self
    }

    pub(crate) fn with_case_run(mut self, case_run: Arc<CaseRun>) -> Self {
        self.case_run = Some(case_run);
        self
    }

    pub fn to(&self) -> TraceTo {
        match self.body {
            TraceBody::Llm { .. } => TraceTo::Llm,
            TraceBody::Tool { .. } => TraceTo::Tool,
        }
    }

    pub fn latency(&self) -> Duration {
        let millis = match &self.body {
            TraceBody::Llm { response, .. } => response.latency_ms,
            TraceBody::Tool { response, .. } => response.latency_ms,
        };
        Duration::from_millis(millis)
    }

    pub fn token_usage(&self) -> Option<TokenUsage> {
        match &self.body {
            TraceBody::Llm { response, .. } => response.usage,
            TraceBody::Tool { .. } => None,
        }
    }

    pub fn model(&self) -> Option<&str> {
        match &self.body {
            TraceBody::Llm { request, .. } => Some(request.model.as_str()),
            TraceBody::Tool { .. } => None,
        }
    }

    /// Text the agent produced in this LLM call, if any.
    pub fn agent_text(&self) -> Option<&str> {
        match &self.body {
            TraceBody::Llm { response, .. } => response
                .message
                .text()
                .filter(|text| !text.trim().is_empty()),
            TraceBody::Tool { .. } => None,
        }
    }

    pub fn tool_name(&self) -> Option<&str> {
        match &self.body {
            TraceBody::Tool { request, .. } => Some(request.tool_name.as_str()),
            TraceBody::Llm { .. } => None,
        }
    }

    pub fn tool_input(&self) -> Option<&Value> {
        match &self.body {
            TraceBody::Tool { request, .. } => Some(&request.input),
            TraceBody::Llm { .. } => None,
        }
    }

    /// User and assistant text exchanged up to and including this LLM call.
    pub fn user_conversation(&self) -> Vec<ChatMessage> {
        let TraceBody::Llm { request, response } = &self.body else {
            return Vec::new();
        };

        request
            .messages
            .iter()
            .chain(std::iter::once(&response.message))
            .filter(|message| matches!(message.role, MessageRole::User | MessageRole::Assistant))
            .filter_map(|message| {
                let text = message.text()?.trim();
                (!text.is_empty()).then(|| ChatMessage::new(message.role.clone(), text))
            })
            .collect()
    }

    pub fn case_run(&self) -> Option<&CaseRun> {
        self.case_run.as_deref()
    }

    pub(crate) fn shared_case_run(&self) -> Option<&Arc<CaseRun>> {
        self.case_run.as_ref()
    }

    pub fn case(&self) -> Option<&Arc<Case>> {
        self.case_run.as_ref().map(|run| &run.case)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_keep_increasing_when_the_clock_stalls_or_steps_back() {
        let mut generator = Generator::new();
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let mut ticks = [start, start, start, start - Duration::from_millis(5), start].into_iter();

        let ids: Vec<Ulid> = (0..5)
            .map(|_| next_monotonic(&mut generator, || ticks.next().unwrap_or(start)))
            .collect();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(ids.iter().all(|id| id.datetime() == start));
    }

    fn llm_trace(conversation_id: &str, text: &str) -> Trace {
        Trace::llm(
            conversation_id,
            LlmRequest {
                model: "scripted".into(),
                messages: vec![ChatMessage::system("be brief"), ChatMessage::user("hi")],
                tools: Vec::new(),
            },
            LlmResponse {
                message: ChatMessage::assistant(text),
                usage: Some(TokenUsage::new(10, 5)),
                latency_ms: 120,
            },
        )
    }

    #[test]
    fn ids_sort_in_creation_order() {
        let traces: Vec<Trace> = (0..200).map(|i| llm_trace("c1", &format!("reply {i}"))).collect();
        for pair in traces.windows(2) {
            assert!(pair[0].trace_id < pair[1].trace_id);
            assert!(pair[0].trace_id.to_string() < pair[1].trace_id.to_string());
            assert!(pair[0].created_at <= pair[1].created_at);
        }
    }

    #[test]
    fn serializes_discriminant_as_to() {
        let trace = llm_trace("c1", "hello").with_info("agent", Value::from("city"));
        let value = serde_json::to_value(&trace).unwrap();
        assert_eq!(value["to"], "LLM");
        assert_eq!(value["response"]["latency_ms"], 120);
        assert_eq!(value["additional_info"]["agent"], "city");

        let back: Trace = serde_json::from_value(value).unwrap();
        assert_eq!(back.to(), TraceTo::Llm);
        assert_eq!(back.trace_id, trace.trace_id);
        assert!(back.case_run().is_none());
    }

    #[test]
    fn user_conversation_skips_system_and_blank_messages() {
        let trace = llm_trace("c1", "Paris");
        let conversation = trace.user_conversation();
        assert_eq!(conversation.len(), 2);
        assert_eq!(conversation[0].text(), Some("hi"));
        assert_eq!(conversation[1].text(), Some("Paris"));
        assert_eq!(trace.agent_text(), Some("Paris"));
        assert_eq!(trace.latency(), Duration::from_millis(120));
    }

    #[test]
    fn tool_traces_have_no_text_or_usage() {
        let trace = Trace::tool(
            "c1",
            ToolRequest {
                tool_name: "get_weather".into(),
                tool_use_id: Some("t1".into()),
                input: serde_json::json!({"city_name": "Munich"}),
            },
            ToolResponse {
                output: Some(serde_json::json!("sunny")),
                error: None,
                latency_ms: 3,
            },
        );
        assert_eq!(trace.to(), TraceTo::Tool);
        assert_eq!(trace.tool_name(), Some("get_weather"));
        assert!(trace.agent_text().is_none());
        assert!(trace.token_usage().is_none());
        assert!(trace.user_conversation().is_empty());
    }
}
