//! Assertions over the traces of one conversation.
//!
//! ```ignore
//! let expect = Expect::new(&traces);
//! expect.tool_invocations().to_include("get_weather")?.with_input(json!({"city": "Delft"}))?;
//! expect.agent_text_response().to_include("sunny")?;
//! ```

use regex::Regex;
use serde_json::Value;

use crate::trace::Trace;

#[derive(Debug, thiserror::Error)]
pub enum ExpectationError {
    #[error("no agent text response at index {index} ({available} available)")]
    NoResponse { index: isize, available: usize },
    #[error("{0}")]
    Unmet(String),
    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct Expect<'a> {
    traces: &'a [Trace],
}

impl<'a> Expect<'a> {
    pub fn new(traces: &'a [Trace]) -> Self {
        Self { traces }
    }

    /// The agent's text replies; assertions target the last one unless
    /// [`AgentTextResponse::at`] says otherwise.
    pub fn agent_text_response(&self) -> AgentTextResponse<'a> {
        AgentTextResponse {
            responses: self.traces.iter().filter_map(Trace::agent_text).collect(),
            index: -1,
        }
    }

    pub fn tool_invocations(&self) -> ToolInvocations<'a> {
        ToolInvocations {
            invocations: self
                .traces
                .iter()
                .filter_map(|trace| Some((trace.tool_name()?, trace.tool_input()?)))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentTextResponse<'a> {
    responses: Vec<&'a str>,
    index: isize,
}

impl<'a> AgentTextResponse<'a> {
    /// Selects a response; negative indices count from the end.
    pub fn at(mut self, index: isize) -> Self {
        self.index = index;
        self
    }

    fn selected(&self) -> Result<&'a str, ExpectationError> {
        let len = self.responses.len() as isize;
        let position = if self.index < 0 { len + self.index } else { self.index };
        if position < 0 || position >= len {
            return Err(ExpectationError::NoResponse {
                index: self.index,
                available: self.responses.len(),
            });
        }
        Ok(self.responses[position as usize])
    }

    pub fn to_equal(&self, expected: &str) -> Result<(), ExpectationError> {
        let actual = self.selected()?;
        if actual == expected {
            Ok(())
        } else {
            Err(ExpectationError::Unmet(format!(
                "expected agent response {expected:?}, got {actual:?}"
            )))
        }
    }

    pub fn to_include(&self, needle: &str) -> Result<(), ExpectationError> {
        let actual = self.selected()?;
        if actual.contains(needle) {
            Ok(())
        } else {
            Err(ExpectationError::Unmet(format!(
                "expected agent response to include {needle:?}, got {actual:?}"
            )))
        }
    }

    pub fn to_not_include(&self, needle: &str) -> Result<(), ExpectationError> {
        let actual = self.selected()?;
        if actual.contains(needle) {
            Err(ExpectationError::Unmet(format!(
                "expected agent response not to include {needle:?}, got {actual:?}"
            )))
        } else {
            Ok(())
        }
    }

    pub fn to_match(&self, pattern: &str) -> Result<(), ExpectationError> {
        let actual = self.selected()?;
        if Regex::new(pattern)?.is_match(actual) {
            Ok(())
        } else {
            Err(ExpectationError::Unmet(format!(
                "expected agent response to match /{pattern}/, got {actual:?}"
            )))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolInvocations<'a> {
    invocations: Vec<(&'a str, &'a Value)>,
}

impl<'a> ToolInvocations<'a> {
    pub fn names(&self) -> Vec<&'a str> {
        self.invocations.iter().map(|(name, _)| *name).collect()
    }

    pub fn to_include(&self, name: &str) -> Result<ToolInvocation<'a>, ExpectationError> {
        let inputs: Vec<&'a Value> = self
            .invocations
            .iter()
            .filter(|(tool, _)| *tool == name)
            .map(|(_, input)| *input)
            .collect();
        if inputs.is_empty() {
            return Err(ExpectationError::Unmet(format!(
                "expected tool {name:?} to be invoked, invoked: {:?}",
                self.names()
            )));
        }
        Ok(ToolInvocation {
            name: name.to_string(),
            inputs,
        })
    }

    pub fn to_not_include(&self, name: &str) -> Result<(), ExpectationError> {
        if self.invocations.iter().any(|(tool, _)| *tool == name) {
            Err(ExpectationError::Unmet(format!(
                "expected tool {name:?} not to be invoked"
            )))
        } else {
            Ok(())
        }
    }

    pub fn to_have_length(&self, expected: usize) -> Result<(), ExpectationError> {
        if self.invocations.len() == expected {
            Ok(())
        } else {
            Err(ExpectationError::Unmet(format!(
                "expected {expected} tool invocations, got {}: {:?}",
                self.invocations.len(),
                self.names()
            )))
        }
    }
}

/// Invocations of one tool, as found by [`ToolInvocations::to_include`].
#[derive(Debug, Clone)]
pub struct ToolInvocation<'a> {
    name: String,
    inputs: Vec<&'a Value>,
}

impl ToolInvocation<'_> {
    /// Passes if any invocation's input contains `expected`; object keys
    /// absent from `expected` are ignored.
    pub fn with_input(&self, expected: Value) -> Result<(), ExpectationError> {
        if self.inputs.iter().any(|input| contains(input, &expected)) {
            Ok(())
        } else {
            Err(ExpectationError::Unmet(format!(
                "expected tool {:?} to be invoked with {expected}, got {:?}",
                self.name, self.inputs
            )))
        }
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Object(actual), Value::Object(expected)) => expected
            .iter()
            .all(|(key, value)| actual.get(key).is_some_and(|found| contains(found, value))),
        _ => actual == expected,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        trace::{LlmRequest, LlmResponse, ToolRequest, ToolResponse},
        types::ChatMessage,
    };

    fn conversation() -> Vec<Trace> {
        let llm = |text: &str| {
            Trace::llm(
                "c1",
                LlmRequest {
                    model: "scripted".into(),
                    messages: Vec::new(),
                    tools: Vec::new(),
                },
                LlmResponse {
                    message: ChatMessage::assistant(text),
                    usage: None,
                    latency_ms: 1,
                },
            )
        };
        vec![
            llm("Let me check the weather."),
            Trace::tool(
                "c1",
                ToolRequest {
                    tool_name: "get_weather".into(),
                    tool_use_id: Some("t1".into()),
                    input: json!({"city_name": "Munich", "unit": "celsius"}),
                },
                ToolResponse {
                    output: Some(json!("sunny")),
                    error: None,
                    latency_ms: 2,
                },
            ),
            llm("It is sunny in Munich."),
        ]
    }

    #[test]
    fn agent_text_assertions() {
        let traces = conversation();
        let expect = Expect::new(&traces);

        expect.agent_text_response().to_equal("It is sunny in Munich.").unwrap();
        expect.agent_text_response().to_include("sunny").unwrap();
        expect.agent_text_response().to_not_include("rain").unwrap();
        expect.agent_text_response().to_match(r"(?i)^it is \w+").unwrap();
        expect.agent_text_response().at(0).to_include("check").unwrap();

        assert!(matches!(
            expect.agent_text_response().to_include("rain"),
            Err(ExpectationError::Unmet(_))
        ));
        assert!(matches!(
            expect.agent_text_response().at(5).to_equal("x"),
            Err(ExpectationError::NoResponse { index: 5, available: 2 })
        ));
        assert!(matches!(
            expect.agent_text_response().to_match("("),
            Err(ExpectationError::InvalidPattern(_))
        ));
    }

    #[test]
    fn tool_invocation_assertions() {
        let traces = conversation();
        let expect = Expect::new(&traces);

        expect
            .tool_invocations()
            .to_include("get_weather")
            .unwrap()
            .with_input(json!({"city_name": "Munich"}))
            .unwrap();
        expect.tool_invocations().to_not_include("get_news").unwrap();
        expect.tool_invocations().to_have_length(1).unwrap();

        assert!(expect
            .tool_invocations()
            .to_include("get_weather")
            .unwrap()
            .with_input(json!({"city_name": "Berlin"}))
            .is_err());
        assert!(expect.tool_invocations().to_include("get_news").is_err());
        assert!(expect.tool_invocations().to_have_length(2).is_err());
    }
}
