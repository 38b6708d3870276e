use std::{fmt, sync::Arc};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use super::{Measurement, Metric, MetricError, Unit};
use crate::{
    trace::{Trace, TraceTo},
    types::{ChatMessage, CompletionRequest, MessageRole},
    LLMProvider,
};

static JSON_OBJECT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));

const JUDGE_INSTRUCTIONS: &str = "You evaluate conversations between a user and an AI agent. \
Given the conversation and the expectations for it, decide whether the agent met the expectations. \
Answer with a JSON object only: {\"passed\": true|false, \"reasoning\": \"<one or two sentences>\"}";

#[derive(Debug, Deserialize)]
struct Verdict {
    passed: bool,
    #[serde(default)]
    reasoning: String,
}

/// Asks a judge model whether a conversation met its case's overall expectations.
pub struct ConversationExpectationMetric {
    judge: Arc<dyn LLMProvider>,
    model: String,
}

impl fmt::Debug for ConversationExpectationMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationExpectationMetric")
            .field("judge", &self.judge.name())
            .field("model", &self.model)
            .finish()
    }
}

impl ConversationExpectationMetric {
    pub fn new(judge: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            judge,
            model: model.into(),
        }
    }

    fn transcript(conversation: &[ChatMessage]) -> String {
        conversation
            .iter()
            .filter_map(|message| {
                let speaker = match message.role {
                    MessageRole::User => "User",
                    MessageRole::Assistant => "Agent",
                    _ => return None,
                };
                Some(format!("{speaker}: {}", message.text()?))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl Metric for ConversationExpectationMetric {
    fn name(&self) -> &str {
        "ConversationExpectationMetric"
    }

    async fn evaluate_conversation(&self, traces: &[Trace]) -> Result<Vec<Measurement>, MetricError> {
        let Some(last) = traces.iter().rev().find(|trace| trace.to() == TraceTo::Llm) else {
            return Ok(Vec::new());
        };
        let Some(expectations) = last.case().and_then(|case| case.overall_expectations.clone()) else {
            return Ok(Vec::new());
        };

        let prompt = format!(
            "<conversation>\n{}\n</conversation>\n<expectations>\n{}\n</expectations>",
            Self::transcript(&last.user_conversation()),
            expectations
        );
        let request = CompletionRequest::new(
            self.model.clone(),
            vec![ChatMessage::system(JUDGE_INSTRUCTIONS), ChatMessage::user(prompt)],
        )
        .with_temperature(0.0);

        let response = self.judge.complete(request).await?;
        let text = response.message.text().unwrap_or_default();
        let json = JSON_OBJECT
            .find(text)
            .ok_or_else(|| MetricError::Failed(format!("judge returned no JSON verdict: {text}")))?;
        let verdict: Verdict = serde_json::from_str(json.as_str())
            .map_err(|error| MetricError::Failed(format!("unreadable judge verdict: {error}")))?;

        Ok(vec![Measurement::new(
            "ConversationExpectations",
            if verdict.passed { 1.0 } else { 0.0 },
        )
        .with_unit(Unit::None)
        .with_validation(verdict.passed)
        .with_info("reasoning", verdict.reasoning)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        case::Case,
        permute::Parameters,
        providers::scripted::ScriptedProvider,
        trace::{CaseRun, LlmRequest, LlmResponse},
    };

    fn traces_for(case: Case) -> Vec<Trace> {
        let case_run = Arc::new(CaseRun {
            case: Arc::new(case),
            case_nr: 0,
            run_nr: 0,
            permutation: Arc::new(Parameters::new()),
        });
        vec![Trace::llm(
            "c1",
            LlmRequest {
                model: "scripted".into(),
                messages: vec![ChatMessage::user("what color is the sky")],
                tools: Vec::new(),
            },
            LlmResponse {
                message: ChatMessage::assistant("green"),
                usage: None,
                latency_ms: 1,
            },
        )
        .with_case_run(case_run)]
    }

    #[tokio::test]
    async fn records_the_judge_verdict() {
        let judge = Arc::new(ScriptedProvider::from_texts([
            "Verdict:\n{\"passed\": false, \"reasoning\": \"The sky is not green.\"}",
        ]));
        let metric = ConversationExpectationMetric::new(judge, "judge");
        let traces = traces_for(Case::new("sky").with_overall_expectations("The agent says blue"));

        let measurements = metric.evaluate_conversation(&traces).await.unwrap();
        assert_eq!(measurements[0].validation_passed, Some(false));
        assert_eq!(measurements[0].additional_info["reasoning"], "The sky is not green.");
    }

    #[tokio::test]
    async fn skips_cases_without_expectations_and_rejects_garbage() {
        let judge = Arc::new(ScriptedProvider::from_texts(["no idea"]));
        let metric = ConversationExpectationMetric::new(judge, "judge");

        let open = traces_for(Case::new("open"));
        assert!(metric.evaluate_conversation(&open).await.unwrap().is_empty());

        let judged = traces_for(Case::new("sky").with_overall_expectations("blue"));
        assert!(matches!(
            metric.evaluate_conversation(&judged).await,
            Err(MetricError::Failed(_))
        ));
    }
}
