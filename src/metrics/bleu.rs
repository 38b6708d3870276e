use std::collections::HashMap;

use async_trait::async_trait;

use super::{Measurement, Metric, MetricError, Unit};
use crate::{
    trace::{Trace, TraceTo},
    types::MessageRole,
};

const MAX_ORDER: usize = 4;
const EPSILON: f64 = 0.1;

/// Lowest sentence BLEU score over all turns that carry expected responses.
///
/// Compares the agent's replies, as seen by the last LLM call of the
/// conversation, against the case's accepted responses per turn.
#[derive(Debug, Default, Clone, Copy)]
pub struct BleuMetric;

#[async_trait]
impl Metric for BleuMetric {
    fn name(&self) -> &str {
        "BleuMetric"
    }

    async fn evaluate_conversation(&self, traces: &[Trace]) -> Result<Vec<Measurement>, MetricError> {
        let Some(last) = traces.iter().rev().find(|trace| trace.to() == TraceTo::Llm) else {
            return Ok(Vec::new());
        };
        let Some(case) = last.case() else {
            return Ok(Vec::new());
        };
        if !case.has_expected_responses() {
            return Ok(Vec::new());
        }

        let actual: Vec<String> = last
            .user_conversation()
            .into_iter()
            .filter(|message| message.role == MessageRole::Assistant)
            .filter_map(|message| message.content)
            .collect();
        let expected_turns = &case.expected_agent_responses_per_turn;

        let mut min_score: f64 = 1.0;
        for (index, expected) in expected_turns.iter().enumerate() {
            if expected.is_empty() {
                continue;
            }
            let response = actual.get(index).ok_or_else(|| {
                MetricError::Failed(format!(
                    "not enough agent responses ({}) to compare against the expectations ({}) at index {index}",
                    actual.len(),
                    expected_turns.len()
                ))
            })?;
            let references: Vec<Vec<&str>> = expected.iter().map(|text| tokenize(text)).collect();
            min_score = min_score.min(sentence_bleu(&references, &tokenize(response)));
        }

        Ok(vec![Measurement::new("BleuScore", min_score).with_unit(Unit::None)])
    }
}

fn tokenize(text: &str) -> Vec<&str> {
    text.split_whitespace().collect()
}

fn ngrams<'a>(tokens: &[&'a str], n: usize) -> HashMap<Vec<&'a str>, usize> {
    let mut counts = HashMap::new();
    for window in tokens.windows(n) {
        *counts.entry(window.to_vec()).or_insert(0) += 1;
    }
    counts
}

/// Sentence BLEU with uniform weights up to 4-grams; orders without any
/// match count as `EPSILON` matches.
pub fn sentence_bleu(references: &[Vec<&str>], hypothesis: &[&str]) -> f64 {
    if hypothesis.is_empty() || references.is_empty() {
        return 0.0;
    }

    let mut log_precision_sum = 0.0;
    for n in 1..=MAX_ORDER {
        let hypothesis_counts = ngrams(hypothesis, n);
        let mut max_reference_counts: HashMap<Vec<&str>, usize> = HashMap::new();
        for reference in references {
            for (ngram, count) in ngrams(reference, n) {
                let entry = max_reference_counts.entry(ngram).or_insert(0);
                *entry = (*entry).max(count);
            }
        }

        let clipped: usize = hypothesis_counts
            .iter()
            .map(|(ngram, count)| (*count).min(max_reference_counts.get(ngram).copied().unwrap_or(0)))
            .sum();
        let total = hypothesis_counts.values().sum::<usize>().max(1);

        if n == 1 && clipped == 0 {
            return 0.0;
        }
        let precision = if clipped == 0 {
            EPSILON / total as f64
        } else {
            clipped as f64 / total as f64
        };
        log_precision_sum += precision.ln() / MAX_ORDER as f64;
    }

    let hypothesis_len = hypothesis.len();
    let closest_reference_len = references
        .iter()
        .map(Vec::len)
        .min_by_key(|len| (len.abs_diff(hypothesis_len), *len))
        .unwrap_or(0);
    let brevity_penalty = if hypothesis_len > closest_reference_len {
        1.0
    } else {
        (1.0 - closest_reference_len as f64 / hypothesis_len as f64).exp()
    };

    brevity_penalty * log_precision_sum.exp()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        case::Case,
        permute::Parameters,
        trace::{CaseRun, LlmRequest, LlmResponse},
        types::ChatMessage,
    };

    #[test]
    fn identical_sentences_score_one() {
        let reference = tokenize("the color of the sky is blue");
        let score = sentence_bleu(&[reference.clone()], &reference);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unrelated_sentences_score_zero() {
        let score = sentence_bleu(&[tokenize("the sky is blue")], &tokenize("grass grows green"));
        assert_eq!(score, 0.0);
    }

    #[test]
    fn partial_overlap_is_between_zero_and_one() {
        let score = sentence_bleu(
            &[tokenize("the color of the sky is blue")],
            &tokenize("the sky is blue today"),
        );
        assert!(score > 0.0 && score < 1.0, "score was {score}");
    }

    fn conversation(case: Case, replies: &[&str]) -> Vec<Trace> {
        let case_run = Arc::new(CaseRun {
            case: Arc::new(case),
            case_nr: 0,
            run_nr: 0,
            permutation: Arc::new(Parameters::new()),
        });
        let mut messages = Vec::new();
        let mut traces = Vec::new();
        for reply in replies {
            messages.push(ChatMessage::user("question"));
            traces.push(
                Trace::llm(
                    "c1",
                    LlmRequest {
                        model: "scripted".into(),
                        messages: messages.clone(),
                        tools: Vec::new(),
                    },
                    LlmResponse {
                        message: ChatMessage::assistant(*reply),
                        usage: None,
                        latency_ms: 1,
                    },
                )
                .with_case_run(case_run.clone()),
            );
            messages.push(ChatMessage::assistant(*reply));
        }
        traces
    }

    #[tokio::test]
    async fn reports_minimum_over_turns() {
        let case = Case::new("sky")
            .add_turn("what color is the sky", ["the sky is blue"])
            .with_user_input("thanks")
            .add_turn("and grass", ["grass is green"]);
        let traces = conversation(case, &["the sky is blue", "you're welcome", "grass is purple"]);

        let measurements = BleuMetric.evaluate_conversation(&traces).await.unwrap();
        assert_eq!(measurements.len(), 1);
        assert_eq!(measurements[0].name, "BleuScore");
        assert!(measurements[0].value < 1.0);
    }

    #[tokio::test]
    async fn not_applicable_without_expectations_and_fails_on_missing_turns() {
        let open = conversation(Case::new("open").with_user_input("hi"), &["hello"]);
        assert!(BleuMetric.evaluate_conversation(&open).await.unwrap().is_empty());

        let short = conversation(
            Case::new("short").add_turn("a", ["x"]).add_turn("b", ["y"]),
            &["x"],
        );
        let err = BleuMetric.evaluate_conversation(&short).await.unwrap_err();
        assert!(err.to_string().contains("not enough agent responses"));
    }
}
