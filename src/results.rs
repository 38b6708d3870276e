use std::{convert::Infallible, fmt};

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{Mutex, OnceCell};
use tracing::{error, info};

use crate::{
    evaluate::{ConversationMeasurements, MeasurementStream},
    generate::GenerateError,
    metrics::{Measurement, Unit},
    permute::Parameters,
    trace::{TraceId, TraceTo},
};

/// A case run that produced no conversation to evaluate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedCaseRun {
    pub case_name: String,
    pub case_nr: usize,
    pub run_nr: usize,
    pub permutation: Parameters,
    pub error: String,
}

impl From<GenerateError> for FailedCaseRun {
    fn from(error: GenerateError) -> Self {
        Self {
            case_name: error.case_run.case.name.clone(),
            case_nr: error.case_run.case_nr,
            run_nr: error.case_run.run_nr,
            permutation: (*error.case_run.permutation).clone(),
            error: error.failure.to_string(),
        }
    }
}

impl From<Infallible> for FailedCaseRun {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementMean {
    pub name: String,
    pub unit: Unit,
    pub mean: f64,
    /// Number of measurements the mean was taken over.
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub nr_conversations: usize,
    pub passed: usize,
    pub failed: usize,
    pub traces_per_run: f64,
    pub llm_calls_per_run: f64,
    pub tool_calls_per_run: f64,
    /// Means in order of first appearance.
    pub means: Vec<MeasurementMean>,
    pub metric_failures: usize,
    pub failed_case_runs: Vec<FailedCaseRun>,
}

impl Summary {
    pub fn mean(&self, name: &str) -> Option<f64> {
        self.means
            .iter()
            .find(|mean| mean.name == name)
            .map(|mean| mean.mean)
    }

    fn from_conversations<'a>(
        conversations: impl IntoIterator<Item = &'a ConversationMeasurements>,
        failed_case_runs: Vec<FailedCaseRun>,
    ) -> Self {
        let mut nr_conversations = 0;
        let (mut passed, mut failed) = (0, 0);
        let (mut traces, mut llm_calls, mut tool_calls) = (0usize, 0usize, 0usize);
        let mut metric_failures = 0;
        let mut totals: Vec<(String, Unit, f64, usize)> = Vec::new();

        for conversation in conversations {
            nr_conversations += 1;
            match conversation.validation_passed() {
                Some(true) => passed += 1,
                Some(false) => failed += 1,
                None => {}
            }
            for trace in &conversation.traces {
                traces += 1;
                match trace.trace.to() {
                    TraceTo::Llm => llm_calls += 1,
                    TraceTo::Tool => tool_calls += 1,
                }
            }
            metric_failures += conversation.failures.len();

            for measurement in conversation.all_measurements() {
                match totals.iter_mut().find(|(name, ..)| *name == measurement.name) {
                    Some((_, _, sum, count)) => {
                        *sum += measurement.value;
                        *count += 1;
                    }
                    None => totals.push((measurement.name.clone(), measurement.unit, measurement.value, 1)),
                }
            }
        }

        let per_run = |count: usize| {
            if nr_conversations == 0 {
                0.0
            } else {
                count as f64 / nr_conversations as f64
            }
        };

        Self {
            nr_conversations,
            passed,
            failed,
            traces_per_run: per_run(traces),
            llm_calls_per_run: per_run(llm_calls),
            tool_calls_per_run: per_run(tool_calls),
            means: totals
                .into_iter()
                .map(|(name, unit, sum, count)| MeasurementMean {
                    name,
                    unit,
                    mean: sum / count as f64,
                    count,
                })
                .collect(),
            metric_failures,
            failed_case_runs,
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "conversations: {} (passed {}, failed {})",
            self.nr_conversations, self.passed, self.failed
        )?;
        writeln!(
            f,
            "per run: {:.2} traces, {:.2} LLM calls, {:.2} tool calls",
            self.traces_per_run, self.llm_calls_per_run, self.tool_calls_per_run
        )?;
        for mean in &self.means {
            writeln!(f, "  {:<32} {:>12.3} {} (n={})", mean.name, mean.mean, mean.unit, mean.count)?;
        }
        if self.metric_failures > 0 {
            writeln!(f, "metric failures: {}", self.metric_failures)?;
        }
        for run in &self.failed_case_runs {
            writeln!(
                f,
                "failed case run: {} (case {}, run {}): {}",
                run.case_name, run.case_nr, run.run_nr, run.error
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PermutationSummary {
    pub permutation: Parameters,
    pub summary: Summary,
}

/// One measurement with the context it was taken in.
#[derive(Debug, Clone, Serialize)]
pub struct MeasurementRecord {
    pub conversation_id: String,
    pub case_name: Option<String>,
    pub case_nr: Option<usize>,
    pub run_nr: Option<usize>,
    pub permutation: Option<Parameters>,
    /// Unset for conversation level measurements.
    pub trace_id: Option<TraceId>,
    pub to: Option<TraceTo>,
    #[serde(flatten)]
    pub measurement: Measurement,
}

#[derive(Debug, Default)]
struct Collected {
    conversations: Vec<ConversationMeasurements>,
    failed_case_runs: Vec<FailedCaseRun>,
}

/// The source stream and what has been pulled from it so far. Lives behind a
/// lock so that a cancelled drain is resumed, not restarted.
struct Drain<E> {
    source: MeasurementStream<E>,
    collected: Collected,
}

/// Drains an evaluation once and answers every query from the cached outcome.
pub struct EvalResults<E> {
    drain: Mutex<Drain<E>>,
    collected: OnceCell<Collected>,
}

impl<E> fmt::Debug for EvalResults<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvalResults")
            .field("evaluated", &self.collected.initialized())
            .finish()
    }
}

impl<E> EvalResults<E>
where
    E: Into<FailedCaseRun> + Send + 'static,
{
    pub fn new(measurements: MeasurementStream<E>) -> Self {
        Self {
            drain: Mutex::new(Drain {
                source: measurements,
                collected: Collected::default(),
            }),
            collected: OnceCell::new(),
        }
    }

    async fn collected(&self) -> &Collected {
        self.collected
            .get_or_init(|| async {
                let mut drain = self.drain.lock().await;
                let Drain { source, collected } = &mut *drain;

                while let Some(item) = source.next().await {
                    match item {
                        Ok(conversation) => collected.conversations.push(conversation),
                        Err(failure) => {
                            let failure: FailedCaseRun = failure.into();
                            error!(
                                case = %failure.case_name,
                                case_nr = failure.case_nr,
                                run_nr = failure.run_nr,
                                error = %failure.error,
                                "case run failed"
                            );
                            collected.failed_case_runs.push(failure);
                        }
                    }
                }
                info!(
                    conversations = collected.conversations.len(),
                    failed_case_runs = collected.failed_case_runs.len(),
                    "evaluation finished"
                );
                std::mem::take(collected)
            })
            .await
    }

    pub async fn conversations(&self) -> &[ConversationMeasurements] {
        &self.collected().await.conversations
    }

    pub async fn failed_case_runs(&self) -> &[FailedCaseRun] {
        &self.collected().await.failed_case_runs
    }

    pub async fn summary(&self) -> Summary {
        let collected = self.collected().await;
        Summary::from_conversations(&collected.conversations, collected.failed_case_runs.clone())
    }

    /// One summary per concrete parameter set, in order of first appearance.
    pub async fn summary_by_permutation(&self) -> Vec<PermutationSummary> {
        let collected = self.collected().await;
        let mut groups: Vec<(Parameters, Vec<&ConversationMeasurements>, Vec<FailedCaseRun>)> = Vec::new();

        for conversation in &collected.conversations {
            let permutation = conversation
                .case_run()
                .map(|run| (*run.permutation).clone())
                .unwrap_or_default();
            match groups.iter_mut().find(|(key, ..)| *key == permutation) {
                Some((_, conversations, _)) => conversations.push(conversation),
                None => groups.push((permutation, vec![conversation], Vec::new())),
            }
        }
        for failure in &collected.failed_case_runs {
            match groups.iter_mut().find(|(key, ..)| *key == failure.permutation) {
                Some((_, _, failures)) => failures.push(failure.clone()),
                None => groups.push((failure.permutation.clone(), Vec::new(), vec![failure.clone()])),
            }
        }

        groups
            .into_iter()
            .map(|(permutation, conversations, failures)| PermutationSummary {
                permutation,
                summary: Summary::from_conversations(conversations, failures),
            })
            .collect()
    }

    /// Every measurement, flattened, with conversation and case context.
    pub async fn details(&self) -> Vec<MeasurementRecord> {
        let collected = self.collected().await;
        let mut records = Vec::new();
        for conversation in &collected.conversations {
            let case_run = conversation.case_run();
            let record = |trace: Option<(TraceId, TraceTo)>, measurement: &Measurement| MeasurementRecord {
                conversation_id: conversation.conversation_id.clone(),
                case_name: conversation.case_name.clone(),
                case_nr: case_run.map(|run| run.case_nr),
                run_nr: case_run.map(|run| run.run_nr),
                permutation: case_run.map(|run| (*run.permutation).clone()),
                trace_id: trace.map(|(id, _)| id),
                to: trace.map(|(_, to)| to),
                measurement: measurement.clone(),
            };

            for trace in &conversation.traces {
                let context = Some((trace.trace.trace_id, trace.trace.to()));
                records.extend(trace.measurements.iter().map(|m| record(context, m)));
            }
            records.extend(conversation.measurements.iter().map(|m| record(None, m)));
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        evaluate::evaluate_traces,
        metrics::{Metric, MetricError},
        trace::{LlmRequest, LlmResponse, ToolRequest, ToolResponse, Trace},
        types::ChatMessage,
    };

    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Metric for Counting {
        fn name(&self) -> &str {
            "Counting"
        }

        async fn evaluate_trace(&self, trace: &Trace) -> Result<Vec<Measurement>, MetricError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Measurement::new("Latency", trace.latency().as_millis() as f64)
                .with_unit(Unit::Milliseconds)])
        }
    }

    fn llm(conversation_id: &str, latency_ms: u64) -> Trace {
        Trace::llm(
            conversation_id,
            LlmRequest {
                model: "scripted".into(),
                messages: vec![ChatMessage::user("hi")],
                tools: Vec::new(),
            },
            LlmResponse {
                message: ChatMessage::assistant("hello"),
                usage: None,
                latency_ms,
            },
        )
    }

    fn tool(conversation_id: &str, latency_ms: u64) -> Trace {
        Trace::tool(
            conversation_id,
            ToolRequest {
                tool_name: "lookup".into(),
                tool_use_id: None,
                input: serde_json::json!({}),
            },
            ToolResponse {
                output: None,
                error: None,
                latency_ms,
            },
        )
    }

    #[tokio::test]
    async fn summarizes_once_and_answers_from_cache() {
        let metric = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let traces = vec![llm("a", 100), tool("a", 10), llm("a", 300), llm("b", 200)];
        let results = EvalResults::new(evaluate_traces(traces, vec![metric.clone()]));

        let first = results.summary().await;
        let second = results.summary().await;
        assert_eq!(first, second);
        assert_eq!(metric.calls.load(Ordering::SeqCst), 4);

        assert_eq!(first.nr_conversations, 2);
        assert_eq!(first.traces_per_run, 2.0);
        assert_eq!(first.llm_calls_per_run, 1.5);
        assert_eq!(first.tool_calls_per_run, 0.5);
        assert_eq!(first.mean("Latency"), Some(152.5));
        assert_eq!(first.means[0].count, 4);
        assert_eq!((first.passed, first.failed), (0, 0));
        assert!(first.to_string().contains("Latency"));

        let details = results.details().await;
        assert_eq!(details.len(), 4);
        assert_eq!(details[1].to, Some(TraceTo::Tool));
        assert_eq!(metric.calls.load(Ordering::SeqCst), 4);
    }

    struct Slow {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Metric for Slow {
        fn name(&self) -> &str {
            "Slow"
        }

        async fn evaluate_trace(&self, _trace: &Trace) -> Result<Vec<Measurement>, MetricError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(vec![Measurement::new("Slow", 2.0)])
        }
    }

    #[tokio::test]
    async fn cancelled_summary_resumes_where_it_stopped() {
        let metric = Arc::new(Slow {
            calls: AtomicUsize::new(0),
        });
        let traces = vec![llm("a", 1), llm("b", 1), llm("c", 1)];
        let results = EvalResults::new(evaluate_traces(traces, vec![metric.clone()]));

        let cut_short = tokio::time::timeout(Duration::from_millis(10), results.summary()).await;
        assert!(cut_short.is_err());

        let summary = results.summary().await;
        assert_eq!(summary.nr_conversations, 3);
        assert_eq!(summary.mean("Slow"), Some(2.0));
        assert_eq!(metric.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_evaluation_summarizes_to_zero() {
        let results = EvalResults::new(evaluate_traces(Vec::new(), Vec::new()));
        let summary = results.summary().await;
        assert_eq!(summary.nr_conversations, 0);
        assert_eq!(summary.traces_per_run, 0.0);
        assert!(summary.means.is_empty());
        assert!(results.summary_by_permutation().await.is_empty());
    }
}
