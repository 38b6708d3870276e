use std::{
    collections::HashMap,
    convert::Infallible,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::Arc,
};

use async_stream::stream;
use futures_core::Stream;
use futures_util::{stream as futures_stream, FutureExt, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    case::{panic_message, Case},
    generate::CaseRunTraces,
    metrics::{Measurement, Metric, MetricError, Unit},
    trace::{CaseRun, Trace, TraceId},
};

#[derive(Debug, Clone, Serialize)]
pub struct TraceMeasurements {
    pub trace: Trace,
    pub measurements: Vec<Measurement>,
}

/// A metric call that returned an error or panicked.
#[derive(Debug, Clone, Serialize)]
pub struct MetricFailure {
    pub metric: String,
    /// Set when the failure came from `evaluate_trace`.
    pub trace_id: Option<TraceId>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationMeasurements {
    pub conversation_id: String,
    pub case_name: Option<String>,
    pub traces: Vec<TraceMeasurements>,
    /// Conversation level measurements, validator results last.
    pub measurements: Vec<Measurement>,
    pub failures: Vec<MetricFailure>,
    #[serde(skip)]
    case_run: Option<Arc<CaseRun>>,
}

impl ConversationMeasurements {
    pub fn case(&self) -> Option<&Arc<Case>> {
        self.case_run.as_ref().map(|run| &run.case)
    }

    pub fn case_run(&self) -> Option<&CaseRun> {
        self.case_run.as_deref()
    }

    /// Every measurement, trace level first.
    pub fn all_measurements(&self) -> impl Iterator<Item = &Measurement> {
        self.traces
            .iter()
            .flat_map(|trace| trace.measurements.iter())
            .chain(self.measurements.iter())
    }

    /// `Some(false)` if any measurement failed validation, `Some(true)` if
    /// none failed and at least one passed, `None` otherwise.
    pub fn validation_passed(&self) -> Option<bool> {
        let mut passed = false;
        for measurement in self.all_measurements() {
            match measurement.validation_passed {
                Some(false) => return Some(false),
                Some(true) => passed = true,
                None => {}
            }
        }
        passed.then_some(true)
    }
}

pub type MeasurementStream<E> =
    Pin<Box<dyn Stream<Item = Result<ConversationMeasurements, E>> + Send>>;

/// One item of evaluation input: traces of any number of conversations, or
/// the traces of a single case run. A case run is evaluated even when it
/// left no traces, so its validators still get their say.
#[derive(Debug, Clone, Default)]
pub struct TraceBatch {
    traces: Vec<Trace>,
    case_run: Option<(Arc<CaseRun>, String)>,
}

impl From<Vec<Trace>> for TraceBatch {
    fn from(traces: Vec<Trace>) -> Self {
        Self {
            traces,
            case_run: None,
        }
    }
}

impl From<CaseRunTraces> for TraceBatch {
    fn from(run: CaseRunTraces) -> Self {
        Self {
            traces: run.traces,
            case_run: Some((run.case_run, run.conversation_id)),
        }
    }
}

/// Scores every conversation in `traces` with `metrics`, lazily and in order.
///
/// Per conversation, each metric's `evaluate_trace` runs on each trace, then
/// each metric's `evaluate_conversation` once, then the validators of the
/// originating case. Metric errors and panics are recorded as
/// [`MetricFailure`]s; upstream errors are passed through in place.
pub fn evaluate<S, B, E>(traces: S, metrics: Vec<Arc<dyn Metric>>) -> MeasurementStream<E>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: Into<TraceBatch> + Send + 'static,
    E: Send + 'static,
{
    Box::pin(stream! {
        let mut source = Box::pin(traces);
        while let Some(batch) = source.next().await {
            match batch {
                Ok(batch) => {
                    let TraceBatch { traces, case_run } = batch.into();
                    if traces.is_empty() {
                        if let Some((case_run, conversation_id)) = case_run {
                            yield Ok(evaluate_conversation(conversation_id, Vec::new(), Some(case_run), &metrics).await);
                        }
                        continue;
                    }
                    for conversation in split_conversations(traces) {
                        let conversation_id = conversation
                            .first()
                            .map(|trace| trace.conversation_id.clone())
                            .unwrap_or_default();
                        let origin = conversation
                            .iter()
                            .find_map(|trace| trace.shared_case_run())
                            .or(case_run.as_ref().map(|(run, _)| run))
                            .cloned();
                        yield Ok(evaluate_conversation(conversation_id, conversation, origin, &metrics).await);
                    }
                }
                Err(error) => yield Err(error),
            }
        }
    })
}

/// [`evaluate`] over traces already at hand, e.g. read back from a tracer.
pub fn evaluate_traces(traces: Vec<Trace>, metrics: Vec<Arc<dyn Metric>>) -> MeasurementStream<Infallible> {
    evaluate(futures_stream::iter([Ok(traces)]), metrics)
}

/// Groups traces by conversation in order of first appearance, each group
/// sorted by trace id.
fn split_conversations(traces: Vec<Trace>) -> Vec<Vec<Trace>> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<Trace>> = HashMap::new();
    for trace in traces {
        if !groups.contains_key(&trace.conversation_id) {
            order.push(trace.conversation_id.clone());
        }
        groups.entry(trace.conversation_id.clone()).or_default().push(trace);
    }
    order
        .into_iter()
        .filter_map(|conversation_id| groups.remove(&conversation_id))
        .map(|mut group| {
            group.sort_by_key(|trace| trace.trace_id);
            group
        })
        .collect()
}

async fn guarded<F>(call: F) -> Result<Vec<Measurement>, String>
where
    F: Future<Output = Result<Vec<Measurement>, MetricError>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(measurements)) => Ok(measurements),
        Ok(Err(error)) => Err(error.to_string()),
        Err(payload) => Err(format!("metric panicked: {}", panic_message(&*payload))),
    }
}

async fn evaluate_conversation(
    conversation_id: String,
    traces: Vec<Trace>,
    case_run: Option<Arc<CaseRun>>,
    metrics: &[Arc<dyn Metric>],
) -> ConversationMeasurements {
    let mut failures = Vec::new();

    let mut trace_measurements = Vec::with_capacity(traces.len());
    for trace in &traces {
        let mut measurements = Vec::new();
        for metric in metrics {
            match guarded(metric.evaluate_trace(trace)).await {
                Ok(found) => measurements.extend(found),
                Err(error) => {
                    warn!(metric = metric.name(), %conversation_id, trace_id = %trace.trace_id, %error, "metric failed on trace");
                    failures.push(MetricFailure {
                        metric: metric.name().to_string(),
                        trace_id: Some(trace.trace_id),
                        error,
                    });
                }
            }
        }
        trace_measurements.push(TraceMeasurements {
            trace: trace.clone(),
            measurements,
        });
    }

    let mut measurements = Vec::new();
    for metric in metrics {
        match guarded(metric.evaluate_conversation(&traces)).await {
            Ok(found) => measurements.extend(found),
            Err(error) => {
                warn!(metric = metric.name(), %conversation_id, %error, "metric failed on conversation");
                failures.push(MetricFailure {
                    metric: metric.name().to_string(),
                    trace_id: None,
                    error,
                });
            }
        }
    }

    if let Some(case) = case_run.as_ref().map(|run| &run.case) {
        for findings in case.validate(&traces) {
            measurements.push(validation_measurement(findings.into_messages()));
        }
    }

    debug!(
        %conversation_id,
        traces = trace_measurements.len(),
        failures = failures.len(),
        "evaluated conversation"
    );

    ConversationMeasurements {
        conversation_id,
        case_name: case_run.as_ref().map(|run| run.case.name.clone()),
        traces: trace_measurements,
        measurements,
        failures,
        case_run,
    }
}

fn validation_measurement(messages: Vec<String>) -> Measurement {
    if messages.is_empty() {
        Measurement::new("ValidationPassed", 1.0)
            .with_unit(Unit::Count)
            .with_validation(true)
    } else {
        Measurement::new("ValidationFailed", 1.0)
            .with_unit(Unit::Count)
            .with_validation(false)
            .with_info("validation_messages", messages)
    }
}
