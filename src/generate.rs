use std::{ops::Deref, pin::Pin, sync::Arc, thread, time::Instant};

use futures_core::Stream;
use futures_util::{stream, StreamExt};
use tracing::{debug, info};

use crate::{
    agent::{AgentError, ConversationalAgent},
    case::{panic_message, Case, CaseError},
    permute::{AgentParameters, Parameters, PermutationError},
    trace::{CaseRun, Trace},
};

/// Why one case run produced no traces.
#[derive(Debug, thiserror::Error)]
pub enum CaseRunFailure {
    #[error("agent factory failed: {0}")]
    AgentFactory(#[source] AgentError),
    #[error(transparent)]
    Case(CaseError),
    #[error("case run panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, thiserror::Error)]
#[error(
    "case `{}` (case {}, run {}) failed: {}",
    .case_run.case.name,
    .case_run.case_nr,
    .case_run.run_nr,
    .failure
)]
pub struct GenerateError {
    pub case_run: Arc<CaseRun>,
    #[source]
    pub failure: CaseRunFailure,
}

impl GenerateError {
    fn new(case_run: Arc<CaseRun>, failure: CaseRunFailure) -> Self {
        Self { case_run, failure }
    }
}

/// The traces of one successful case run, in emission order. A run may
/// leave no traces at all; it still carries its provenance.
#[derive(Debug, Clone)]
pub struct CaseRunTraces {
    pub case_run: Arc<CaseRun>,
    /// The conversation the agent held the case in.
    pub conversation_id: String,
    pub traces: Vec<Trace>,
}

impl Deref for CaseRunTraces {
    type Target = [Trace];

    fn deref(&self) -> &[Trace] {
        &self.traces
    }
}

pub type TraceStream = Pin<Box<dyn Stream<Item = Result<CaseRunTraces, GenerateError>> + Send>>;

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub nr_runs_per_case: usize,
    /// Upper bound on case runs in flight at once.
    pub max_case_workers: usize,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            nr_runs_per_case: 1,
            max_case_workers: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl GenerateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nr_runs_per_case(mut self, nr_runs_per_case: usize) -> Self {
        self.nr_runs_per_case = nr_runs_per_case;
        self
    }

    pub fn with_max_case_workers(mut self, max_case_workers: usize) -> Self {
        self.max_case_workers = max_case_workers.max(1);
        self
    }
}

/// Runs every case `nr_runs_per_case` times for every expanded permutation of
/// `agent_parameters`, each time against a fresh agent from `agent_factory`.
///
/// The returned stream yields one trace list per case run, in case, run,
/// permutation order, regardless of completion order. Nothing runs until the
/// stream is polled; a failed case run is reported at its own position and
/// leaves the others untouched. Must be polled inside a tokio runtime.
pub fn generate_traces<A, F, I>(
    cases: I,
    agent_factory: F,
    agent_parameters: &AgentParameters,
    options: GenerateOptions,
) -> Result<TraceStream, PermutationError>
where
    I: IntoIterator<Item = Case>,
    A: ConversationalAgent + 'static,
    F: Fn(&Parameters) -> Result<A, AgentError> + Send + Sync + 'static,
{
    let permutations: Vec<Arc<Parameters>> = agent_parameters
        .expand()?
        .into_iter()
        .map(Arc::new)
        .collect();

    let mut units = Vec::new();
    for (case_nr, case) in cases.into_iter().enumerate() {
        let case = Arc::new(case);
        for run_nr in 0..options.nr_runs_per_case {
            for permutation in &permutations {
                units.push(Arc::new(CaseRun {
                    case: case.clone(),
                    case_nr,
                    run_nr,
                    permutation: permutation.clone(),
                }));
            }
        }
    }

    info!(
        case_runs = units.len(),
        permutations = permutations.len(),
        max_case_workers = options.max_case_workers,
        "generating traces"
    );

    let agent_factory = Arc::new(agent_factory);
    let workers = options.max_case_workers.max(1);
    let traces = stream::iter(units)
        .map(move |case_run| {
            let handle = tokio::spawn(run_case(case_run.clone(), agent_factory.clone()));
            async move {
                match handle.await {
                    Ok(result) => result,
                    Err(join_error) => {
                        let message = match join_error.try_into_panic() {
                            Ok(payload) => panic_message(&*payload),
                            Err(join_error) => join_error.to_string(),
                        };
                        Err(GenerateError::new(case_run, CaseRunFailure::Panicked(message)))
                    }
                }
            }
        })
        .buffered(workers);

    Ok(Box::pin(traces))
}

async fn run_case<A, F>(case_run: Arc<CaseRun>, agent_factory: Arc<F>) -> Result<CaseRunTraces, GenerateError>
where
    A: ConversationalAgent + 'static,
    F: Fn(&Parameters) -> Result<A, AgentError> + Send + Sync + 'static,
{
    let started = Instant::now();
    debug!(
        case = %case_run.case.name,
        case_nr = case_run.case_nr,
        run_nr = case_run.run_nr,
        "starting case run"
    );

    let mut agent = agent_factory(&case_run.permutation)
        .map_err(|error| GenerateError::new(case_run.clone(), CaseRunFailure::AgentFactory(error)))?;
    let traces = case_run
        .case
        .run(&mut agent)
        .await
        .map_err(|error| GenerateError::new(case_run.clone(), CaseRunFailure::Case(error)))?;

    debug!(
        case = %case_run.case.name,
        case_nr = case_run.case_nr,
        run_nr = case_run.run_nr,
        traces = traces.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "finished case run"
    );

    let traces = traces
        .into_iter()
        .map(|trace| trace.with_case_run(case_run.clone()))
        .collect();
    Ok(CaseRunTraces {
        conversation_id: agent.conversation_id().to_string(),
        case_run,
        traces,
    })
}
