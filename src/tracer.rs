use std::{
    collections::VecDeque,
    sync::{Arc, PoisonError, RwLock},
};

use crate::trace::Trace;

/// Sink for traces, with a read path per conversation.
pub trait Tracer: Send + Sync {
    fn persist(&self, trace: Trace);

    /// Traces of one conversation, ordered by trace id.
    fn get_traces(&self, conversation_id: &str, auth_context: Option<&str>) -> Vec<Trace>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn persist(&self, _trace: Trace) {}

    fn get_traces(&self, _conversation_id: &str, _auth_context: Option<&str>) -> Vec<Trace> {
        Vec::new()
    }
}

/// Keeps the most recent `memory_size` traces.
#[derive(Debug)]
pub struct InMemoryTracer {
    memory_size: usize,
    memory: RwLock<VecDeque<Trace>>,
}

impl InMemoryTracer {
    pub fn new() -> Self {
        Self::with_memory_size(1000)
    }

    pub fn with_memory_size(memory_size: usize) -> Self {
        let memory_size = memory_size.max(1);
        Self {
            memory_size,
            memory: RwLock::new(VecDeque::with_capacity(memory_size.min(1024))),
        }
    }

    pub fn len(&self) -> usize {
        self.memory.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer for InMemoryTracer {
    fn persist(&self, trace: Trace) {
        let mut memory = self.memory.write().unwrap_or_else(PoisonError::into_inner);
        if memory.len() == self.memory_size {
            memory.pop_front();
        }
        memory.push_back(trace);
    }

    fn get_traces(&self, conversation_id: &str, auth_context: Option<&str>) -> Vec<Trace> {
        let memory = self.memory.read().unwrap_or_else(PoisonError::into_inner);
        let mut traces: Vec<Trace> = memory
            .iter()
            .filter(|trace| {
                trace.conversation_id == conversation_id && trace.auth_context.as_deref() == auth_context
            })
            .cloned()
            .collect();
        traces.sort_by(|a, b| a.trace_id.cmp(&b.trace_id));
        traces
    }
}

/// Emits every persisted trace as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTracer;

impl Tracer for LogTracer {
    fn persist(&self, trace: Trace) {
        match serde_json::to_string(&trace) {
            Ok(json) => tracing::info!(
                target: "pruefwerk::trace",
                conversation_id = %trace.conversation_id,
                trace_id = %trace.trace_id,
                to = %trace.to(),
                trace = %json,
                "Trace"
            ),
            Err(error) => tracing::warn!(
                target: "pruefwerk::trace",
                trace_id = %trace.trace_id,
                %error,
                "failed to serialize trace"
            ),
        }
    }

    fn get_traces(&self, _conversation_id: &str, _auth_context: Option<&str>) -> Vec<Trace> {
        Vec::new()
    }
}

/// Fans traces out to several tracers; reads come from the first one.
#[derive(Default, Clone)]
pub struct TeeTracer {
    tracers: Vec<Arc<dyn Tracer>>,
}

impl TeeTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracers.push(tracer);
        self
    }
}

impl Tracer for TeeTracer {
    fn persist(&self, trace: Trace) {
        if let Some((last, rest)) = self.tracers.split_last() {
            for tracer in rest {
                tracer.persist(trace.clone());
            }
            last.persist(trace);
        }
    }

    fn get_traces(&self, conversation_id: &str, auth_context: Option<&str>) -> Vec<Trace> {
        self.tracers
            .first()
            .map(|tracer| tracer.get_traces(conversation_id, auth_context))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{ToolRequest, ToolResponse};

    fn tool_trace(conversation_id: &str, auth_context: Option<&str>) -> Trace {
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
                latency_ms: 1,
            },
        )
        .with_auth_context(auth_context.map(str::to_string))
    }

    #[test]
    fn filters_by_conversation_and_auth_context() {
        let tracer = InMemoryTracer::new();
        tracer.persist(tool_trace("c1", None));
        tracer.persist(tool_trace("c1", Some("alice")));
        tracer.persist(tool_trace("c2", None));
        tracer.persist(tool_trace("c1", None));

        let traces = tracer.get_traces("c1", None);
        assert_eq!(traces.len(), 2);
        assert!(traces[0].trace_id < traces[1].trace_id);
        assert_eq!(tracer.get_traces("c1", Some("alice")).len(), 1);
    }

    #[test]
    fn evicts_oldest_beyond_memory_size() {
        let tracer = InMemoryTracer::with_memory_size(2);
        let first = tool_trace("c1", None);
        let first_id = first.trace_id;
        tracer.persist(first);
        tracer.persist(tool_trace("c1", None));
        tracer.persist(tool_trace("c1", None));

        let traces = tracer.get_traces("c1", None);
        assert_eq!(traces.len(), 2);
        assert!(traces.iter().all(|trace| trace.trace_id != first_id));
    }

    #[test]
    fn tee_writes_everywhere_and_reads_first() {
        let primary = Arc::new(InMemoryTracer::new());
        let secondary = Arc::new(InMemoryTracer::new());
        let tee = TeeTracer::new()
            .with_tracer(primary.clone())
            .with_tracer(Arc::new(LogTracer))
            .with_tracer(secondary.clone());

        tee.persist(tool_trace("c1", None));
        assert_eq!(primary.len(), 1);
        assert_eq!(secondary.len(), 1);
        assert_eq!(tee.get_traces("c1", None).len(), 1);
        assert!(NoopTracer.get_traces("c1", None).is_empty());
    }
}
