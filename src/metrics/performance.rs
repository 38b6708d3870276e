use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Measurement, Metric, MetricError, Unit};
use crate::trace::{Trace, TraceTo};

/// Latency of every LLM and tool call, tagged with dimension `To`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LatencyMetric;

#[async_trait]
impl Metric for LatencyMetric {
    fn name(&self) -> &str {
        "LatencyMetric"
    }

    async fn evaluate_trace(&self, trace: &Trace) -> Result<Vec<Measurement>, MetricError> {
        let mut measurement = Measurement::new("Latency", trace.latency().as_millis() as f64)
            .with_unit(Unit::Milliseconds)
            .with_dimension("To", trace.to().to_string());
        if let Some(tool_name) = trace.tool_name() {
            measurement = measurement.with_dimension("ToolName", tool_name);
        }
        Ok(vec![measurement])
    }
}

/// Input and output token counts of LLM calls that report usage.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokensMetric;

#[async_trait]
impl Metric for TokensMetric {
    fn name(&self) -> &str {
        "TokensMetric"
    }

    async fn evaluate_trace(&self, trace: &Trace) -> Result<Vec<Measurement>, MetricError> {
        let Some(usage) = trace.token_usage() else {
            return Ok(Vec::new());
        };
        let model = trace.model().unwrap_or_default().to_string();
        Ok(vec![
            Measurement::new("NrOfInputTokens", f64::from(usage.prompt_tokens))
                .with_unit(Unit::Count)
                .with_dimension("ModelId", model.clone()),
            Measurement::new("NrOfOutputTokens", f64::from(usage.completion_tokens))
                .with_unit(Unit::Count)
                .with_dimension("ModelId", model),
        ])
    }
}

/// Price per 1000 tokens, in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl ModelPricing {
    pub fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }
}

/// Estimated cost of each LLM call, from a per-model pricing table.
///
/// LLM calls to a model missing from the table fail the metric for that trace.
#[derive(Debug, Default, Clone)]
pub struct CostMetric {
    pricing: HashMap<String, ModelPricing>,
}

impl CostMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pricing(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.pricing.insert(model.into(), pricing);
        self
    }
}

#[async_trait]
impl Metric for CostMetric {
    fn name(&self) -> &str {
        "CostMetric"
    }

    async fn evaluate_trace(&self, trace: &Trace) -> Result<Vec<Measurement>, MetricError> {
        let (Some(model), Some(usage)) = (trace.model(), trace.token_usage()) else {
            return Ok(Vec::new());
        };
        let pricing = self
            .pricing
            .get(model)
            .ok_or_else(|| MetricError::UnknownPricing(model.to_string()))?;

        let cost = f64::from(usage.prompt_tokens) / 1000.0 * pricing.input_per_1k
            + f64::from(usage.completion_tokens) / 1000.0 * pricing.output_per_1k;
        Ok(vec![Measurement::new("Cost", cost)
            .with_unit(Unit::Usd)
            .with_dimension("ModelId", model)])
    }
}

/// Length in characters of the text the agent produced in an LLM call.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResponseLengthMetric;

#[async_trait]
impl Metric for ResponseLengthMetric {
    fn name(&self) -> &str {
        "ResponseLengthMetric"
    }

    async fn evaluate_trace(&self, trace: &Trace) -> Result<Vec<Measurement>, MetricError> {
        if trace.to() != TraceTo::Llm {
            return Ok(Vec::new());
        }
        let Some(text) = trace.agent_text() else {
            return Ok(Vec::new());
        };
        Ok(vec![
            Measurement::new("ResponseLength", text.chars().count() as f64).with_unit(Unit::Count)
        ])
    }
}
