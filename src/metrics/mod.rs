use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{trace::Trace, LLMError};

pub mod bleu;
pub mod expectation;
pub mod performance;

pub use bleu::BleuMetric;
pub use expectation::ConversationExpectationMetric;
pub use performance::{CostMetric, LatencyMetric, ModelPricing, ResponseLengthMetric, TokensMetric};

/// Unit a measurement value is expressed in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    Count,
    Milliseconds,
    Seconds,
    Percent,
    Bytes,
    Usd,
    #[default]
    None,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self {
            Unit::Count => "Count",
            Unit::Milliseconds => "Milliseconds",
            Unit::Seconds => "Seconds",
            Unit::Percent => "Percent",
            Unit::Bytes => "Bytes",
            Unit::Usd => "USD",
            Unit::None => "None",
        };
        f.write_str(unit)
    }
}

/// Key/value tag attached to a measurement
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

impl Dimension {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A single value produced by a metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Measurement name, used to group values in summaries
    pub name: String,
    /// Numeric value
    pub value: f64,
    /// Unit of `value`
    #[serde(default)]
    pub unit: Unit,
    /// Free-form details, e.g. validator messages or judge reasoning
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub additional_info: Map<String, Value>,
    /// Ordered tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dimensions: Vec<Dimension>,
    /// `Some(false)` marks the conversation as failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_passed: Option<bool>,
}

impl Measurement {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            unit: Unit::None,
            additional_info: Map::new(),
            dimensions: Vec::new(),
            validation_passed: None,
        }
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = unit;
        self
    }

    pub fn with_dimension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.push(Dimension::new(name, value));
        self
    }

    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.additional_info.insert(key.into(), value.into());
        self
    }

    pub fn with_validation(mut self, passed: bool) -> Self {
        self.validation_passed = Some(passed);
        self
    }

    pub fn dimension(&self, name: &str) -> Option<&str> {
        self.dimensions
            .iter()
            .find(|dimension| dimension.name == name)
            .map(|dimension| dimension.value.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetricError {
    #[error(transparent)]
    Provider(#[from] LLMError),
    #[error("no pricing configured for model `{0}`")]
    UnknownPricing(String),
    #[error("{0}")]
    Failed(String),
}

/// Scores traces or whole conversations.
///
/// Both hooks default to "not applicable". Instances are shared across
/// conversations and called one conversation at a time.
#[async_trait]
pub trait Metric: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate_trace(&self, _trace: &Trace) -> Result<Vec<Measurement>, MetricError> {
        Ok(Vec::new())
    }

    /// `traces` are the conversation's traces in creation order.
    async fn evaluate_conversation(&self, _traces: &[Trace]) -> Result<Vec<Measurement>, MetricError> {
        Ok(Vec::new())
    }
}
