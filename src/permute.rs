//! Parameter permutations.
//!
//! A permutation marker is any mapping of the form `{"$permute": [..]}`
//! placed anywhere inside a parameter mapping. Expansion replaces every marker
//! with each of its candidates in turn and yields the cartesian product, with
//! markers taken in discovery order and the last one varying fastest.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One concrete set of agent parameters.
pub type Parameters = Map<String, Value>;

pub const PERMUTE_KEY: &str = "$permute";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PermutationError {
    #[error("permutation marker at `{path}` has no candidates")]
    EmptyPermute { path: String },
    #[error("permutation marker at `{path}` contains another permutation marker")]
    NestedPermute { path: String },
    #[error("malformed permutation marker at `{path}`: {reason}")]
    Malformed { path: String, reason: &'static str },
    #[error("agent parameters must be a mapping, got {0}")]
    NotAMapping(&'static str),
}

/// Candidate values for one parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Permute(Vec<Value>);

impl Permute {
    pub fn new<I, T>(candidates: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Self(candidates.into_iter().map(Into::into).collect())
    }

    pub fn candidates(&self) -> &[Value] {
        &self.0
    }
}

impl From<Permute> for Value {
    fn from(permute: Permute) -> Self {
        let mut marker = Map::new();
        marker.insert(PERMUTE_KEY.to_string(), Value::Array(permute.0));
        Value::Object(marker)
    }
}

/// Agent parameters that may still contain permutation markers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentParameters(Parameters);

impl AgentParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn from_value(value: Value) -> Result<Self, PermutationError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(PermutationError::NotAMapping(kind_of(&other))),
        }
    }

    pub fn as_map(&self) -> &Parameters {
        &self.0
    }

    pub fn expand(&self) -> Result<Vec<Parameters>, PermutationError> {
        expand(&self.0)
    }
}

impl From<Parameters> for AgentParameters {
    fn from(parameters: Parameters) -> Self {
        Self(parameters)
    }
}

/// Expands every permutation marker in `parameters`.
///
/// Without markers the result is exactly one mapping equal to the input.
pub fn expand(parameters: &Parameters) -> Result<Vec<Parameters>, PermutationError> {
    expand_map(parameters, "")?
        .into_iter()
        .map(|value| match value {
            Value::Object(map) => Ok(map),
            other => Err(PermutationError::NotAMapping(kind_of(&other))),
        })
        .collect()
}

fn expand_value(value: &Value, path: &str) -> Result<Vec<Value>, PermutationError> {
    match value {
        Value::Object(map) if map.contains_key(PERMUTE_KEY) => expand_marker(map, path),
        Value::Object(map) => expand_map(map, path),
        Value::Array(items) => {
            let options = items
                .iter()
                .enumerate()
                .map(|(index, item)| expand_value(item, &format!("{path}[{index}]")))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(product(options).into_iter().map(Value::Array).collect())
        }
        scalar => Ok(vec![scalar.clone()]),
    }
}

fn expand_map(map: &Parameters, path: &str) -> Result<Vec<Value>, PermutationError> {
    let keys: Vec<&String> = map.keys().collect();
    let options = map
        .iter()
        .map(|(key, value)| expand_value(value, &join(path, key)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(product(options)
        .into_iter()
        .map(|values| {
            let combined: Parameters = keys
                .iter()
                .map(|key| (*key).clone())
                .zip(values)
                .collect();
            Value::Object(combined)
        })
        .collect())
}

fn expand_marker(marker: &Parameters, path: &str) -> Result<Vec<Value>, PermutationError> {
    if marker.len() != 1 {
        return Err(PermutationError::Malformed {
            path: path.to_string(),
            reason: "a marker must not carry other keys",
        });
    }
    let Some(Value::Array(candidates)) = marker.get(PERMUTE_KEY) else {
        return Err(PermutationError::Malformed {
            path: path.to_string(),
            reason: "candidates must be a list",
        });
    };
    if candidates.is_empty() {
        return Err(PermutationError::EmptyPermute {
            path: path.to_string(),
        });
    }
    if candidates.iter().any(contains_marker) {
        return Err(PermutationError::NestedPermute {
            path: path.to_string(),
        });
    }
    Ok(candidates.clone())
}

fn contains_marker(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.contains_key(PERMUTE_KEY) || map.values().any(contains_marker),
        Value::Array(items) => items.iter().any(contains_marker),
        _ => false,
    }
}

/// Cartesian product; the first list varies slowest.
fn product(options: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
    options.into_iter().fold(vec![Vec::new()], |acc, candidates| {
        acc.iter()
            .flat_map(|prefix| {
                candidates.iter().map(move |candidate| {
                    let mut combination = prefix.clone();
                    combination.push(candidate.clone());
                    combination
                })
            })
            .collect()
    })
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn expands_cartesian_product_last_marker_fastest() {
        let parameters = AgentParameters::new()
            .with("model_id", Permute::new(["haiku", "sonnet"]))
            .with("instructions", "be brief")
            .with("temperature", Permute::new([0.0, 0.5, 1.0]));

        let expanded = parameters.expand().unwrap();
        assert_eq!(expanded.len(), 6);

        let pairs: Vec<(String, f64)> = expanded
            .iter()
            .map(|p| {
                (
                    p["model_id"].as_str().unwrap().to_string(),
                    p["temperature"].as_f64().unwrap(),
                )
            })
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("haiku".into(), 0.0),
                ("haiku".into(), 0.5),
                ("haiku".into(), 1.0),
                ("sonnet".into(), 0.0),
                ("sonnet".into(), 0.5),
                ("sonnet".into(), 1.0),
            ]
        );
        assert!(expanded.iter().all(|p| p["instructions"] == "be brief"));
        let keys: Vec<&str> = expanded[0].keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["model_id", "instructions", "temperature"]);
    }

    #[test]
    fn without_markers_yields_the_input_once() {
        let parameters = AgentParameters::new()
            .with("model_id", "haiku")
            .with("tools", json!(["a", "b"]));
        let expanded = parameters.expand().unwrap();
        assert_eq!(expanded, vec![parameters.as_map().clone()]);

        assert_eq!(expand(&Parameters::new()).unwrap(), vec![Parameters::new()]);
    }

    #[test]
    fn finds_markers_inside_nested_mappings_and_lists() {
        let value = json!({
            "model": { "id": { "$permute": ["haiku", "sonnet"] }, "region": "eu" },
            "tools": ["search", { "$permute": ["calc", "clock"] }]
        });
        let expanded = AgentParameters::from_value(value).unwrap().expand().unwrap();
        assert_eq!(expanded.len(), 4);
        assert_eq!(expanded[0]["model"], json!({"id": "haiku", "region": "eu"}));
        assert_eq!(expanded[1]["tools"], json!(["search", "clock"]));
        assert_eq!(expanded[3]["model"]["id"], "sonnet");
    }

    #[test]
    fn rejects_malformed_markers() {
        let nested = json!({ "a": { "$permute": [1, { "$permute": [2, 3] }] } });
        assert_eq!(
            AgentParameters::from_value(nested).unwrap().expand(),
            Err(PermutationError::NestedPermute { path: "a".into() })
        );

        let empty = AgentParameters::new().with("b", Permute::new(Vec::<Value>::new()));
        assert_eq!(
            empty.expand(),
            Err(PermutationError::EmptyPermute { path: "b".into() })
        );

        let not_a_list = json!({ "c": { "$permute": "x" } });
        assert!(matches!(
            AgentParameters::from_value(not_a_list).unwrap().expand(),
            Err(PermutationError::Malformed { .. })
        ));

        assert_eq!(
            AgentParameters::from_value(json!([1, 2])),
            Err(PermutationError::NotAMapping("a list"))
        );
    }

    #[test]
    fn reads_markers_from_yaml() {
        let yaml = "model_id:\n  $permute: [haiku, sonnet]\ntemperature: 0.2\n";
        let parameters: AgentParameters = serde_yaml::from_str(yaml).unwrap();
        let expanded = parameters.expand().unwrap();
        assert_eq!(expanded.len(), 2);
        assert_eq!(expanded[1]["model_id"], "sonnet");
    }
}
