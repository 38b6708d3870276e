use std::{
    any::Any,
    fmt, fs,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::{
    agent::{AgentError, ConversationalAgent, ConverseOptions},
    trace::{Trace, TraceId},
    types::ChatMessage,
    LLMError,
};

#[derive(Debug, thiserror::Error)]
pub enum CaseError {
    #[error("case `{case}` failed on turn {turn}: {source}")]
    Agent {
        case: String,
        turn: usize,
        #[source]
        source: AgentError,
    },
    #[error("user input producer of case `{case}` failed: {source}")]
    Producer {
        case: String,
        #[source]
        source: LLMError,
    },
}

/// Supplies the next user input once a case's fixed inputs are used up.
///
/// Returning an empty string ends the conversation.
#[async_trait]
pub trait UserInputProducer: Send + Sync {
    async fn next_input(&self, messages: &[ChatMessage]) -> Result<String, LLMError>;
}

#[async_trait]
impl<F> UserInputProducer for F
where
    F: Fn(&[ChatMessage]) -> String + Send + Sync,
{
    async fn next_input(&self, messages: &[ChatMessage]) -> Result<String, LLMError> {
        Ok(self(messages))
    }
}

/// Messages a validator reports about a conversation; empty means it passed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Findings(Vec<String>);

impl Findings {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn messages(&self) -> &[String] {
        &self.0
    }

    pub fn into_messages(self) -> Vec<String> {
        self.0
    }
}

impl From<()> for Findings {
    fn from(_: ()) -> Self {
        Self::none()
    }
}

// Empty messages are not findings.
impl From<String> for Findings {
    fn from(message: String) -> Self {
        Self::from(vec![message])
    }
}

impl From<&str> for Findings {
    fn from(message: &str) -> Self {
        Self::from(message.to_string())
    }
}

impl From<Option<String>> for Findings {
    fn from(message: Option<String>) -> Self {
        Self::from(message.into_iter().collect::<Vec<_>>())
    }
}

impl From<Vec<String>> for Findings {
    fn from(mut messages: Vec<String>) -> Self {
        messages.retain(|message| !message.is_empty());
        Self(messages)
    }
}

impl<T, E> From<Result<T, E>> for Findings
where
    T: Into<Findings>,
    E: fmt::Display,
{
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(findings) => findings.into(),
            Err(error) => Self(vec![error.to_string()]),
        }
    }
}

pub type Validator = Arc<dyn Fn(&[Trace]) -> Findings + Send + Sync>;

/// A scripted or open-ended conversation to hold with an agent.
#[derive(Clone, Default)]
pub struct Case {
    pub name: String,
    pub user_inputs: Vec<String>,
    pub user_input_producer: Option<Arc<dyn UserInputProducer>>,
    pub overall_expectations: Option<String>,
    /// Accepted agent responses, one list per entry of `user_inputs`.
    pub expected_agent_responses_per_turn: Vec<Vec<String>>,
    pub validators: Vec<Validator>,
    pub converse_options: ConverseOptions,
}

impl fmt::Debug for Case {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Case")
            .field("name", &self.name)
            .field("user_inputs", &self.user_inputs)
            .field("has_user_input_producer", &self.user_input_producer.is_some())
            .field("overall_expectations", &self.overall_expectations)
            .field(
                "expected_agent_responses_per_turn",
                &self.expected_agent_responses_per_turn,
            )
            .field("validators", &self.validators.len())
            .field("converse_options", &self.converse_options)
            .finish()
    }
}

impl Case {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_user_input(mut self, input: impl Into<String>) -> Self {
        self.user_inputs.push(input.into());
        self.expected_agent_responses_per_turn.push(Vec::new());
        self
    }

    /// Appends a user input together with the agent responses accepted for it.
    pub fn add_turn<I, S>(mut self, input: impl Into<String>, expected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.user_inputs.push(input.into());
        self.expected_agent_responses_per_turn
            .push(expected.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_user_input_producer(mut self, producer: impl UserInputProducer + 'static) -> Self {
        self.user_input_producer = Some(Arc::new(producer));
        self
    }

    pub fn with_overall_expectations(mut self, expectations: impl Into<String>) -> Self {
        self.overall_expectations = Some(expectations.into());
        self
    }

    pub fn with_validator<F, R>(mut self, validator: F) -> Self
    where
        F: Fn(&[Trace]) -> R + Send + Sync + 'static,
        R: Into<Findings>,
    {
        self.validators
            .push(Arc::new(move |traces: &[Trace]| -> Findings { validator(traces).into() }));
        self
    }

    pub fn with_converse_options(mut self, options: ConverseOptions) -> Self {
        self.converse_options = options;
        self
    }

    pub fn has_expected_responses(&self) -> bool {
        self.expected_agent_responses_per_turn
            .iter()
            .any(|expected| !expected.is_empty())
    }

    /// Runs every validator; a panicking validator counts as a finding.
    pub fn validate(&self, traces: &[Trace]) -> Vec<Findings> {
        self.validators
            .iter()
            .map(|validator| {
                panic::catch_unwind(AssertUnwindSafe(|| validator(traces)))
                    .unwrap_or_else(|payload| {
                        Findings::from(format!("validator panicked: {}", panic_message(&*payload)))
                    })
            })
            .collect()
    }

    /// Holds the conversation in a fresh conversation of `agent`.
    pub async fn run<A>(&self, agent: &mut A) -> Result<Vec<Trace>, CaseError>
    where
        A: ConversationalAgent + ?Sized,
    {
        agent.reset();
        self.converse(agent).await
    }

    /// Like [`Case::run`], but continues under a caller chosen conversation id.
    pub async fn run_in_conversation<A>(
        &self,
        agent: &mut A,
        conversation_id: impl Into<String>,
    ) -> Result<Vec<Trace>, CaseError>
    where
        A: ConversationalAgent + ?Sized,
    {
        agent.reset();
        agent.set_conversation_id(conversation_id.into());
        self.converse(agent).await
    }

    async fn converse<A>(&self, agent: &mut A) -> Result<Vec<Trace>, CaseError>
    where
        A: ConversationalAgent + ?Sized,
    {
        let mut traces = Vec::new();
        let mut last_seen: Option<TraceId> = None;
        let mut fixed_inputs = self.user_inputs.iter();
        let mut turn = 0;

        loop {
            let input = match fixed_inputs.next() {
                Some(input) => input.clone(),
                None => match &self.user_input_producer {
                    Some(producer) => {
                        let messages = agent.messages();
                        let input = producer.next_input(&messages).await.map_err(|source| {
                            CaseError::Producer {
                                case: self.name.clone(),
                                source,
                            }
                        })?;
                        if input.is_empty() {
                            break;
                        }
                        input
                    }
                    None => break,
                },
            };

            turn += 1;
            debug!(case = %self.name, conversation_id = %agent.conversation_id(), turn, "user turn");
            agent
                .converse(&input, &self.converse_options)
                .await
                .map_err(|source| CaseError::Agent {
                    case: self.name.clone(),
                    turn,
                    source,
                })?;

            let new_traces: Vec<Trace> = agent
                .traces()
                .into_iter()
                .filter(|trace| last_seen.map_or(true, |seen| trace.trace_id > seen))
                .collect();
            if let Some(last) = new_traces.last() {
                last_seen = Some(last.trace_id);
            }
            traces.extend(new_traces);
        }

        Ok(traces)
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaseFileError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Deserialize)]
struct CaseFile {
    name: String,
    #[serde(default)]
    user_inputs: Vec<String>,
    #[serde(default)]
    turns: Vec<TurnFile>,
    #[serde(default)]
    overall_expectations: Option<String>,
    #[serde(default)]
    converse_options: ConverseOptions,
}

#[derive(Debug, Deserialize)]
struct TurnFile {
    user: String,
    #[serde(default)]
    expected: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CaseDocument {
    Many(Vec<CaseFile>),
    One(CaseFile),
}

impl From<CaseFile> for Case {
    fn from(file: CaseFile) -> Self {
        let mut case = Case::new(file.name).with_converse_options(file.converse_options);
        for input in file.user_inputs {
            case = case.with_user_input(input);
        }
        for turn in file.turns {
            case = case.add_turn(turn.user, turn.expected);
        }
        case.overall_expectations = file.overall_expectations;
        case
    }
}

/// Loads cases from one YAML/JSON file or from every such file in a directory.
///
/// A file holds either one case or a list of cases. Directory contents are
/// returned sorted by case name.
pub fn load_cases(path: impl AsRef<Path>) -> Result<Vec<Case>, CaseFileError> {
    let path = path.as_ref();
    if !path.is_dir() {
        return load_case_file(path);
    }

    let entries = fs::read_dir(path).map_err(|source| CaseFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cases = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| CaseFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file = entry.path();
        let ext = file.extension().and_then(|s| s.to_str()).unwrap_or("");
        if matches!(ext, "yaml" | "yml" | "json") {
            cases.extend(load_case_file(&file)?);
        }
    }
    cases.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(cases)
}

fn load_case_file(path: &Path) -> Result<Vec<Case>, CaseFileError> {
    let bytes = fs::read(path).map_err(|source| CaseFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    let document: CaseDocument = if ext == "json" {
        serde_json::from_slice(&bytes).map_err(|source| CaseFileError::Json {
            path: path.to_path_buf(),
            source,
        })?
    } else {
        serde_yaml::from_slice(&bytes).map_err(|source| CaseFileError::Yaml {
            path: path.to_path_buf(),
            source,
        })?
    };

    Ok(match document {
        CaseDocument::Many(files) => files.into_iter().map(Case::from).collect(),
        CaseDocument::One(file) => vec![Case::from(file)],
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        agent::ToolAgent,
        providers::scripted::{ScriptedProvider, ScriptedResponse},
        types::MessageRole,
    };

    fn agent(replies: &[&str]) -> ToolAgent {
        ToolAgent::new("test", Arc::new(ScriptedProvider::from_texts(replies.iter().copied())), "scripted")
    }

    #[tokio::test]
    async fn runs_fixed_inputs_then_producer_until_empty() {
        let produced = Arc::new(AtomicUsize::new(0));
        let counter = produced.clone();
        let case = Case::new("weather")
            .add_turn("Hi", ["Hello"])
            .with_user_input("How is the weather?")
            .with_user_input_producer(move |messages: &[ChatMessage]| {
                assert!(messages.iter().any(|m| m.role == MessageRole::Assistant));
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    "And tomorrow?".to_string()
                } else {
                    String::new()
                }
            });

        let mut agent = agent(&["Hello", "Sunny", "Rainy"]);
        let traces = case.run(&mut agent).await.unwrap();

        assert_eq!(traces.len(), 3);
        assert_eq!(produced.load(Ordering::SeqCst), 2);
        let replies: Vec<&str> = traces.iter().filter_map(Trace::agent_text).collect();
        assert_eq!(replies, vec!["Hello", "Sunny", "Rainy"]);
        assert_eq!(case.expected_agent_responses_per_turn, vec![vec!["Hello".to_string()], vec![]]);
    }

    #[tokio::test]
    async fn each_run_is_a_fresh_conversation_unless_pinned() {
        let case = Case::new("greeting").with_user_input("Hi");
        let mut agent = agent(&["one", "two", "three"]);

        let first = case.run(&mut agent).await.unwrap();
        let second = case.run(&mut agent).await.unwrap();
        assert_ne!(first[0].conversation_id, second[0].conversation_id);
        assert_eq!(second.len(), 1);

        let pinned = case.run_in_conversation(&mut agent, "fixed-id").await.unwrap();
        assert_eq!(pinned[0].conversation_id, "fixed-id");
    }

    #[tokio::test]
    async fn agent_errors_propagate() {
        let case = Case::new("broken").with_user_input("Hi").with_user_input("Again");
        let provider = ScriptedProvider::new()
            .with_response(ScriptedResponse::text("ok"))
            .with_response(ScriptedResponse::error("throttled"));
        let mut agent = ToolAgent::new("test", Arc::new(provider), "scripted");

        let err = case.run(&mut agent).await.unwrap_err();
        assert!(matches!(err, CaseError::Agent { turn: 2, .. }));
    }

    #[test]
    fn validators_report_findings_and_panics() {
        let case = Case::new("validated")
            .with_validator(|_: &[Trace]| ())
            .with_validator(|_: &[Trace]| "")
            .with_validator(|traces: &[Trace]| format!("saw {} traces", traces.len()))
            .with_validator(|_: &[Trace]| -> Result<(), String> { Err("no greeting".into()) })
            .with_validator(|_: &[Trace]| -> Findings { panic!("boom") });

        let findings = case.validate(&[]);
        assert!(findings[0].is_empty());
        assert!(findings[1].is_empty());
        assert_eq!(findings[2].messages(), ["saw 0 traces"]);
        assert_eq!(findings[3].messages(), ["no greeting"]);
        assert_eq!(findings[4].messages(), ["validator panicked: boom"]);
    }

    #[test]
    fn loads_cases_from_yaml_and_json() {
        let dir = std::env::temp_dir().join(format!("pruefwerk-cases-{}", ulid::Ulid::new()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("b.yaml"),
            "name: sky\nturns:\n  - user: what color is the sky\n    expected: [blue]\noverall_expectations: Mentions blue\n",
        )
        .unwrap();
        fs::write(
            dir.join("a.json"),
            r#"[{"name": "weather", "user_inputs": ["Hi"], "converse_options": {"tools": []}}]"#,
        )
        .unwrap();
        fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let cases = load_cases(&dir).unwrap();
        fs::remove_dir_all(&dir).unwrap();

        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].name, "sky");
        assert_eq!(cases[0].expected_agent_responses_per_turn, vec![vec!["blue".to_string()]]);
        assert_eq!(cases[0].overall_expectations.as_deref(), Some("Mentions blue"));
        assert_eq!(cases[1].name, "weather");
        assert_eq!(cases[1].converse_options, ConverseOptions::without_tools());
    }
}
