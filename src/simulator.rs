use std::{fmt, sync::Arc};

use async_trait::async_trait;

use crate::{
    case::UserInputProducer,
    types::{ChatMessage, CompletionRequest, MessageRole},
    LLMError, LLMProvider,
};

const DEFAULT_END_TOKEN: &str = "STOP";

/// A user input producer that lets an LLM play the user.
///
/// The model sees the conversation with roles swapped, so the agent's
/// replies arrive as user messages. Answering with the end token, or reaching
/// the configured number of turns, ends the conversation.
pub struct LlmUserSimulator {
    provider: Arc<dyn LLMProvider>,
    model: String,
    persona: String,
    end_token: String,
    max_turns: Option<usize>,
    temperature: Option<f32>,
}

impl fmt::Debug for LlmUserSimulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmUserSimulator")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("end_token", &self.end_token)
            .field("max_turns", &self.max_turns)
            .finish()
    }
}

impl LlmUserSimulator {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>, persona: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            persona: persona.into(),
            end_token: DEFAULT_END_TOKEN.to_string(),
            max_turns: None,
            temperature: None,
        }
    }

    pub fn with_end_token(mut self, end_token: impl Into<String>) -> Self {
        self.end_token = end_token.into();
        self
    }

    /// Ends the conversation once this many user messages have been sent.
    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = Some(max_turns);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    fn system_prompt(&self) -> String {
        format!(
            "You are simulating a user talking to an AI assistant.\n\
             {}\n\
             Reply with the next message the user would send, and nothing else.\n\
             Once the user has nothing more to ask, reply with only: {}",
            self.persona, self.end_token
        )
    }

    fn swapped(messages: &[ChatMessage]) -> Vec<ChatMessage> {
        messages
            .iter()
            .filter_map(|message| {
                let text = message.text()?.trim();
                if text.is_empty() {
                    return None;
                }
                match message.role {
                    MessageRole::User => Some(ChatMessage::assistant(text)),
                    MessageRole::Assistant => Some(ChatMessage::user(text)),
                    MessageRole::System | MessageRole::Tool => None,
                }
            })
            .collect()
    }
}

#[async_trait]
impl UserInputProducer for LlmUserSimulator {
    async fn next_input(&self, messages: &[ChatMessage]) -> Result<String, LLMError> {
        let turns_taken = messages
            .iter()
            .filter(|message| message.role == MessageRole::User)
            .count();
        if self.max_turns.is_some_and(|max| turns_taken >= max) {
            return Ok(String::new());
        }

        let mut conversation = vec![ChatMessage::system(self.system_prompt())];
        let swapped = Self::swapped(messages);
        if swapped.first().map_or(true, |first| first.role != MessageRole::User) {
            conversation.push(ChatMessage::user("Start the conversation."));
        }
        conversation.extend(swapped);

        let mut request = CompletionRequest::new(self.model.clone(), conversation);
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        let response = self.provider.complete(request).await?;
        let text = response.message.text().unwrap_or_default().trim();

        if text.is_empty() || text == self.end_token {
            tracing::debug!(turns_taken, "simulated user ended the conversation");
            return Ok(String::new());
        }
        Ok(text.to_string())
    }
}
