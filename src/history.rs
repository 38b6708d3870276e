use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use crate::types::ChatMessage;

/// Append-only message log per `(conversation_id, auth_context)`.
pub trait ConversationHistory: Send + Sync {
    fn add_message(&self, conversation_id: &str, auth_context: Option<&str>, message: ChatMessage);

    fn messages(&self, conversation_id: &str, auth_context: Option<&str>) -> Vec<ChatMessage>;
}

type HistoryKey = (String, Option<String>);

#[derive(Debug, Default)]
pub struct InMemoryConversationHistory {
    conversations: RwLock<HashMap<HistoryKey, Vec<ChatMessage>>>,
}

impl InMemoryConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl ConversationHistory for InMemoryConversationHistory {
    fn add_message(&self, conversation_id: &str, auth_context: Option<&str>, message: ChatMessage) {
        let key = (conversation_id.to_string(), auth_context.map(str::to_string));
        self.conversations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default()
            .push(message);
    }

    fn messages(&self, conversation_id: &str, auth_context: Option<&str>) -> Vec<ChatMessage> {
        let key = (conversation_id.to_string(), auth_context.map(str::to_string));
        self.conversations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }
}
