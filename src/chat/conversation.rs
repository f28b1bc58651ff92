use serde::Serialize;

use crate::types::{ChatHistoryEntry, ConversationTurn, Role};

/// Ordered history of one chat: user and assistant turns, alternating.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Conversation {
    turns: Vec<ConversationTurn>,
}

impl Conversation {
    /// Creates an empty conversation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a completed exchange: the user's message, then the assistant's answer.
    pub fn record_exchange(&mut self, message: impl Into<String>, answer: impl Into<String>) {
        self.turns.push(ConversationTurn::user(message));
        self.turns.push(ConversationTurn::assistant(answer));
    }

    /// Every turn in order.
    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// The history in the shape the scoring endpoint expects.
    ///
    /// Each user turn is paired with the assistant turn that follows it; a user turn without an
    /// answer is not sent.
    pub fn for_scoring(&self) -> Vec<ChatHistoryEntry> {
        let mut entries = Vec::with_capacity(self.turns.len() / 2);
        let mut question: Option<&str> = None;
        for turn in &self.turns {
            match turn.role {
                Role::User => question = Some(&turn.content),
                Role::Assistant => {
                    if let Some(question) = question.take() {
                        entries.push(ChatHistoryEntry::new(question, turn.content.as_str()));
                    }
                }
            }
        }
        entries
    }
}
