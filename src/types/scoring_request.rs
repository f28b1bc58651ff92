use serde::{Deserialize, Serialize};

/// The `inputs` half of a history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryInputs {
    /// The earlier user question.
    pub question: String,
}

/// One earlier exchange, in the shape a prompt-flow endpoint expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatHistoryEntry {
    /// What the user asked.
    pub inputs: HistoryInputs,

    /// What the endpoint answered.
    pub outputs: String,
}

impl ChatHistoryEntry {
    /// Create a new `ChatHistoryEntry` from a question and its answer.
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            inputs: HistoryInputs {
                question: question.into(),
            },
            outputs: answer.into(),
        }
    }
}

/// The JSON body POSTed to the scoring endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringRequest {
    /// The new user message.
    pub question: String,

    /// Earlier exchanges, oldest first.
    pub chat_history: Vec<ChatHistoryEntry>,

    /// Ask the endpoint for incremental delivery.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

impl ScoringRequest {
    /// Create a new non-streaming `ScoringRequest`.
    pub fn new(question: impl Into<String>, chat_history: Vec<ChatHistoryEntry>) -> Self {
        Self {
            question: question.into(),
            chat_history,
            stream: false,
        }
    }

    /// Return this request with incremental delivery requested.
    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}
