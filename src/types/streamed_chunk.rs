use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::types::payload::split_answer;

/// One incremental fragment of a streamed answer.
///
/// Each server-sent event from a streaming endpoint carries `{"answer": "<fragment>"}`; the
/// fragments concatenated in arrival order form the full answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value")]
pub struct StreamedChunk {
    /// The text fragment.
    pub answer: String,

    /// Any other fields carried by the event.
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl StreamedChunk {
    /// Create a new `StreamedChunk` holding the given fragment.
    pub fn new(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            metadata: Map::new(),
        }
    }

    /// Parse and validate the data of one event.
    pub fn from_json(data: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(data).map_err(|e| {
            Error::serialization(
                format!("Failed to parse event JSON: {e}"),
                Some(Box::new(e)),
            )
        })?;
        Self::try_from(value)
    }
}

impl TryFrom<Value> for StreamedChunk {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        let (answer, metadata) = split_answer(value, "stream chunk")?;
        Ok(Self { answer, metadata })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment() {
        let chunk = StreamedChunk::from_json(r#"{"answer": "Par"}"#).unwrap();
        assert_eq!(chunk, StreamedChunk::new("Par"));
    }

    #[test]
    fn whitespace_fragment_kept_verbatim() {
        let chunk = StreamedChunk::from_json(r#"{"answer": " is"}"#).unwrap();
        assert_eq!(chunk.answer, " is");
    }

    #[test]
    fn missing_answer_rejected() {
        let err = StreamedChunk::from_json(r#"{"delta": "Par"}"#).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("stream chunk"));
    }
}
