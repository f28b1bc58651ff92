use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::types::payload::split_answer;

/// A complete answer returned by a non-streaming scoring call.
///
/// The endpoint replies with a JSON object carrying at least a string `answer`.  Every other
/// top-level member is kept, in order, as metadata.  A `SimpleResponse` can only be built from a
/// payload that passed validation; there is no partially populated state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value")]
pub struct SimpleResponse {
    /// The model-generated answer.
    pub answer: String,

    /// Any other fields the endpoint returned.
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl SimpleResponse {
    /// Create a new `SimpleResponse` with the given answer and no metadata.
    pub fn new(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            metadata: Map::new(),
        }
    }

    /// Attach one metadata field.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Parse and validate a response body.
    pub fn from_json(body: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(body).map_err(|e| {
            Error::serialization(
                format!("Failed to parse response: {e}"),
                Some(Box::new(e)),
            )
        })?;
        Self::try_from(value)
    }
}

impl TryFrom<Value> for SimpleResponse {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        let (answer, metadata) = split_answer(value, "response")?;
        Ok(Self { answer, metadata })
    }
}
