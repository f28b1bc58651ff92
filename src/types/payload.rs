use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Split a scoring payload into its `answer` and the remaining top-level fields.
///
/// The payload must be a JSON object whose `answer` member is a string.  `kind` names the record
/// being built so that validation errors say what was rejected.
pub(crate) fn split_answer(value: Value, kind: &str) -> Result<(String, Map<String, Value>)> {
    let Value::Object(mut fields) = value else {
        return Err(Error::validation(
            format!("{kind} must be a JSON object, got {}", type_name(&value)),
            None,
        ));
    };
    match fields.shift_remove("answer") {
        Some(Value::String(answer)) => Ok((answer, fields)),
        Some(other) => Err(Error::validation(
            format!(
                "{kind} field `answer` must be a string, got {}",
                type_name(&other)
            ),
            Some("answer".to_string()),
        )),
        None => Err(Error::validation(
            format!("{kind} is missing the `answer` field"),
            Some("answer".to_string()),
        )),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
