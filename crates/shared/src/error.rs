use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const NON_FIELD_ERRORS: &str = "non_field_errors";

pub type FieldErrors = BTreeMap<String, Vec<String>>;

/// Error body returned by the campaign service on a rejected request.
///
/// The service reports errors as an object keyed by field name, with either a
/// message or a list of messages per field. Top-level `error`/`detail` strings
/// are folded into `non_field_errors`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorBody {
    pub fields: FieldErrors,
}

impl ErrorBody {
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut fields = FieldErrors::new();
        fields.insert(field.into(), vec![message.into()]);
        Self { fields }
    }

    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => {
                let mut fields = FieldErrors::new();
                for (key, value) in map {
                    let key = match key.as_str() {
                        "error" | "detail" => NON_FIELD_ERRORS.to_string(),
                        _ => key,
                    };
                    let messages = collect_messages(&value);
                    if !messages.is_empty() {
                        fields.entry(key).or_default().extend(messages);
                    }
                }
                if fields.is_empty() {
                    return Self::single(NON_FIELD_ERRORS, raw.trim());
                }
                Self { fields }
            }
            Ok(Value::Array(items)) => {
                let messages: Vec<String> = items.iter().flat_map(collect_messages).collect();
                let mut fields = FieldErrors::new();
                fields.insert(NON_FIELD_ERRORS.to_string(), messages);
                Self { fields }
            }
            Ok(Value::String(text)) => Self::single(NON_FIELD_ERRORS, text),
            _ if raw.trim().is_empty() => Self::default(),
            _ => Self::single(NON_FIELD_ERRORS, raw.trim()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.values().all(Vec::is_empty)
    }

    pub fn messages_for(&self, field: &str) -> &[String] {
        self.fields.get(field).map(Vec::as_slice).unwrap_or_default()
    }

    /// Whether the service rejected the request over a uniqueness constraint,
    /// e.g. the same email twice in one subscriber list.
    pub fn reports_uniqueness_violation(&self) -> bool {
        self.fields.values().flatten().any(|message| {
            let message = message.to_ascii_lowercase();
            message.contains("unique") || message.contains("already exists")
        })
    }
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.fields {
            for message in messages {
                if !first {
                    f.write_str("; ")?;
                }
                first = false;
                if field == NON_FIELD_ERRORS {
                    write!(f, "{message}")?;
                } else {
                    write!(f, "{field}: {message}")?;
                }
            }
        }
        Ok(())
    }
}

fn collect_messages(value: &Value) -> Vec<String> {
    match value {
        Value::String(text) => vec![text.clone()],
        Value::Array(items) => items.iter().flat_map(collect_messages).collect(),
        Value::Object(map) => map.values().flat_map(collect_messages).collect(),
        Value::Null => Vec::new(),
        other => vec![other.to_string()],
    }
}
