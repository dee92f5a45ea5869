use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RelayError;

pub const UPSTREAM_MODEL: &str = "jina-deepsearch-v1";
pub const REASONING_EFFORT: &str = "medium";
pub const MAX_ATTEMPTS: u32 = 1;

/// Inbound body of `POST /api/chat`.
///
/// History entries stay as raw JSON so roles and any extra fields reach the
/// upstream untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatRequest {
  pub content: Option<String>,
  pub messages: Vec<Value>,
}

impl ChatRequest {
  pub fn from_value(body: Value) -> Result<Self, RelayError> {
    let Value::Object(mut fields) = body else {
      return Err(RelayError::InvalidRequest(
        "request body must be a JSON object".to_string(),
      ));
    };

    let content = match fields.remove("content") {
      Some(Value::String(s)) => Some(s),
      _ => None,
    };
    let messages = match fields.remove("messages") {
      Some(Value::Array(items)) => items,
      _ => Vec::new(),
    };

    Ok(Self { content, messages })
  }

  /// Returns the history as sent, or a single user turn built from `content`.
  pub fn conversation(self) -> Vec<Value> {
    if !self.messages.is_empty() {
      return self.messages;
    }
    let content = self.content.unwrap_or_default();
    vec![serde_json::json!({ "role": "user", "content": content })]
  }
}

#[derive(Serialize, Debug)]
pub struct UpstreamPayload {
  pub model: &'static str,
  pub messages: Vec<Value>,
  pub stream: bool,
  pub reasoning_effort: &'static str,
  pub max_attempts: u32,
  pub no_direct_answer: bool,
}

impl UpstreamPayload {
  pub fn new(messages: Vec<Value>) -> Self {
    Self {
      model: UPSTREAM_MODEL,
      messages,
      stream: true,
      reasoning_effort: REASONING_EFFORT,
      max_attempts: MAX_ATTEMPTS,
      no_direct_answer: false,
    }
  }
}

#[derive(Serialize, Debug, PartialEq)]
pub struct OutputEvent {
  pub content: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorBody {
  pub detail: String,
  pub code: String,
}
