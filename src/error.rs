use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::models::ErrorBody;

pub const GENERIC_UPSTREAM_DETAIL: &str = "Error from Jina API";

/// Failures surfaced to the caller before any event has been streamed.
#[derive(Debug, Error)]
pub enum RelayError {
  #[error("Jina API key not configured")]
  MissingApiKey,

  #[error("Invalid API key")]
  InvalidApiKey,

  #[error("{detail}")]
  Upstream { status: StatusCode, detail: String },

  #[error("Failed to connect to Jina API: {0}")]
  Connectivity(#[source] reqwest::Error),

  #[error("{0}")]
  InvalidRequest(String),

  #[error("{0}")]
  Internal(String),
}

impl RelayError {
  pub fn status(&self) -> StatusCode {
    match self {
      RelayError::InvalidApiKey => StatusCode::UNAUTHORIZED,
      RelayError::Upstream { status, .. } => *status,
      RelayError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
      RelayError::MissingApiKey | RelayError::Connectivity(_) | RelayError::Internal(_) => {
        StatusCode::INTERNAL_SERVER_ERROR
      }
    }
  }

  pub fn code(&self) -> &'static str {
    match self {
      RelayError::MissingApiKey => "api_key_missing",
      RelayError::InvalidApiKey => "api_key_invalid",
      RelayError::Upstream { .. } => "upstream_error",
      RelayError::Connectivity(_) => "upstream_unreachable",
      RelayError::InvalidRequest(_) => "invalid_request",
      RelayError::Internal(_) => "internal_error",
    }
  }
}

impl IntoResponse for RelayError {
  fn into_response(self) -> Response {
    let status = self.status();
    let body = ErrorBody {
      detail: self.to_string(),
      code: self.code().to_string(),
    };
    (status, Json(body)).into_response()
  }
}

/// Pulls a caller-facing message out of an upstream error body.
///
/// `detail` only counts when it carries something: null, `false`, zero and
/// empty strings, arrays or objects fall back to the generic message.
pub fn upstream_detail(body: &[u8]) -> String {
  let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
    return GENERIC_UPSTREAM_DETAIL.to_string();
  };
  match value.get("detail") {
    Some(detail) if is_meaningful(detail) => match detail {
      serde_json::Value::String(s) => s.clone(),
      other => other.to_string(),
    },
    _ => GENERIC_UPSTREAM_DETAIL.to_string(),
  }
}

fn is_meaningful(value: &serde_json::Value) -> bool {
  use serde_json::Value;
  match value {
    Value::Null => false,
    Value::Bool(b) => *b,
    Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
    Value::String(s) => !s.is_empty(),
    Value::Array(items) => !items.is_empty(),
    Value::Object(fields) => !fields.is_empty(),
  }
}
