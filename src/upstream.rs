use axum::http::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};

use crate::error::{upstream_detail, RelayError};
use crate::models::UpstreamPayload;

pub struct UpstreamClient {
  http: reqwest::Client,
  url: String,
}

impl UpstreamClient {
  pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
    Self { http, url: url.into() }
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// Sends the payload and returns the still-unread streaming response.
  pub async fn open_stream(
    &self,
    key: &str,
    payload: &UpstreamPayload,
  ) -> Result<reqwest::Response, RelayError> {
    let mut headers = HeaderMap::new();
    headers.insert(
      AUTHORIZATION,
      HeaderValue::from_str(&format!("Bearer {}", key))
        .map_err(|err| RelayError::Internal(format!("unusable API key: {err}")))?,
    );
    headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));

    let resp = self
      .http
      .post(&self.url)
      .headers(headers)
      .json(payload)
      .send()
      .await
      .map_err(|err| {
        tracing::warn!(error = %err, url = %self.url, "could not reach upstream");
        RelayError::Connectivity(err)
      })?;

    classify(resp).await
  }
}

async fn classify(resp: reqwest::Response) -> Result<reqwest::Response, RelayError> {
  let status = resp.status();
  if status == StatusCode::OK {
    return Ok(resp);
  }

  if status == StatusCode::UNAUTHORIZED {
    tracing::warn!("upstream rejected the API key");
    return Err(RelayError::InvalidApiKey);
  }

  let body = resp.bytes().await.unwrap_or_default();
  let detail = upstream_detail(&body);
  tracing::warn!(%status, %detail, "upstream returned an error");
  Err(RelayError::Upstream { status, detail })
}
