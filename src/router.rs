use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::HeaderValue;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::models::{ChatRequest, UpstreamPayload};
use crate::stream::relay_events;
use crate::upstream::UpstreamClient;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub struct RouterState {
  pub config: RelayConfig,
  pub upstream: UpstreamClient,
}

impl RouterState {
  pub fn new(config: RelayConfig) -> anyhow::Result<Self> {
    let http = reqwest::Client::builder().build()?;
    Ok(Self::with_client(config, http))
  }

  pub fn with_client(config: RelayConfig, http: reqwest::Client) -> Self {
    let upstream = UpstreamClient::new(http, config.upstream_url.clone());
    Self { config, upstream }
  }
}

pub fn build_router(state: RouterState) -> Router {
  let cors = cors_layer(&state.config.allowed_origins);
  Router::new()
    .route("/health", get(health))
    .route("/api/chat", post(chat))
    .layer(cors)
    .layer(TraceLayer::new_for_http())
    .with_state(Arc::new(state))
}

pub async fn run_router(listener: TcpListener, state: RouterState) -> anyhow::Result<()> {
  let app = build_router(state);

  listener.set_nonblocking(true)?;
  let listener = tokio::net::TcpListener::from_std(listener)?;
  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await?;
  Ok(())
}

async fn shutdown_signal() {
  if let Err(err) = tokio::signal::ctrl_c().await {
    tracing::error!(error = %err, "failed to listen for shutdown signal");
    std::future::pending::<()>().await;
  }
  tracing::info!("shutting down");
}

fn cors_layer(origins: &[String]) -> CorsLayer {
  let origins: Vec<HeaderValue> = origins
    .iter()
    .filter_map(|origin| match HeaderValue::from_str(origin) {
      Ok(value) => Some(value),
      Err(_) => {
        tracing::warn!(%origin, "ignoring unusable CORS origin");
        None
      }
    })
    .collect();

  // Credentialed CORS forbids wildcards, so methods and headers are mirrored.
  CorsLayer::new()
    .allow_origin(AllowOrigin::list(origins))
    .allow_methods(AllowMethods::mirror_request())
    .allow_headers(AllowHeaders::mirror_request())
    .allow_credentials(true)
}

async fn health() -> Json<serde_json::Value> {
  Json(serde_json::json!({ "status": "ok" }))
}

async fn chat(
  State(state): State<Arc<RouterState>>,
  body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Response {
  let request_id = Uuid::new_v4();
  let body = match body {
    Ok(Json(body)) => body,
    Err(rejection) => {
      tracing::debug!(%request_id, error = %rejection, "unreadable chat body");
      return RelayError::InvalidRequest(rejection.body_text()).into_response();
    }
  };
  match relay(&state, body, request_id).await {
    Ok(response) => response,
    Err(err) => {
      if let RelayError::Internal(message) = &err {
        tracing::error!(%request_id, %message, "chat relay failed");
      }
      err.into_response()
    }
  }
}

async fn relay(
  state: &RouterState,
  body: serde_json::Value,
  request_id: Uuid,
) -> Result<Response, RelayError> {
  let request = ChatRequest::from_value(body)?;
  let key = state.config.api_key().ok_or(RelayError::MissingApiKey)?;

  let conversation = request.conversation();
  tracing::info!(
    %request_id,
    turns = conversation.len(),
    upstream = state.upstream.url(),
    "relaying chat"
  );

  let payload = UpstreamPayload::new(conversation);
  let resp = state.upstream.open_stream(key, &payload).await?;

  let events = relay_events(resp.bytes_stream());
  Ok(Sse::new(events)
    .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
    .into_response())
}

#[cfg(test)]
mod tests {
  use super::*;
  use axum::body::{to_bytes, Body};
  use axum::http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_REQUEST_METHOD,
    CONTENT_TYPE, ORIGIN,
  };
  use axum::http::{Request, StatusCode};
  use serde_json::json;
  use tower::ServiceExt;

  use crate::models::ErrorBody;
  use crate::upstream::tests::{dead_url, spawn_upstream, test_http, Canned};

  fn app(url: &str, key: Option<&str>) -> Router {
    let mut config = RelayConfig::default();
    config.upstream_url = url.to_string();
    if let Some(key) = key {
      config = config.with_api_key(key);
    }
    build_router(RouterState::with_client(config, test_http()))
  }

  fn chat_request(body: serde_json::Value) -> Request<Body> {
    Request::builder()
      .method("POST")
      .uri("/api/chat")
      .header(CONTENT_TYPE, "application/json")
      .body(Body::from(body.to_string()))
      .unwrap()
  }

  async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
  }

  async fn error_body(response: Response) -> ErrorBody {
    serde_json::from_str(&body_text(response).await).unwrap()
  }

  #[tokio::test]
  async fn health_reports_ok() {
    let response = app("http://127.0.0.1:9/unused", None)
      .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body, json!({ "status": "ok" }));
  }

  #[tokio::test]
  async fn missing_key_fails_before_upstream_call() {
    let mock = spawn_upstream(Canned::stream(&[])).await;

    let response = app(&mock.url, None)
      .oneshot(chat_request(json!({ "content": "hi" })))
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(error_body(response).await.detail, "Jina API key not configured");
    assert_eq!(mock.hits(), 0);
  }

  #[tokio::test]
  async fn streams_content_fragments_as_events() {
    let mock = spawn_upstream(Canned::stream(&[
      r#"data: {"choices":[{"delta":{"content":"foo"}}]}"#,
      r#"data: {"choices":[{"delta":{}}]}"#,
      r#"data: {broken"#,
      r#"data: {"choices":[{"delta":{"content":"bar"}}]}"#,
      "data: [DONE]",
    ]))
    .await;

    let response = app(&mock.url, Some("jina_test"))
      .oneshot(chat_request(json!({ "content": "What is SSE?" })))
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
      response.headers().get(CONTENT_TYPE).unwrap(),
      "text/event-stream"
    );
    assert_eq!(
      body_text(response).await,
      "data: {\"content\":\"foo\"}\n\ndata: {\"content\":\"bar\"}\n\n"
    );
    assert_eq!(mock.last_auth().as_deref(), Some("Bearer jina_test"));
    assert_eq!(
      mock.last_body().unwrap()["messages"],
      json!([{ "role": "user", "content": "What is SSE?" }])
    );
  }

  #[tokio::test]
  async fn history_is_forwarded_in_order() {
    let mock = spawn_upstream(Canned::stream(&[])).await;
    let history = json!([
      { "role": "user", "content": "one" },
      { "role": "assistant", "content": "two" },
      { "role": "user", "content": "three" }
    ]);

    let response = app(&mock.url, Some("k"))
      .oneshot(chat_request(json!({ "messages": history })))
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let _ = body_text(response).await;
    assert_eq!(mock.last_body().unwrap()["messages"], history);
  }

  #[tokio::test]
  async fn rejected_key_is_unauthorized() {
    let mock = spawn_upstream(Canned::error(StatusCode::UNAUTHORIZED, "{}")).await;

    let response = app(&mock.url, Some("stale"))
      .oneshot(chat_request(json!({ "content": "hi" })))
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = error_body(response).await;
    assert_eq!(body.detail, "Invalid API key");
    assert_eq!(body.code, "api_key_invalid");
  }

  #[tokio::test]
  async fn upstream_error_detail_is_passed_through() {
    let mock = spawn_upstream(Canned::error(
      StatusCode::INTERNAL_SERVER_ERROR,
      r#"{"detail":"X"}"#,
    ))
    .await;

    let response = app(&mock.url, Some("k"))
      .oneshot(chat_request(json!({ "content": "hi" })))
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(error_body(response).await.detail, "X");
  }

  #[tokio::test]
  async fn non_json_upstream_error_gets_generic_detail() {
    let mock = spawn_upstream(Canned::error(StatusCode::BAD_GATEWAY, "upstream exploded")).await;

    let response = app(&mock.url, Some("k"))
      .oneshot(chat_request(json!({ "content": "hi" })))
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(error_body(response).await.detail, "Error from Jina API");
  }

  #[tokio::test]
  async fn unreachable_upstream_is_server_error() {
    let response = app(&dead_url().await, Some("k"))
      .oneshot(chat_request(json!({ "content": "hi" })))
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = error_body(response).await;
    assert!(body.detail.starts_with("Failed to connect to Jina API"));
    assert_eq!(body.code, "upstream_unreachable");
  }

  #[tokio::test]
  async fn non_object_body_is_unprocessable() {
    let mock = spawn_upstream(Canned::stream(&[])).await;

    let response = app(&mock.url, Some("k"))
      .oneshot(chat_request(json!(["hi"])))
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(mock.hits(), 0);
  }

  #[tokio::test]
  async fn accepted_upstream_status_is_not_streamed() {
    let mut canned = Canned::stream(&[r#"data: {"choices":[{"delta":{"content":"foo"}}]}"#]);
    canned.status = StatusCode::ACCEPTED;
    let mock = spawn_upstream(canned).await;

    let response = app(&mock.url, Some("k"))
      .oneshot(chat_request(json!({ "content": "hi" })))
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = error_body(response).await;
    assert_eq!(body.code, "upstream_error");
    assert_eq!(body.detail, "Error from Jina API");
  }

  #[tokio::test]
  async fn malformed_json_body_gets_json_error() {
    let mock = spawn_upstream(Canned::stream(&[])).await;
    let request = Request::builder()
      .method("POST")
      .uri("/api/chat")
      .header(CONTENT_TYPE, "application/json")
      .body(Body::from(r#"{"content": "#))
      .unwrap();

    let response = app(&mock.url, Some("k")).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_body(response).await.code, "invalid_request");
    assert_eq!(mock.hits(), 0);
  }

  #[tokio::test]
  async fn missing_content_type_gets_json_error() {
    let mock = spawn_upstream(Canned::stream(&[])).await;
    let request = Request::builder()
      .method("POST")
      .uri("/api/chat")
      .body(Body::from(r#"{"content":"hi"}"#))
      .unwrap();

    let response = app(&mock.url, Some("k")).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_body(response).await.code, "invalid_request");
    assert_eq!(mock.hits(), 0);
  }

  #[tokio::test]
  async fn body_is_validated_before_key_check() {
    let mock = spawn_upstream(Canned::stream(&[])).await;

    let response = app(&mock.url, None)
      .oneshot(chat_request(json!("just a string")))
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_body(response).await.code, "invalid_request");
  }

  #[tokio::test]
  async fn preflight_allows_local_frontend() {
    let response = app("http://127.0.0.1:9/unused", None)
      .oneshot(
        Request::builder()
          .method("OPTIONS")
          .uri("/api/chat")
          .header(ORIGIN, "http://localhost:3001")
          .header(ACCESS_CONTROL_REQUEST_METHOD, "POST")
          .body(Body::empty())
          .unwrap(),
      )
      .await
      .unwrap();

    let headers = response.headers();
    assert_eq!(headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "http://localhost:3001");
    assert_eq!(headers.get(ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(), "true");
  }

  #[tokio::test]
  async fn unknown_origin_gets_no_cors_grant() {
    let response = app("http://127.0.0.1:9/unused", None)
      .oneshot(
        Request::builder()
          .uri("/health")
          .header(ORIGIN, "http://evil.test")
          .body(Body::empty())
          .unwrap(),
      )
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
  }
}
