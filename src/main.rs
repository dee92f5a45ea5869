mod config;
mod error;
mod logger;
mod models;
mod router;
mod stream;
mod upstream;

use anyhow::Context;

use config::RelayConfig;
use router::{run_router, RouterState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Before logging starts so RUST_LOG may come from the file.
  let dotenv = config::load_dotenv();
  logger::init();
  match dotenv {
    Ok(Some(path)) => tracing::debug!(path = %path.display(), "loaded .env"),
    Ok(None) => tracing::debug!("no .env file found"),
    Err(err) => tracing::warn!(error = %err, "ignoring unreadable .env"),
  }

  let config = RelayConfig::from_env().context("failed to read configuration")?;
  if config.api_key().is_some() {
    tracing::info!("Jina API key loaded");
  } else {
    tracing::warn!("JINA_API_KEY not set; chat requests will fail until it is configured");
  }

  let addr = config.bind_addr()?;
  let listener =
    std::net::TcpListener::bind(addr).with_context(|| format!("failed to bind {addr}"))?;
  tracing::info!(%addr, upstream = %config.upstream_url, "deepsearch relay listening");

  let state = RouterState::new(config)?;
  run_router(listener, state).await
}
