use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;

pub const DEFAULT_UPSTREAM_URL: &str = "https://deepsearch.jina.ai/v1/chat/completions";
pub const DEFAULT_ALLOWED_ORIGINS: [&str; 2] = [
  "http://localhost:3000",
  "http://localhost:3001",
];

/// Loads the nearest `.env` file into the process environment.
///
/// Variables that are already set keep their values. `Ok(None)` means no file
/// was found.
pub fn load_dotenv() -> anyhow::Result<Option<PathBuf>> {
  settle_dotenv(dotenvy::dotenv())
}

fn settle_dotenv(result: dotenvy::Result<PathBuf>) -> anyhow::Result<Option<PathBuf>> {
  match result {
    Ok(path) => Ok(Some(path)),
    Err(err) if err.not_found() => Ok(None),
    Err(err) => Err(err).context("failed to load .env"),
  }
}

#[derive(Clone)]
pub struct RelayConfig {
  pub host: String,
  pub port: u16,
  pub upstream_url: String,
  pub allowed_origins: Vec<String>,
  api_key: Option<String>,
}

impl Default for RelayConfig {
  fn default() -> Self {
    Self {
      host: "0.0.0.0".to_string(),
      port: 8000,
      upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
      allowed_origins: DEFAULT_ALLOWED_ORIGINS.iter().map(|o| o.to_string()).collect(),
      api_key: None,
    }
  }
}

impl fmt::Debug for RelayConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RelayConfig")
      .field("host", &self.host)
      .field("port", &self.port)
      .field("upstream_url", &self.upstream_url)
      .field("allowed_origins", &self.allowed_origins)
      .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
      .finish()
  }
}

impl RelayConfig {
  pub fn from_env() -> anyhow::Result<Self> {
    Self::from_lookup(|name| std::env::var(name).ok())
  }

  /// Builds the config from an arbitrary variable source.
  pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    let defaults = Self::default();

    let port = match lookup("PORT") {
      Some(raw) => raw
        .trim()
        .parse()
        .with_context(|| format!("PORT must be a port number, got {raw:?}"))?,
      None => defaults.port,
    };

    let allowed_origins = match lookup("CORS_ALLOWED_ORIGINS") {
      Some(raw) => raw
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect(),
      None => defaults.allowed_origins,
    };

    Ok(Self {
      host: lookup("HOST").unwrap_or(defaults.host),
      port,
      upstream_url: lookup("DEEPSEARCH_API_URL").unwrap_or(defaults.upstream_url),
      allowed_origins,
      api_key: lookup("JINA_API_KEY").filter(|k| !k.trim().is_empty()),
    })
  }

  pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
    self.api_key = Some(key.into()).filter(|k: &String| !k.trim().is_empty());
    self
  }

  pub fn api_key(&self) -> Option<&str> {
    self.api_key.as_deref()
  }

  pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
    let addr = format!("{}:{}", self.host, self.port);
    addr
      .parse()
      .with_context(|| format!("invalid bind address {addr}"))
  }
}
