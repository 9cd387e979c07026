use anyhow::{anyhow, Context, Result};

use crate::build_service::StreamTransport;

/// Application configuration loaded from environment variables.
/// Startup fails if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub anthropic_api_key: String,
    pub build_service_url: String,
    pub build_service_token: Option<String>,
    /// `websocket` (default) or `sse`.
    pub stream_transport: StreamTransport,
    /// Consecutive reconnect attempts per event stream before giving up.
    pub stream_max_reconnects: u32,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            anthropic_api_key: require_env("ANTHROPIC_API_KEY")?,
            build_service_url: require_env("BUILD_SERVICE_URL")?,
            build_service_token: optional_env("BUILD_SERVICE_TOKEN"),
            stream_transport: match optional_env("BUILD_STREAM_TRANSPORT") {
                Some(value) => value
                    .parse()
                    .map_err(|e: String| anyhow!(e))
                    .context("BUILD_STREAM_TRANSPORT is invalid")?,
                None => StreamTransport::default(),
            },
            stream_max_reconnects: optional_env("STREAM_MAX_RECONNECTS")
                .unwrap_or_else(|| "5".to_string())
                .parse::<u32>()
                .context("STREAM_MAX_RECONNECTS must be a non-negative integer")?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse::<u16>()
                .context("PORT must be a valid port number")?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

/// Unset and blank values both count as absent.
fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
