mod build_service;
mod chat;
mod config;
mod errors;
mod llm_client;
mod routes;
mod sessions;
mod state;
mod workspace;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::build_service::HttpBuildService;
use crate::chat::LlmCompletion;
use crate::config::Config;
use crate::llm_client::LlmClient;
use crate::routes::build_router;
use crate::sessions::SessionRegistry;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Folio API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize LLM client
    let llm = LlmClient::new(config.anthropic_api_key.clone())?;
    info!("LLM client initialized (model: {})", llm_client::MODEL);

    // Initialize build service client
    let build_service = HttpBuildService::new(
        &config.build_service_url,
        config.build_service_token.clone(),
        config.stream_transport,
        config.stream_max_reconnects,
    )?;
    info!(
        "Build service at {} (stream: {:?}, reconnects: {})",
        config.build_service_url, config.stream_transport, config.stream_max_reconnects
    );

    // Build app state
    let sessions = SessionRegistry::new(
        Arc::new(build_service),
        Arc::new(LlmCompletion::new(llm)),
    );
    let state = AppState {
        sessions: Arc::new(sessions),
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
