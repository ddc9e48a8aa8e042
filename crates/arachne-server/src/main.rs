use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use arachne_client::{HttpClient, TransportConfig, rule_hub};
use arachne_core::config::ArachneConfig;
use arachne_server::routes;
use arachne_server::state::AppState;

/// Request bodies are small JSON documents.
const MAX_BODY_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("arachne=info".parse()?))
        .with_target(false)
        .init();

    let admin_token = std::env::var("ARACHNE_ADMIN_TOKEN")
        .ok()
        .filter(|t| !t.is_empty());
    if admin_token.is_none() {
        tracing::warn!("ARACHNE_ADMIN_TOKEN not set, plugin management endpoints are disabled");
    }
    let port = std::env::var("ARACHNE_SERVER_PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("0.0.0.0:{port}");

    let config = ArachneConfig::from_env()?;
    let transport = TransportConfig {
        timeout: config.call_timeout,
        proxy: std::env::var("ARACHNE_PROXY").ok().filter(|p| !p.is_empty()),
        accept_invalid_certs: std::env::var("ARACHNE_TRUST_ALL_CERTS")
            .is_ok_and(|v| matches!(v.as_str(), "1" | "true" | "yes")),
        ..TransportConfig::default()
    };
    let client = HttpClient::builder()
        .transport_config(transport)
        .build()
        .context("Failed to create HTTP client")?;
    let hub = rule_hub(config, client)
        .await
        .context("Failed to initialize resolver hub")?;

    let state = Arc::new(AppState { hub, admin_token });

    let app = routes::router(state.clone())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!("Starting server on {addr}");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.hub.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
