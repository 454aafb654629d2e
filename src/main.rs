//! Market Simulation Engine
//!
//! Entry point: loads configuration, builds the lifecycle controller, and
//! serves the Session API and WebSocket streaming surface over axum.

use anyhow::{Context, Result};
use marketsim_engine::config::EngineConfig;
use marketsim_engine::http;
use marketsim_engine::lifecycle::LifecycleController;
use std::env;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = EngineConfig::from_env();
    let trader_data_endpoint =
        env::var("TRADER_DATA_ENDPOINT").unwrap_or_else(|_| "http://localhost:4000/api/top-traders".to_string());

    info!(port = config.http_port, "market simulation engine starting");

    let controller = LifecycleController::new(config.clone(), trader_data_endpoint);
    let app = http::router(controller)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.http_port);
    let listener = TcpListener::bind(&addr).await.context("failed to bind HTTP listener")?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "marketsim_engine=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
