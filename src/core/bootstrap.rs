use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::{
    core::{app_state::AppState, config, db, outbox},
    gateway::GatewayClient,
};

pub fn init_tracing() {
    tracing_subscriber::fmt().init();
}

pub fn init_env() {
    dotenvy::dotenv().ok();
}

/// Builds the shared state, spawns the outbox relay and serves the app.
pub async fn bootstrap(service_name: &str, app: Router<AppState>) -> Result<()> {
    let config = config::load()?;
    let db_pool = db::create_pool(&config.database.url).await?;
    let gateway = GatewayClient::new(&config.gateway);

    let state = AppState {
        db_pool,
        http_client: reqwest::Client::new(),
        gateway,
        config: Arc::new(config),
    };

    tokio::spawn(outbox::relay(state.clone()));

    let app = app
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&state.config.server.bind_addr)
        .await
        .context("Failed to bind server address")?;
    tracing::info!(
        "{service_name} listening on {}",
        state.config.server.bind_addr
    );
    axum::serve(listener, app).await?;
    Ok(())
}
