use std::sync::Arc;

use crate::{core::aliases::DbPool, core::config::Config, gateway::GatewayClient};

#[derive(Clone)]
pub struct AppState {
    pub db_pool: DbPool,
    pub http_client: reqwest::Client,
    pub gateway: GatewayClient,
    pub config: Arc<Config>,
}
