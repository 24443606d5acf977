use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub amqp: AmqpConfig,
    pub gateway: GatewayConfig,
    pub capacity: CapacityConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct AmqpConfig {
    pub url: String,
    pub exchange: String,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub secret_key: String,
    pub webhook_secret: String,
}

#[derive(Debug, Clone)]
pub struct CapacityConfig {
    pub base_url: String,
}

pub fn load() -> Result<Config> {
    Ok(Config {
        server: ServerConfig {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or("0.0.0.0:3000".to_string()),
        },
        database: DatabaseConfig {
            url: std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?,
        },
        amqp: AmqpConfig {
            url: std::env::var("AMQP_URL").unwrap_or("amqp://localhost:5672".to_string()),
            exchange: std::env::var("OUTBOX_EXCHANGE").unwrap_or("warebook".to_string()),
        },
        gateway: GatewayConfig {
            base_url: std::env::var("GATEWAY_BASE_URL")
                .unwrap_or("https://api.paygate.example".to_string()),
            secret_key: std::env::var("GATEWAY_SECRET_KEY")
                .context("GATEWAY_SECRET_KEY is not set")?,
            webhook_secret: std::env::var("GATEWAY_WEBHOOK_SECRET")
                .context("GATEWAY_WEBHOOK_SECRET is not set")?,
        },
        capacity: CapacityConfig {
            base_url: std::env::var("CAPACITY_LEDGER_URL")
                .unwrap_or("http://localhost:3000/capacity-service".to_string()),
        },
    })
}
