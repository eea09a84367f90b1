use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};
use url::Url;

use crate::db::{DEFAULT_CONNECT_RETRIES, DEFAULT_MAX_POOL_SIZE};

pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_KEEPALIVE_SECS: u64 = 30;
pub const DEFAULT_BUS_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_pool_size: u32,
    pub database_connect_retries: u32,
    pub server_host: String,
    pub server_port: u16,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub jwt_expiry_minutes: i64,
    pub cors_allowed_origin: Option<String>,
    /// Outbound frames buffered per connection before events are dropped.
    pub ws_send_queue_capacity: usize,
    pub ws_keepalive_secs: u64,
    pub bus_channel_capacity: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_max_pool_size = parse_setting(
            "DATABASE_MAX_POOL_SIZE",
            env::var("DATABASE_MAX_POOL_SIZE").ok(),
            DEFAULT_MAX_POOL_SIZE,
        )?;
        let database_connect_retries = parse_setting(
            "DATABASE_CONNECT_RETRIES",
            env::var("DATABASE_CONNECT_RETRIES").ok(),
            DEFAULT_CONNECT_RETRIES,
        )?;
        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let server_port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .context("SERVER_PORT must be a valid u16")?;
        let jwt_secret = env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        let jwt_issuer = env::var("JWT_ISSUER").unwrap_or_else(|_| "chat-gateway".to_string());
        let jwt_audience =
            env::var("JWT_AUDIENCE").unwrap_or_else(|_| "chat-gateway-clients".to_string());
        let jwt_expiry_minutes = env::var("JWT_EXPIRY_MINUTES")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .context("JWT_EXPIRY_MINUTES must be an integer")?;
        let cors_allowed_origin = env::var("CORS_ALLOWED_ORIGIN").ok();
        let ws_send_queue_capacity = parse_positive(
            "WS_SEND_QUEUE_CAPACITY",
            DEFAULT_SEND_QUEUE_CAPACITY,
        )?;
        let ws_keepalive_secs = env::var("WS_KEEPALIVE_SECS")
            .unwrap_or_else(|_| DEFAULT_KEEPALIVE_SECS.to_string())
            .parse()
            .context("WS_KEEPALIVE_SECS must be an integer")?;
        let bus_channel_capacity =
            parse_positive("BUS_CHANNEL_CAPACITY", DEFAULT_BUS_CHANNEL_CAPACITY)?;

        Ok(Self {
            database_url,
            database_max_pool_size,
            database_connect_retries,
            server_host,
            server_port,
            jwt_secret,
            jwt_issuer,
            jwt_audience,
            jwt_expiry_minutes,
            cors_allowed_origin,
            ws_send_queue_capacity,
            ws_keepalive_secs,
            bus_channel_capacity,
        })
    }

    pub fn redacted_database_url(&self) -> String {
        redact_database_url(&self.database_url)
    }
}

fn parse_positive(key: &str, default: usize) -> Result<usize> {
    let value: usize = match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be a positive integer"))?,
        Err(_) => default,
    };
    anyhow::ensure!(value > 0, "{key} must be greater than zero");
    Ok(value)
}

fn parse_setting<T>(key: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a non-negative integer")),
        None => Ok(default),
    }
}

fn redact_database_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            let _ = parsed.set_password(Some("*****"));
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}
