use std::sync::Arc;

use anyhow::Context;
use tokio::{net::TcpListener, signal};
use tracing_subscriber::EnvFilter;

use chat_gateway::{
    bus::LocalBus, config::AppConfig, create_router, db, store::PgStore, AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "server",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        send_queue_capacity = config.ws_send_queue_capacity,
        keepalive_secs = config.ws_keepalive_secs,
        "loaded gateway configuration"
    );

    let pool = db::connect_with_retry(
        &config.database_url,
        config.database_max_pool_size,
        config.database_connect_retries,
    )
    .await?;
    db::run_migrations(&pool).await?;

    let store = Arc::new(PgStore::new(pool));
    let bus = Arc::new(LocalBus::new(config.bus_channel_capacity));
    let addr = format!("{}:{}", config.server_host, config.server_port);

    let state = AppState::new(config, store.clone(), store, bus)?;
    let app = create_router(state);

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "chat gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if signal::ctrl_c().await.is_ok() {
                tracing::info!("server received shutdown signal");
            }
        })
        .await?;

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
