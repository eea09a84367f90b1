use std::time::Duration;

use anyhow::{anyhow, Context};
use diesel::pg::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing::{info, warn};

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

pub const DEFAULT_MAX_POOL_SIZE: u32 = 8;
pub const DEFAULT_CONNECT_RETRIES: u32 = 5;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub fn init_pool_with_size(database_url: &str, max_size: u32) -> anyhow::Result<PgPool> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool_size = max_size.max(1);
    let pool = Pool::builder()
        .max_size(pool_size)
        .connection_timeout(Duration::from_secs(10))
        .build(manager)?;
    Ok(pool)
}

/// Builds the pool, retrying with exponential backoff while the database is
/// unreachable. Only used at process start.
pub async fn connect_with_retry(
    database_url: &str,
    max_size: u32,
    retries: u32,
) -> anyhow::Result<PgPool> {
    let mut delay = INITIAL_BACKOFF;
    let mut attempt = 0;
    loop {
        attempt += 1;
        let url = database_url.to_owned();
        let result = tokio::task::spawn_blocking(move || init_pool_with_size(&url, max_size))
            .await
            .context("pool initialisation task panicked")?;

        match result {
            Ok(pool) => {
                info!(attempt, pool_size = max_size, "database pool ready");
                return Ok(pool);
            }
            Err(err) if attempt <= retries => {
                warn!(
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "database unavailable, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_BACKOFF);
            }
            Err(err) => {
                return Err(err.context(format!("database unavailable after {attempt} attempts")))
            }
        }
    }
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        info!(applied = applied.len(), "database migrations applied");
        Ok(())
    })
    .await
    .context("migration task panicked")?
}
