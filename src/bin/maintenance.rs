use std::env;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use chat_gateway::{config::AppConfig, db, store::PgStore};

const USAGE: &str = "Usage: maintenance purge-chat <chat_id> | maintenance reset-presence";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("purge-chat") => {
            let chat_id = args
                .next()
                .context("purge-chat needs a chat id")?
                .parse::<Uuid>()
                .context("chat id must be a UUID")?;
            purge_chat(chat_id).await?
        }
        Some("reset-presence") => reset_presence().await?,
        Some(cmd) => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            std::process::exit(1);
        }
        None => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn connect() -> Result<PgStore> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        pool_size = 1,
        "loaded gateway configuration"
    );
    let pool = db::connect_with_retry(&config.database_url, 1, config.database_connect_retries)
        .await?;
    Ok(PgStore::new(pool))
}

async fn purge_chat(chat_id: Uuid) -> Result<()> {
    let store = connect().await?;
    let removed = store
        .purge_chat(chat_id)
        .await
        .context("failed to purge chat")?;

    if removed == 0 {
        println!("Chat {chat_id} not found.");
    } else {
        println!("Chat {chat_id} purged with its participants, messages and read receipts.");
    }
    Ok(())
}

async fn reset_presence() -> Result<()> {
    let store = connect().await?;
    let updated = store
        .reset_presence()
        .await
        .context("failed to reset presence")?;
    println!("Marked {updated} presence rows offline.");
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
