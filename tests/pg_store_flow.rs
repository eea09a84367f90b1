//! Exercises the Postgres store against a real database. Skipped unless
//! `TEST_DATABASE_URL` is set.

use std::env;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use chat_gateway::db::{self, PgPool};
use chat_gateway::models::{
    ChatType, MessagePage, MessageType, NewChat, NewMessage, PresenceRecord, PresenceStatus,
};
use chat_gateway::store::{ChatStore, PgStore, Removal, UserDirectory};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use uuid::Uuid;

async fn prepare() -> Result<Option<(PgPool, PgStore)>> {
    let Ok(database_url) = env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping Postgres store test");
        return Ok(None);
    };
    let pool = db::init_pool_with_size(&database_url, 2)?;
    db::run_migrations(&pool).await?;

    let cleanup = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = cleanup
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.batch_execute(
            "TRUNCATE TABLE message_reads, messages, chat_participants, chats, user_presence, users;",
        )
        .context("failed to truncate tables")?;
        Ok(())
    })
    .await
    .context("cleanup task panicked")??;

    Ok(Some((pool.clone(), PgStore::new(pool))))
}

fn text(chat_id: Uuid, user_id: Uuid, content: &str) -> NewMessage {
    NewMessage {
        chat_id,
        user_id,
        content: content.to_string(),
        message_type: MessageType::Text,
        file_url: None,
        file_name: None,
        file_size: None,
    }
}

#[tokio::test]
async fn postgres_store_flow() -> Result<()> {
    let Some((pool, store)) = prepare().await? else {
        return Ok(());
    };
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

    let users_pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        use chat_gateway::schema::users;
        let mut conn = users_pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        diesel::insert_into(users::table)
            .values(&vec![
                (users::id.eq(alice), users::display_name.eq("Alice")),
                (users::id.eq(bob), users::display_name.eq("Bob")),
            ])
            .execute(&mut conn)?;
        Ok(())
    })
    .await??;
    assert_eq!(store.display_name(alice).await?.as_deref(), Some("Alice"));
    assert_eq!(store.display_name(Uuid::new_v4()).await?, None);

    let chat = store
        .create_chat(
            NewChat {
                workspace_id: Uuid::new_v4(),
                project_id: None,
                chat_type: ChatType::Group,
                name: Some("pg".to_string()),
                created_by: alice,
            },
            &[alice, bob],
        )
        .await?;
    assert!(store.is_active_participant(chat.id, bob).await?);
    assert_eq!(store.list_participants(chat.id).await?.len(), 2);

    let mut latest = None;
    for n in 0..3 {
        latest = store.insert_message(text(chat.id, alice, &format!("m{n}"))).await?;
    }
    let latest = latest.context("no message inserted")?;

    let all = store
        .list_messages(
            chat.id,
            MessagePage {
                limit: 50,
                offset: 0,
                after: Some(DateTime::<Utc>::UNIX_EPOCH),
            },
        )
        .await?;
    assert_eq!(all.len(), 3);
    assert_eq!(all[2], latest);

    assert_eq!(store.unread_count(chat.id, alice).await?, 0);
    assert_eq!(store.unread_count(chat.id, bob).await?, 3);

    assert!(store.insert_read(latest.id, bob).await?);
    assert!(!store.insert_read(latest.id, bob).await?);
    assert_eq!(store.count_reads(latest.id).await?, 1);

    assert!(store.advance_last_read(chat.id, bob, latest.created_at).await?);
    assert!(store
        .advance_last_read(chat.id, bob, latest.created_at - Duration::hours(1))
        .await?);
    assert_eq!(store.unread_count(chat.id, bob).await?, 0);

    assert!(store.soft_delete_message(latest.id).await?);
    assert!(!store.soft_delete_message(latest.id).await?);
    assert_eq!(store.count_reads(latest.id).await?, 1);

    assert_eq!(store.remove_participant(chat.id, bob).await?, Removal::Removed);
    assert!(!store.is_active_participant(chat.id, bob).await?);
    assert_eq!(store.remove_participant(chat.id, alice).await?, Removal::LastMember);
    assert!(store.insert_message(text(chat.id, bob, "outsider")).await?.is_none());
    store.add_participant(chat.id, bob).await?;
    assert!(store.is_active_participant(chat.id, bob).await?);

    let now = latest.created_at;
    let fresh = PresenceRecord {
        user_id: bob,
        workspace_id: chat.workspace_id,
        status: PresenceStatus::Online,
        last_seen: now,
    };
    assert!(store.upsert_presence(fresh.clone()).await?);
    let stale = PresenceRecord {
        status: PresenceStatus::Offline,
        last_seen: now - Duration::seconds(5),
        ..fresh
    };
    assert!(!store.upsert_presence(stale).await?);
    assert_eq!(
        store.get_presence(bob).await?.map(|record| record.status),
        Some(PresenceStatus::Online)
    );

    assert_eq!(store.reset_presence().await?, 1);
    assert_eq!(store.purge_chat(chat.id).await?, 1);
    assert!(store.get_chat(chat.id).await?.is_none());

    Ok(())
}
