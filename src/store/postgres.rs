use std::str::FromStr;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::dsl::{count_star, exists};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::upsert::excluded;
use uuid::Uuid;

use super::{timestamp_now, ChatStore, Removal, StoreError, StoreResult, UserDirectory};
use crate::db::PgPool;
use crate::models::{
    Chat, ChatType, Message, MessagePage, MessageType, NewChat, NewMessage, Participant,
    PresenceRecord, PresenceStatus,
};
use crate::schema::{chat_participants, chats, message_reads, messages, user_presence, users};

impl From<diesel::result::Error> for StoreError {
    fn from(value: diesel::result::Error) -> Self {
        StoreError::Backend(anyhow::Error::new(value))
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = chats)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct ChatRow {
    id: Uuid,
    workspace_id: Uuid,
    project_id: Option<Uuid>,
    chat_type: String,
    name: Option<String>,
    created_by: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

#[derive(Insertable)]
#[diesel(table_name = chats)]
struct NewChatRow<'a> {
    id: Uuid,
    workspace_id: Uuid,
    project_id: Option<Uuid>,
    chat_type: &'a str,
    name: Option<&'a str>,
    created_by: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = chat_participants)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct ParticipantRow {
    chat_id: Uuid,
    user_id: Uuid,
    joined_at: DateTime<Utc>,
    last_read_at: Option<DateTime<Utc>>,
    is_active: bool,
}

#[derive(Insertable)]
#[diesel(table_name = chat_participants)]
struct NewParticipantRow {
    chat_id: Uuid,
    user_id: Uuid,
    joined_at: DateTime<Utc>,
    is_active: bool,
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct MessageRow {
    id: Uuid,
    chat_id: Uuid,
    user_id: Uuid,
    content: String,
    message_type: String,
    file_url: Option<String>,
    file_name: Option<String>,
    file_size: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

#[derive(Insertable)]
#[diesel(table_name = messages)]
struct NewMessageRow<'a> {
    id: Uuid,
    chat_id: Uuid,
    user_id: Uuid,
    content: &'a str,
    message_type: &'a str,
    file_url: Option<&'a str>,
    file_name: Option<&'a str>,
    file_size: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = message_reads)]
struct NewReadRow {
    message_id: Uuid,
    user_id: Uuid,
    read_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = user_presence)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct PresenceRow {
    user_id: Uuid,
    workspace_id: Uuid,
    status: String,
    last_seen: DateTime<Utc>,
}

fn parse_column<T: FromStr>(value: &str) -> StoreResult<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .map_err(|err| StoreError::Backend(anyhow::Error::new(err)))
}

impl TryFrom<ChatRow> for Chat {
    type Error = StoreError;

    fn try_from(row: ChatRow) -> Result<Self, Self::Error> {
        Ok(Chat {
            id: row.id,
            workspace_id: row.workspace_id,
            project_id: row.project_id,
            chat_type: parse_column::<ChatType>(&row.chat_type)?,
            name: row.name,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

impl From<ParticipantRow> for Participant {
    fn from(row: ParticipantRow) -> Self {
        Participant {
            chat_id: row.chat_id,
            user_id: row.user_id,
            joined_at: row.joined_at,
            last_read_at: row.last_read_at,
            is_active: row.is_active,
        }
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Message {
            id: row.id,
            chat_id: row.chat_id,
            user_id: row.user_id,
            content: row.content,
            message_type: parse_column::<MessageType>(&row.message_type)?,
            file_url: row.file_url,
            file_name: row.file_name,
            file_size: row.file_size,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

impl TryFrom<PresenceRow> for PresenceRecord {
    type Error = StoreError;

    fn try_from(row: PresenceRow) -> Result<Self, Self::Error> {
        Ok(PresenceRecord {
            user_id: row.user_id,
            workspace_id: row.workspace_id,
            status: parse_column::<PresenceStatus>(&row.status)?,
            last_seen: row.last_seen,
        })
    }
}

/// Postgres-backed store. Diesel is synchronous, so every call checks a
/// connection out of the pool on the blocking thread pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn with_conn<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut PgConnection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| StoreError::Unavailable(format!("database pool error: {err}")))?;
            f(&mut conn)
        })
        .await
        .map_err(|err| StoreError::Backend(anyhow!("database task failed: {err}")))?
    }

    /// Hard-deletes a chat together with its participants, messages and read
    /// rows. Returns the number of chats removed.
    pub async fn purge_chat(&self, chat_id: Uuid) -> StoreResult<usize> {
        self.with_conn(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let message_ids = messages::table
                    .filter(messages::chat_id.eq(chat_id))
                    .select(messages::id);
                diesel::delete(message_reads::table.filter(message_reads::message_id.eq_any(message_ids)))
                    .execute(conn)?;
                diesel::delete(messages::table.filter(messages::chat_id.eq(chat_id)))
                    .execute(conn)?;
                diesel::delete(
                    chat_participants::table.filter(chat_participants::chat_id.eq(chat_id)),
                )
                .execute(conn)?;
                Ok(diesel::delete(chats::table.find(chat_id)).execute(conn)?)
            })
        })
        .await
    }

    /// Marks every non-offline presence row offline. Run after an unclean
    /// shutdown of the whole fleet, when no instance can clear its own users.
    pub async fn reset_presence(&self) -> StoreResult<usize> {
        self.with_conn(|conn| {
            Ok(diesel::update(
                user_presence::table
                    .filter(user_presence::status.ne(PresenceStatus::Offline.as_str())),
            )
            .set((
                user_presence::status.eq(PresenceStatus::Offline.as_str()),
                user_presence::last_seen.eq(timestamp_now()),
            ))
            .execute(conn)?)
        })
        .await
    }
}

#[async_trait]
impl ChatStore for PgStore {
    async fn create_chat(&self, chat: NewChat, participants: &[Uuid]) -> StoreResult<Chat> {
        let participants = participants.to_vec();
        self.with_conn(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let now = timestamp_now();
                let id = Uuid::new_v4();
                diesel::insert_into(chats::table)
                    .values(&NewChatRow {
                        id,
                        workspace_id: chat.workspace_id,
                        project_id: chat.project_id,
                        chat_type: chat.chat_type.as_str(),
                        name: chat.name.as_deref(),
                        created_by: chat.created_by,
                        created_at: now,
                        updated_at: now,
                    })
                    .execute(conn)?;

                let rows: Vec<NewParticipantRow> = participants
                    .iter()
                    .map(|user_id| NewParticipantRow {
                        chat_id: id,
                        user_id: *user_id,
                        joined_at: now,
                        is_active: true,
                    })
                    .collect();
                diesel::insert_into(chat_participants::table)
                    .values(&rows)
                    .execute(conn)?;

                let row: ChatRow = chats::table
                    .find(id)
                    .select(ChatRow::as_select())
                    .first(conn)?;
                Chat::try_from(row)
            })
        })
        .await
    }

    async fn get_chat(&self, chat_id: Uuid) -> StoreResult<Option<Chat>> {
        self.with_conn(move |conn| {
            let row = chats::table
                .find(chat_id)
                .filter(chats::deleted_at.is_null())
                .select(ChatRow::as_select())
                .first(conn)
                .optional()?;
            row.map(Chat::try_from).transpose()
        })
        .await
    }

    async fn list_chats_for_user(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
    ) -> StoreResult<Vec<Chat>> {
        self.with_conn(move |conn| {
            let rows: Vec<ChatRow> = chats::table
                .inner_join(chat_participants::table)
                .filter(chats::workspace_id.eq(workspace_id))
                .filter(chats::deleted_at.is_null())
                .filter(chat_participants::user_id.eq(user_id))
                .filter(chat_participants::is_active.eq(true))
                .order(chats::updated_at.desc())
                .select(ChatRow::as_select())
                .load(conn)?;
            rows.into_iter().map(Chat::try_from).collect()
        })
        .await
    }

    async fn is_active_participant(&self, chat_id: Uuid, user_id: Uuid) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            Ok(diesel::select(exists(
                chat_participants::table
                    .inner_join(chats::table)
                    .filter(chat_participants::chat_id.eq(chat_id))
                    .filter(chat_participants::user_id.eq(user_id))
                    .filter(chat_participants::is_active.eq(true))
                    .filter(chats::deleted_at.is_null()),
            ))
            .get_result::<bool>(conn)?)
        })
        .await
    }

    async fn list_participants(&self, chat_id: Uuid) -> StoreResult<Vec<Participant>> {
        self.with_conn(move |conn| {
            let rows: Vec<ParticipantRow> = chat_participants::table
                .filter(chat_participants::chat_id.eq(chat_id))
                .filter(chat_participants::is_active.eq(true))
                .order(chat_participants::joined_at.asc())
                .select(ParticipantRow::as_select())
                .load(conn)?;
            Ok(rows.into_iter().map(Participant::from).collect())
        })
        .await
    }

    async fn add_participant(&self, chat_id: Uuid, user_id: Uuid) -> StoreResult<Participant> {
        self.with_conn(move |conn| {
            diesel::insert_into(chat_participants::table)
                .values(&NewParticipantRow {
                    chat_id,
                    user_id,
                    joined_at: timestamp_now(),
                    is_active: true,
                })
                .on_conflict((chat_participants::chat_id, chat_participants::user_id))
                .do_update()
                .set(chat_participants::is_active.eq(true))
                .execute(conn)?;

            let row: ParticipantRow = chat_participants::table
                .find((chat_id, user_id))
                .select(ParticipantRow::as_select())
                .first(conn)?;
            Ok(Participant::from(row))
        })
        .await
    }

    async fn remove_participant(&self, chat_id: Uuid, user_id: Uuid) -> StoreResult<Removal> {
        self.with_conn(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                // The chat row lock serialises membership changes for the chat.
                let locked = chats::table
                    .find(chat_id)
                    .filter(chats::deleted_at.is_null())
                    .select(chats::id)
                    .for_update()
                    .first::<Uuid>(conn)
                    .optional()?;
                if locked.is_none() {
                    return Ok(Removal::NotMember);
                }

                let active: Vec<Uuid> = chat_participants::table
                    .filter(chat_participants::chat_id.eq(chat_id))
                    .filter(chat_participants::is_active.eq(true))
                    .select(chat_participants::user_id)
                    .for_update()
                    .load(conn)?;
                if !active.contains(&user_id) {
                    return Ok(Removal::NotMember);
                }
                if active.len() <= 1 {
                    return Ok(Removal::LastMember);
                }

                diesel::update(chat_participants::table.find((chat_id, user_id)))
                    .set(chat_participants::is_active.eq(false))
                    .execute(conn)?;
                Ok(Removal::Removed)
            })
        })
        .await
    }

    async fn insert_message(&self, message: NewMessage) -> StoreResult<Option<Message>> {
        self.with_conn(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let last_update = chats::table
                    .find(message.chat_id)
                    .filter(chats::deleted_at.is_null())
                    .select(chats::updated_at)
                    .for_update()
                    .first::<DateTime<Utc>>(conn)
                    .optional()?;
                let Some(last_update) = last_update else {
                    return Ok(None);
                };

                let author = chat_participants::table
                    .find((message.chat_id, message.user_id))
                    .filter(chat_participants::is_active.eq(true))
                    .select(chat_participants::user_id)
                    .for_share()
                    .first::<Uuid>(conn)
                    .optional()?;
                if author.is_none() {
                    return Ok(None);
                }

                let now = timestamp_now().max(last_update);
                let id = Uuid::new_v4();
                diesel::insert_into(messages::table)
                    .values(&NewMessageRow {
                        id,
                        chat_id: message.chat_id,
                        user_id: message.user_id,
                        content: &message.content,
                        message_type: message.message_type.as_str(),
                        file_url: message.file_url.as_deref(),
                        file_name: message.file_name.as_deref(),
                        file_size: message.file_size,
                        created_at: now,
                        updated_at: now,
                    })
                    .execute(conn)?;

                diesel::update(chats::table.find(message.chat_id))
                    .set(chats::updated_at.eq(now))
                    .execute(conn)?;

                let row: MessageRow = messages::table
                    .find(id)
                    .select(MessageRow::as_select())
                    .first(conn)?;
                Message::try_from(row).map(Some)
            })
        })
        .await
    }

    async fn list_messages(&self, chat_id: Uuid, page: MessagePage) -> StoreResult<Vec<Message>> {
        self.with_conn(move |conn| {
            let mut query = messages::table
                .select(MessageRow::as_select())
                .filter(messages::chat_id.eq(chat_id))
                .filter(messages::deleted_at.is_null())
                .order((messages::created_at.asc(), messages::id.asc()))
                .limit(page.limit)
                .into_boxed();

            query = match page.after {
                Some(after) => query.filter(messages::created_at.gt(after)),
                None => query.offset(page.offset),
            };

            let rows: Vec<MessageRow> = query.load(conn)?;
            rows.into_iter().map(Message::try_from).collect()
        })
        .await
    }

    async fn get_message(&self, message_id: Uuid) -> StoreResult<Option<Message>> {
        self.with_conn(move |conn| {
            let row = messages::table
                .find(message_id)
                .filter(messages::deleted_at.is_null())
                .select(MessageRow::as_select())
                .first(conn)
                .optional()?;
            row.map(Message::try_from).transpose()
        })
        .await
    }

    async fn update_message_content(
        &self,
        message_id: Uuid,
        content: &str,
    ) -> StoreResult<Option<Message>> {
        let content = content.to_owned();
        self.with_conn(move |conn| {
            let updated = diesel::update(
                messages::table
                    .find(message_id)
                    .filter(messages::deleted_at.is_null()),
            )
            .set((
                messages::content.eq(content.as_str()),
                messages::updated_at.eq(timestamp_now()),
            ))
            .execute(conn)?;
            if updated == 0 {
                return Ok(None);
            }

            let row: MessageRow = messages::table
                .find(message_id)
                .select(MessageRow::as_select())
                .first(conn)?;
            Message::try_from(row).map(Some)
        })
        .await
    }

    async fn soft_delete_message(&self, message_id: Uuid) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            let now = timestamp_now();
            let updated = diesel::update(
                messages::table
                    .find(message_id)
                    .filter(messages::deleted_at.is_null()),
            )
            .set((messages::deleted_at.eq(Some(now)), messages::updated_at.eq(now)))
            .execute(conn)?;
            Ok(updated > 0)
        })
        .await
    }

    async fn insert_read(&self, message_id: Uuid, user_id: Uuid) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            let inserted = diesel::insert_into(message_reads::table)
                .values(&NewReadRow {
                    message_id,
                    user_id,
                    read_at: timestamp_now(),
                })
                .on_conflict((message_reads::message_id, message_reads::user_id))
                .do_nothing()
                .execute(conn)?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn count_reads(&self, message_id: Uuid) -> StoreResult<i64> {
        self.with_conn(move |conn| {
            Ok(message_reads::table
                .filter(message_reads::message_id.eq(message_id))
                .select(count_star())
                .first::<i64>(conn)?)
        })
        .await
    }

    async fn advance_last_read(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            let membership = chat_participants::table
                .filter(chat_participants::chat_id.eq(chat_id))
                .filter(chat_participants::user_id.eq(user_id))
                .filter(chat_participants::is_active.eq(true));

            let updated = diesel::update(membership.clone().filter(
                chat_participants::last_read_at
                    .is_null()
                    .or(chat_participants::last_read_at.lt(at)),
            ))
            .set(chat_participants::last_read_at.eq(Some(at)))
            .execute(conn)?;
            if updated > 0 {
                return Ok(true);
            }

            Ok(diesel::select(exists(membership)).get_result::<bool>(conn)?)
        })
        .await
    }

    async fn unread_count(&self, chat_id: Uuid, user_id: Uuid) -> StoreResult<i64> {
        self.with_conn(move |conn| {
            let last_read: Option<Option<DateTime<Utc>>> = chat_participants::table
                .filter(chat_participants::chat_id.eq(chat_id))
                .filter(chat_participants::user_id.eq(user_id))
                .filter(chat_participants::is_active.eq(true))
                .select(chat_participants::last_read_at)
                .first(conn)
                .optional()?;
            let Some(last_read) = last_read else {
                return Ok(0);
            };

            let mut query = messages::table
                .select(count_star())
                .filter(messages::chat_id.eq(chat_id))
                .filter(messages::user_id.ne(user_id))
                .filter(messages::deleted_at.is_null())
                .into_boxed();
            if let Some(mark) = last_read {
                query = query.filter(messages::created_at.gt(mark));
            }
            Ok(query.first::<i64>(conn)?)
        })
        .await
    }

    async fn upsert_presence(&self, record: PresenceRecord) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let stored: Option<DateTime<Utc>> = user_presence::table
                    .find(record.user_id)
                    .select(user_presence::last_seen)
                    .for_update()
                    .first(conn)
                    .optional()?;
                if matches!(stored, Some(seen) if seen > record.last_seen) {
                    return Ok(false);
                }

                let row = PresenceRow {
                    user_id: record.user_id,
                    workspace_id: record.workspace_id,
                    status: record.status.as_str().to_owned(),
                    last_seen: record.last_seen,
                };
                diesel::insert_into(user_presence::table)
                    .values(&row)
                    .on_conflict(user_presence::user_id)
                    .do_update()
                    .set((
                        user_presence::workspace_id.eq(excluded(user_presence::workspace_id)),
                        user_presence::status.eq(excluded(user_presence::status)),
                        user_presence::last_seen.eq(excluded(user_presence::last_seen)),
                    ))
                    .execute(conn)?;
                Ok(true)
            })
        })
        .await
    }

    async fn get_presence(&self, user_id: Uuid) -> StoreResult<Option<PresenceRecord>> {
        self.with_conn(move |conn| {
            let row = user_presence::table
                .find(user_id)
                .select(PresenceRow::as_select())
                .first(conn)
                .optional()?;
            row.map(PresenceRecord::try_from).transpose()
        })
        .await
    }
}

#[async_trait]
impl UserDirectory for PgStore {
    async fn display_name(&self, user_id: Uuid) -> StoreResult<Option<String>> {
        self.with_conn(move |conn| {
            Ok(users::table
                .find(user_id)
                .select(users::display_name)
                .first::<String>(conn)
                .optional()?)
        })
        .await
    }
}
