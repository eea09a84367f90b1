use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Chat, Message, MessagePage, NewChat, NewMessage, Participant, PresenceRecord,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached (pool exhausted, connection
    /// refused). Callers surface this as a transient failure.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of a participant removal, decided atomically with the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    /// The user had no active membership.
    NotMember,
    /// The user is the only active participant left; nothing was written.
    LastMember,
}

/// Durable chat, message, read-state and presence records.
///
/// Implementations hold no concurrency logic beyond what a single call needs to
/// be atomic; ordering and fan-out live in the services.
#[async_trait]
pub trait ChatStore: Send + Sync + 'static {
    /// Creates the chat and its initial active participants atomically.
    async fn create_chat(&self, chat: NewChat, participants: &[Uuid]) -> StoreResult<Chat>;

    /// Returns the chat unless it is absent or soft-deleted.
    async fn get_chat(&self, chat_id: Uuid) -> StoreResult<Option<Chat>>;

    /// Chats in the workspace where the user is an active participant, most
    /// recently updated first.
    async fn list_chats_for_user(&self, workspace_id: Uuid, user_id: Uuid)
        -> StoreResult<Vec<Chat>>;

    async fn is_active_participant(&self, chat_id: Uuid, user_id: Uuid) -> StoreResult<bool>;

    /// Active participants ordered by join time.
    async fn list_participants(&self, chat_id: Uuid) -> StoreResult<Vec<Participant>>;

    /// Adds the user or reactivates a soft-removed membership.
    async fn add_participant(&self, chat_id: Uuid, user_id: Uuid) -> StoreResult<Participant>;

    /// Soft-removes the membership unless it is the last active one.
    async fn remove_participant(&self, chat_id: Uuid, user_id: Uuid) -> StoreResult<Removal>;

    /// Persists the message and bumps the chat's `updated_at`, provided the
    /// author is an active participant of a live chat at write time. Returns
    /// `None` otherwise. `created_at` never goes below the chat's previous
    /// message.
    async fn insert_message(&self, message: NewMessage) -> StoreResult<Option<Message>>;

    /// Non-deleted messages in ascending creation order.
    async fn list_messages(&self, chat_id: Uuid, page: MessagePage) -> StoreResult<Vec<Message>>;

    /// Returns the message unless it is absent or soft-deleted.
    async fn get_message(&self, message_id: Uuid) -> StoreResult<Option<Message>>;

    async fn update_message_content(
        &self,
        message_id: Uuid,
        content: &str,
    ) -> StoreResult<Option<Message>>;

    /// Returns false when the message was already deleted or never existed.
    async fn soft_delete_message(&self, message_id: Uuid) -> StoreResult<bool>;

    /// Inserts a read row. Returns false when the pair was already recorded.
    async fn insert_read(&self, message_id: Uuid, user_id: Uuid) -> StoreResult<bool>;

    async fn count_reads(&self, message_id: Uuid) -> StoreResult<i64>;

    /// Moves the participant's last-read mark forward to `at`. Never moves it
    /// backwards. Returns false when the user is not an active participant.
    async fn advance_last_read(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Non-deleted messages by other authors created after the participant's
    /// last-read mark.
    async fn unread_count(&self, chat_id: Uuid, user_id: Uuid) -> StoreResult<i64>;

    /// Writes the presence row unless the stored row is newer. Returns whether
    /// the row was written.
    async fn upsert_presence(&self, record: PresenceRecord) -> StoreResult<bool>;

    async fn get_presence(&self, user_id: Uuid) -> StoreResult<Option<PresenceRecord>>;
}

/// Read-only view of the user directory owned by the profile service.
#[async_trait]
pub trait UserDirectory: Send + Sync + 'static {
    async fn display_name(&self, user_id: Uuid) -> StoreResult<Option<String>>;
}

/// Current time truncated to the microsecond precision Postgres stores, so
/// timestamps compare the same before and after a round trip.
pub(crate) fn timestamp_now() -> DateTime<Utc> {
    use chrono::Timelike;

    let now = Utc::now();
    now.with_nanosecond(now.nanosecond() / 1_000 * 1_000)
        .unwrap_or(now)
}
