use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{timestamp_now, ChatStore, Removal, StoreError, StoreResult, UserDirectory};
use crate::models::{
    Chat, Message, MessagePage, NewChat, NewMessage, Participant, PresenceRecord, ReadReceipt,
};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, String>,
    chats: HashMap<Uuid, Chat>,
    participants: HashMap<(Uuid, Uuid), Participant>,
    /// Kept in insertion order, which is creation order.
    messages: Vec<Message>,
    reads: HashMap<(Uuid, Uuid), ReadReceipt>,
    presence: HashMap<Uuid, PresenceRecord>,
}

/// Process-local store with the same semantics as [`super::PgStore`]. Backs
/// the test suites and single-process embedding.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user_id: Uuid, display_name: impl Into<String>) {
        let mut tables = self.tables.lock().await;
        tables.users.insert(user_id, display_name.into());
    }

    /// Simulates an outage: every call fails with [`StoreError::Unavailable`]
    /// until availability is restored.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub async fn message_count(&self, chat_id: Uuid) -> usize {
        let tables = self.tables.lock().await;
        tables
            .messages
            .iter()
            .filter(|message| message.chat_id == chat_id)
            .count()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

impl Tables {
    fn live_chat(&self, chat_id: Uuid) -> Option<&Chat> {
        self.chats
            .get(&chat_id)
            .filter(|chat| chat.deleted_at.is_none())
    }

    fn active_participant(&self, chat_id: Uuid, user_id: Uuid) -> Option<&Participant> {
        self.live_chat(chat_id)?;
        self.participants
            .get(&(chat_id, user_id))
            .filter(|participant| participant.is_active)
    }

    fn live_message_mut(&mut self, message_id: Uuid) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .find(|message| message.id == message_id && message.deleted_at.is_none())
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn create_chat(&self, chat: NewChat, participants: &[Uuid]) -> StoreResult<Chat> {
        self.check_available()?;
        let now = timestamp_now();
        let created = Chat {
            id: Uuid::new_v4(),
            workspace_id: chat.workspace_id,
            project_id: chat.project_id,
            chat_type: chat.chat_type,
            name: chat.name,
            created_by: chat.created_by,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        let mut tables = self.tables.lock().await;
        for user_id in participants {
            tables.participants.insert(
                (created.id, *user_id),
                Participant {
                    chat_id: created.id,
                    user_id: *user_id,
                    joined_at: now,
                    last_read_at: None,
                    is_active: true,
                },
            );
        }
        tables.chats.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_chat(&self, chat_id: Uuid) -> StoreResult<Option<Chat>> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        Ok(tables.live_chat(chat_id).cloned())
    }

    async fn list_chats_for_user(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
    ) -> StoreResult<Vec<Chat>> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        let mut chats: Vec<Chat> = tables
            .chats
            .values()
            .filter(|chat| chat.workspace_id == workspace_id && chat.deleted_at.is_none())
            .filter(|chat| tables.active_participant(chat.id, user_id).is_some())
            .cloned()
            .collect();
        chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(chats)
    }

    async fn is_active_participant(&self, chat_id: Uuid, user_id: Uuid) -> StoreResult<bool> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        Ok(tables.active_participant(chat_id, user_id).is_some())
    }

    async fn list_participants(&self, chat_id: Uuid) -> StoreResult<Vec<Participant>> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        let mut participants: Vec<Participant> = tables
            .participants
            .values()
            .filter(|participant| participant.chat_id == chat_id && participant.is_active)
            .cloned()
            .collect();
        participants.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        Ok(participants)
    }

    async fn add_participant(&self, chat_id: Uuid, user_id: Uuid) -> StoreResult<Participant> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        let participant = tables
            .participants
            .entry((chat_id, user_id))
            .and_modify(|existing| existing.is_active = true)
            .or_insert_with(|| Participant {
                chat_id,
                user_id,
                joined_at: timestamp_now(),
                last_read_at: None,
                is_active: true,
            });
        Ok(participant.clone())
    }

    async fn remove_participant(&self, chat_id: Uuid, user_id: Uuid) -> StoreResult<Removal> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        if tables.active_participant(chat_id, user_id).is_none() {
            return Ok(Removal::NotMember);
        }
        let active = tables
            .participants
            .values()
            .filter(|participant| participant.chat_id == chat_id && participant.is_active)
            .count();
        if active <= 1 {
            return Ok(Removal::LastMember);
        }
        if let Some(participant) = tables.participants.get_mut(&(chat_id, user_id)) {
            participant.is_active = false;
        }
        Ok(Removal::Removed)
    }

    async fn insert_message(&self, message: NewMessage) -> StoreResult<Option<Message>> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        if tables
            .active_participant(message.chat_id, message.user_id)
            .is_none()
        {
            return Ok(None);
        }

        let mut now = timestamp_now();
        if let Some(chat) = tables.chats.get_mut(&message.chat_id) {
            now = now.max(chat.updated_at);
            chat.updated_at = now;
        }
        let created = Message {
            id: Uuid::new_v4(),
            chat_id: message.chat_id,
            user_id: message.user_id,
            content: message.content,
            message_type: message.message_type,
            file_url: message.file_url,
            file_name: message.file_name,
            file_size: message.file_size,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        tables.messages.push(created.clone());
        Ok(Some(created))
    }

    async fn list_messages(&self, chat_id: Uuid, page: MessagePage) -> StoreResult<Vec<Message>> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        let visible = tables
            .messages
            .iter()
            .filter(|message| message.chat_id == chat_id && message.deleted_at.is_none());

        let limit = usize::try_from(page.limit).unwrap_or(0);
        let messages = match page.after {
            Some(after) => visible
                .filter(|message| message.created_at > after)
                .take(limit)
                .cloned()
                .collect(),
            None => visible
                .skip(usize::try_from(page.offset).unwrap_or(0))
                .take(limit)
                .cloned()
                .collect(),
        };
        Ok(messages)
    }

    async fn get_message(&self, message_id: Uuid) -> StoreResult<Option<Message>> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .messages
            .iter()
            .find(|message| message.id == message_id && message.deleted_at.is_none())
            .cloned())
    }

    async fn update_message_content(
        &self,
        message_id: Uuid,
        content: &str,
    ) -> StoreResult<Option<Message>> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        Ok(tables.live_message_mut(message_id).map(|message| {
            message.content = content.to_owned();
            message.updated_at = timestamp_now();
            message.clone()
        }))
    }

    async fn soft_delete_message(&self, message_id: Uuid) -> StoreResult<bool> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        Ok(match tables.live_message_mut(message_id) {
            Some(message) => {
                let now = timestamp_now();
                message.deleted_at = Some(now);
                message.updated_at = now;
                true
            }
            None => false,
        })
    }

    async fn insert_read(&self, message_id: Uuid, user_id: Uuid) -> StoreResult<bool> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        if tables.reads.contains_key(&(message_id, user_id)) {
            return Ok(false);
        }
        tables.reads.insert(
            (message_id, user_id),
            ReadReceipt {
                message_id,
                user_id,
                read_at: timestamp_now(),
            },
        );
        Ok(true)
    }

    async fn count_reads(&self, message_id: Uuid) -> StoreResult<i64> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .reads
            .keys()
            .filter(|(read_message, _)| *read_message == message_id)
            .count() as i64)
    }

    async fn advance_last_read(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        match tables.participants.get_mut(&(chat_id, user_id)) {
            Some(participant) if participant.is_active => {
                if participant.last_read_at.map_or(true, |mark| mark < at) {
                    participant.last_read_at = Some(at);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn unread_count(&self, chat_id: Uuid, user_id: Uuid) -> StoreResult<i64> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        let Some(participant) = tables.active_participant(chat_id, user_id) else {
            return Ok(0);
        };
        let mark = participant.last_read_at;
        Ok(tables
            .messages
            .iter()
            .filter(|message| message.chat_id == chat_id)
            .filter(|message| message.user_id != user_id && message.deleted_at.is_none())
            .filter(|message| mark.map_or(true, |mark| message.created_at > mark))
            .count() as i64)
    }

    async fn upsert_presence(&self, record: PresenceRecord) -> StoreResult<bool> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        if let Some(stored) = tables.presence.get(&record.user_id) {
            if stored.last_seen > record.last_seen {
                return Ok(false);
            }
        }
        tables.presence.insert(record.user_id, record);
        Ok(true)
    }

    async fn get_presence(&self, user_id: Uuid) -> StoreResult<Option<PresenceRecord>> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        Ok(tables.presence.get(&user_id).cloned())
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn display_name(&self, user_id: Uuid) -> StoreResult<Option<String>> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        Ok(tables.users.get(&user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChatType, MessageType, PresenceStatus};

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

    async fn group_chat(store: &MemoryStore, members: &[Uuid]) -> Chat {
        store
            .create_chat(
                NewChat {
                    workspace_id: Uuid::new_v4(),
                    project_id: None,
                    chat_type: ChatType::Group,
                    name: Some("general".to_string()),
                    created_by: members[0],
                },
                members,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn removed_participant_is_reactivated_on_rejoin() {
        let store = MemoryStore::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let chat = group_chat(&store, &[alice, bob]).await;

        assert_eq!(store.remove_participant(chat.id, bob).await.unwrap(), Removal::Removed);
        assert!(!store.is_active_participant(chat.id, bob).await.unwrap());
        assert_eq!(store.remove_participant(chat.id, bob).await.unwrap(), Removal::NotMember);
        assert_eq!(store.remove_participant(chat.id, alice).await.unwrap(), Removal::LastMember);
        assert!(store.is_active_participant(chat.id, alice).await.unwrap());

        let rejoined = store.add_participant(chat.id, bob).await.unwrap();
        assert!(rejoined.is_active);
        assert_eq!(store.list_participants(chat.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn last_read_mark_never_moves_backwards() {
        let store = MemoryStore::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let chat = group_chat(&store, &[alice, bob]).await;
        let first = store.insert_message(text(chat.id, alice, "one")).await.unwrap().unwrap();
        let second = store.insert_message(text(chat.id, alice, "two")).await.unwrap().unwrap();

        store
            .advance_last_read(chat.id, bob, second.created_at)
            .await
            .unwrap();
        store
            .advance_last_read(chat.id, bob, first.created_at)
            .await
            .unwrap();

        assert_eq!(store.unread_count(chat.id, bob).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_presence_write_is_ignored() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        let workspace_id = Uuid::new_v4();
        let newer = timestamp_now();
        let older = newer - chrono::Duration::seconds(5);

        let online = PresenceRecord {
            user_id,
            workspace_id,
            status: PresenceStatus::Online,
            last_seen: newer,
        };
        assert!(store.upsert_presence(online.clone()).await.unwrap());
        let stale = PresenceRecord {
            status: PresenceStatus::Offline,
            last_seen: older,
            ..online.clone()
        };
        assert!(!store.upsert_presence(stale).await.unwrap());

        let stored = store.get_presence(user_id).await.unwrap().unwrap();
        assert_eq!(stored.status, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn offline_store_reports_unavailable() {
        let store = MemoryStore::new();
        store.set_available(false);
        let err = store.get_chat(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
