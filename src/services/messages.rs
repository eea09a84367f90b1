use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{publish_event, KeyedLocks};
use crate::bus::{chat_channel, PubSub};
use crate::error::{ChatError, ChatResult};
use crate::events::{ChatEvent, MessageReceived};
use crate::models::{
    Chat, ChatType, Message, MessagePage, MessageType, NewChat, NewMessage, Participant,
};
use crate::store::{timestamp_now, ChatStore, Removal, UserDirectory};

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 100;
pub const MAX_CONTENT_LENGTH: usize = 10_000;

const UNKNOWN_AUTHOR: &str = "Unknown user";

#[derive(Debug, Clone)]
pub struct ChatDraft {
    pub workspace_id: Uuid,
    pub project_id: Option<Uuid>,
    pub chat_type: ChatType,
    pub name: Option<String>,
    pub participant_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct MessageDraft {
    pub content: String,
    pub message_type: MessageType,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
}

impl MessageDraft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

/// Listing parameters as received from clients. `after` is a unix timestamp in
/// milliseconds and takes precedence over `offset`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageRequest {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub after: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatDetail {
    pub chat: Chat,
    pub participants: Vec<Participant>,
}

/// Validates participation, persists messages and read state, and publishes
/// one `MESSAGE_RECEIVED` event per created message.
pub struct MessageService {
    store: Arc<dyn ChatStore>,
    directory: Arc<dyn UserDirectory>,
    bus: Arc<dyn PubSub>,
    chat_locks: KeyedLocks<Uuid>,
}

impl MessageService {
    pub fn new(
        store: Arc<dyn ChatStore>,
        directory: Arc<dyn UserDirectory>,
        bus: Arc<dyn PubSub>,
    ) -> Self {
        Self {
            store,
            directory,
            bus,
            chat_locks: KeyedLocks::new(),
        }
    }

    pub async fn create_chat(&self, creator: Uuid, draft: ChatDraft) -> ChatResult<Chat> {
        let mut participants = vec![creator];
        for user_id in draft.participant_ids {
            if !participants.contains(&user_id) {
                participants.push(user_id);
            }
        }

        match draft.chat_type {
            ChatType::Direct if participants.len() != 2 => {
                return Err(ChatError::bad_request(
                    "direct chats need exactly one other participant",
                ));
            }
            ChatType::Project if draft.project_id.is_none() => {
                return Err(ChatError::bad_request("project chats need a project_id"));
            }
            _ => {}
        }

        let name = draft
            .name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());

        let chat = self
            .store
            .create_chat(
                NewChat {
                    workspace_id: draft.workspace_id,
                    project_id: draft.project_id,
                    chat_type: draft.chat_type,
                    name,
                    created_by: creator,
                },
                &participants,
            )
            .await?;
        info!(chat_id = %chat.id, chat_type = chat.chat_type.as_str(), participants = participants.len(), "chat created");
        Ok(chat)
    }

    pub async fn list_chats(&self, workspace_id: Uuid, user_id: Uuid) -> ChatResult<Vec<Chat>> {
        Ok(self.store.list_chats_for_user(workspace_id, user_id).await?)
    }

    pub async fn get_chat(&self, chat_id: Uuid, user_id: Uuid) -> ChatResult<ChatDetail> {
        self.ensure_participant(chat_id, user_id).await?;
        let chat = self
            .store
            .get_chat(chat_id)
            .await?
            .ok_or(ChatError::NotFound("chat"))?;
        let participants = self.store.list_participants(chat_id).await?;
        Ok(ChatDetail { chat, participants })
    }

    pub async fn is_participant(&self, chat_id: Uuid, user_id: Uuid) -> ChatResult<bool> {
        Ok(self.store.is_active_participant(chat_id, user_id).await?)
    }

    /// `NotFound` when the chat is gone, `Forbidden` when the user is not an
    /// active participant.
    pub async fn ensure_participant(&self, chat_id: Uuid, user_id: Uuid) -> ChatResult<()> {
        if self.store.is_active_participant(chat_id, user_id).await? {
            return Ok(());
        }
        match self.store.get_chat(chat_id).await? {
            Some(_) => Err(ChatError::forbidden("not a participant of this chat")),
            None => Err(ChatError::NotFound("chat")),
        }
    }

    pub async fn add_participant(
        &self,
        actor: Uuid,
        chat_id: Uuid,
        user_id: Uuid,
    ) -> ChatResult<Participant> {
        self.ensure_participant(chat_id, actor).await?;
        let chat = self
            .store
            .get_chat(chat_id)
            .await?
            .ok_or(ChatError::NotFound("chat"))?;
        if chat.chat_type == ChatType::Direct {
            return Err(ChatError::bad_request(
                "direct chats have a fixed set of participants",
            ));
        }
        let participant = self.store.add_participant(chat_id, user_id).await?;
        info!(%chat_id, %user_id, added_by = %actor, "participant added");
        Ok(participant)
    }

    pub async fn remove_participant(
        &self,
        actor: Uuid,
        chat_id: Uuid,
        user_id: Uuid,
    ) -> ChatResult<()> {
        self.ensure_participant(chat_id, actor).await?;
        let chat = self
            .store
            .get_chat(chat_id)
            .await?
            .ok_or(ChatError::NotFound("chat"))?;
        if chat.chat_type == ChatType::Direct {
            return Err(ChatError::bad_request(
                "direct chats have a fixed set of participants",
            ));
        }
        if actor != user_id && chat.created_by != actor {
            return Err(ChatError::forbidden(
                "only the chat creator can remove other participants",
            ));
        }

        match self.store.remove_participant(chat_id, user_id).await? {
            Removal::Removed => {
                info!(%chat_id, %user_id, removed_by = %actor, "participant removed");
                Ok(())
            }
            Removal::NotMember => Err(ChatError::NotFound("participant")),
            Removal::LastMember => Err(ChatError::bad_request(
                "cannot remove the last participant of a chat",
            )),
        }
    }

    /// Persists the message, then publishes it on the chat channel. Sends to
    /// one chat are serialised from the insert through the publish, so events
    /// leave this process in persist order. A failed publish never fails the
    /// send.
    pub async fn create_message(
        &self,
        chat_id: Uuid,
        author: Uuid,
        draft: MessageDraft,
    ) -> ChatResult<Message> {
        validate_draft(&draft)?;
        let user_name = self.resolve_display_name(author).await;

        let lock = self.chat_locks.acquire(chat_id).await;
        let stored = {
            let _ordered = lock.lock().await;
            self.store_and_publish(chat_id, author, draft, user_name)
                .await
        };
        self.chat_locks.release(chat_id, lock).await;
        stored
    }

    async fn store_and_publish(
        &self,
        chat_id: Uuid,
        author: Uuid,
        draft: MessageDraft,
        user_name: String,
    ) -> ChatResult<Message> {
        let message = self
            .store
            .insert_message(NewMessage {
                chat_id,
                user_id: author,
                content: draft.content,
                message_type: draft.message_type,
                file_url: draft.file_url,
                file_name: draft.file_name,
                file_size: draft.file_size,
            })
            .await?
            .ok_or(ChatError::NotParticipant)?;
        debug!(%chat_id, message_id = %message.id, "message stored");

        let event = ChatEvent::MessageReceived(MessageReceived::from_message(&message, user_name));
        if let Err(err) = publish_event(self.bus.as_ref(), &chat_channel(chat_id), &event).await {
            warn!(
                %chat_id,
                message_id = %message.id,
                error = %err,
                "failed to publish message event"
            );
        }
        Ok(message)
    }

    pub async fn list_messages(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        request: PageRequest,
    ) -> ChatResult<Vec<Message>> {
        self.ensure_participant(chat_id, user_id).await?;
        let page = resolve_page(request)?;
        Ok(self.store.list_messages(chat_id, page).await?)
    }

    pub async fn update_message(
        &self,
        actor: Uuid,
        chat_id: Uuid,
        message_id: Uuid,
        content: String,
    ) -> ChatResult<Message> {
        let message = self.authored_message(actor, chat_id, message_id).await?;
        validate_content(message.message_type, &content)?;
        self.store
            .update_message_content(message_id, &content)
            .await?
            .ok_or(ChatError::NotFound("message"))
    }

    /// Soft delete. Read receipts for the message are left untouched.
    pub async fn delete_message(
        &self,
        actor: Uuid,
        chat_id: Uuid,
        message_id: Uuid,
    ) -> ChatResult<()> {
        self.authored_message(actor, chat_id, message_id).await?;
        if !self.store.soft_delete_message(message_id).await? {
            return Err(ChatError::NotFound("message"));
        }
        info!(%chat_id, %message_id, "message deleted");
        Ok(())
    }

    /// Records that the user read the message and moves their last-read mark
    /// up to it. Returns false when the read was already recorded.
    pub async fn mark_read(&self, message_id: Uuid, user_id: Uuid) -> ChatResult<bool> {
        let message = self
            .store
            .get_message(message_id)
            .await?
            .ok_or(ChatError::NotFound("message"))?;
        self.ensure_participant(message.chat_id, user_id).await?;

        let inserted = self.store.insert_read(message_id, user_id).await?;
        self.store
            .advance_last_read(message.chat_id, user_id, message.created_at)
            .await?;
        Ok(inserted)
    }

    pub async fn update_last_read(&self, chat_id: Uuid, user_id: Uuid) -> ChatResult<()> {
        self.ensure_participant(chat_id, user_id).await?;
        self.store
            .advance_last_read(chat_id, user_id, timestamp_now())
            .await?;
        Ok(())
    }

    pub async fn unread_count(&self, chat_id: Uuid, user_id: Uuid) -> ChatResult<i64> {
        self.ensure_participant(chat_id, user_id).await?;
        Ok(self.store.unread_count(chat_id, user_id).await?)
    }

    async fn authored_message(
        &self,
        actor: Uuid,
        chat_id: Uuid,
        message_id: Uuid,
    ) -> ChatResult<Message> {
        self.ensure_participant(chat_id, actor).await?;
        let message = self
            .store
            .get_message(message_id)
            .await?
            .filter(|message| message.chat_id == chat_id)
            .ok_or(ChatError::NotFound("message"))?;
        if message.user_id != actor {
            return Err(ChatError::forbidden(
                "only the author can change this message",
            ));
        }
        Ok(message)
    }

    async fn resolve_display_name(&self, user_id: Uuid) -> String {
        match self.directory.display_name(user_id).await {
            Ok(Some(name)) => name,
            Ok(None) => {
                debug!(%user_id, "no directory entry for author");
                UNKNOWN_AUTHOR.to_string()
            }
            Err(err) => {
                warn!(%user_id, error = %err, "display name lookup failed");
                UNKNOWN_AUTHOR.to_string()
            }
        }
    }
}

fn validate_draft(draft: &MessageDraft) -> ChatResult<()> {
    validate_content(draft.message_type, &draft.content)?;
    if draft.message_type.requires_file()
        && draft
            .file_url
            .as_deref()
            .map_or(true, |url| url.trim().is_empty())
    {
        return Err(ChatError::bad_request(format!(
            "{} messages need a file_url",
            draft.message_type.as_str()
        )));
    }
    if matches!(draft.file_size, Some(size) if size < 0) {
        return Err(ChatError::bad_request("file_size must not be negative"));
    }
    Ok(())
}

fn validate_content(message_type: MessageType, content: &str) -> ChatResult<()> {
    if message_type == MessageType::Text && content.trim().is_empty() {
        return Err(ChatError::bad_request("message content must not be empty"));
    }
    if content.chars().count() > MAX_CONTENT_LENGTH {
        return Err(ChatError::bad_request(format!(
            "message content exceeds {MAX_CONTENT_LENGTH} characters"
        )));
    }
    Ok(())
}

pub fn resolve_page(request: PageRequest) -> ChatResult<MessagePage> {
    let limit = request
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = request.offset.unwrap_or(0).max(0);
    let after = request
        .after
        .map(|millis| {
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| ChatError::bad_request("after is not a valid timestamp"))
        })
        .transpose()?;
    Ok(MessagePage {
        limit,
        offset,
        after,
    })
}
