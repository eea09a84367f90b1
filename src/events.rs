//! Wire formats. Every frame is a JSON object tagged by a `type` field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, MessageType, PresenceStatus};

/// Envelope published on the bus and delivered verbatim to subscribed
/// connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatEvent {
    MessageReceived(MessageReceived),
    UserStatus(UserStatus),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReceived {
    pub message_id: Uuid,
    pub chat_id: Uuid,
    pub user_id: Uuid,
    pub user_name: String,
    pub content: String,
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl MessageReceived {
    pub fn from_message(message: &Message, user_name: impl Into<String>) -> Self {
        Self {
            message_id: message.id,
            chat_id: message.chat_id,
            user_id: message.user_id,
            user_name: user_name.into(),
            content: message.content.clone(),
            message_type: message.message_type,
            file_url: message.file_url.clone(),
            file_name: message.file_name.clone(),
            file_size: message.file_size,
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
    pub user_id: Uuid,
    pub status: PresenceStatus,
}

/// Frames a client may send over its socket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Subscribe { chat_id: Uuid },
    Unsubscribe,
    #[serde(rename_all = "camelCase")]
    SendMessage {
        content: String,
        #[serde(default)]
        message_type: MessageType,
        #[serde(default)]
        file_url: Option<String>,
        #[serde(default)]
        file_name: Option<String>,
        #[serde(default)]
        file_size: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    MarkRead { message_id: Uuid },
    SetStatus { status: PresenceStatus },
    Ping,
}

/// Direct replies to the connection that sent a frame. Never published.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlFrame {
    #[serde(rename_all = "camelCase")]
    Subscribed { chat_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Unsubscribed { chat_id: Uuid },
    #[serde(rename_all = "camelCase")]
    MessageSent { message_id: Uuid, chat_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Read { message_id: Uuid },
    Pong,
    Error { code: String, message: String },
}
