use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use thiserror::Error;
use uuid::Uuid;

pub mod local;

pub use local::LocalBus;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// At-most-once broadcast keyed by channel name. Delivery order is preserved
/// per subscriber; nothing is retained for subscribers that join later.
#[async_trait]
pub trait PubSub: Send + Sync + 'static {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError>;

    /// Opens a subscription. Dropping it cancels the upstream registration.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError>;
}

pub struct Subscription {
    channel: String,
    events: BoxStream<'static, String>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, events: BoxStream<'static, String>) -> Self {
        Self {
            channel: channel.into(),
            events,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits for the next payload. `None` once the channel is closed.
    pub async fn next_event(&mut self) -> Option<String> {
        self.events.next().await
    }
}

pub fn chat_channel(chat_id: Uuid) -> String {
    format!("chat:{chat_id}")
}

pub fn presence_channel(workspace_id: Uuid) -> String {
    format!("presence:{workspace_id}")
}
