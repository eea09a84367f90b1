use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tracing::warn;

use super::{BusError, PubSub, Subscription};

/// In-process bus: one tokio broadcast channel per channel name, created on
/// first subscribe. Channels without receivers are pruned on the next
/// publish, subscribe or count that sees them.
pub struct LocalBus {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Number of live upstream subscriptions on the channel.
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        let mut channels = self.channels.lock().await;
        let count = channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0);
        if count == 0 {
            channels.remove(channel);
        }
        count
    }

    #[cfg(test)]
    async fn channel_count(&self) -> usize {
        self.channels.lock().await.len()
    }
}

#[async_trait]
impl PubSub for LocalBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        let mut channels = self.channels.lock().await;
        if let Some(sender) = channels.get(channel) {
            if sender.send(payload).is_err() {
                channels.remove(channel);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        let receiver = {
            let mut channels = self.channels.lock().await;
            channels.retain(|_, sender| sender.receiver_count() > 0);
            channels
                .entry(channel.to_owned())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };

        let name = channel.to_owned();
        let events = stream::unfold(receiver, move |mut receiver| {
            let name = name.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(payload) => return Some((payload, receiver)),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(channel = %name, skipped, "bus subscriber lagged, events dropped");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed();

        Ok(Subscription::new(channel, events))
    }
}
