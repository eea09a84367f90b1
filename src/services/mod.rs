pub mod messages;
pub mod presence;

pub use messages::MessageService;
pub use presence::PresenceService;

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::bus::{BusError, PubSub};
use crate::events::ChatEvent;

/// One async lock per key with work in flight. Entries are dropped once
/// nobody holds or waits on them.
pub(crate) struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Copy> KeyedLocks<K> {
    pub(crate) fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn acquire(&self, key: K) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(key).or_default().clone()
    }

    pub(crate) async fn release(&self, key: K, lock: Arc<Mutex<()>>) {
        drop(lock);
        let mut locks = self.locks.lock().await;
        if locks
            .get(&key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&key);
        }
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

/// Serializes and publishes an event. Callers log failures and move on; a
/// lost publish only costs live delivery, never the stored record.
pub(crate) async fn publish_event(
    bus: &dyn PubSub,
    channel: &str,
    event: &ChatEvent,
) -> Result<(), BusError> {
    let payload = serde_json::to_string(event)?;
    bus.publish(channel, payload).await
}
