use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{publish_event, KeyedLocks};
use crate::bus::{presence_channel, PubSub};
use crate::error::{ChatError, ChatResult};
use crate::events::{ChatEvent, UserStatus};
use crate::models::{PresenceRecord, PresenceStatus};
use crate::store::{timestamp_now, ChatStore};

#[derive(Debug, Clone, Copy)]
struct LocalPresence {
    connections: usize,
    status: PresenceStatus,
}

type WorkspaceMap = HashMap<Uuid, HashMap<Uuid, LocalPresence>>;

/// A user's presence as reported to API callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceView {
    pub user_id: Uuid,
    pub status: PresenceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Tracks which users hold live connections on this instance, mirrors
/// transitions into `user_presence` and announces them on the workspace
/// presence channel.
///
/// Transitions for one user in one workspace run one at a time, from the
/// local update through the announcement, so `USER_STATUS` events follow the
/// order of local state changes.
pub struct PresenceService {
    online: RwLock<WorkspaceMap>,
    transitions: KeyedLocks<(Uuid, Uuid)>,
    store: Arc<dyn ChatStore>,
    bus: Arc<dyn PubSub>,
}

impl PresenceService {
    pub fn new(store: Arc<dyn ChatStore>, bus: Arc<dyn PubSub>) -> Self {
        Self {
            online: RwLock::new(HashMap::new()),
            transitions: KeyedLocks::new(),
            store,
            bus,
        }
    }

    /// Registers one more local connection for the user. Announces the user
    /// only when this is their first connection in the workspace.
    pub async fn set_online(&self, user_id: Uuid, workspace_id: Uuid) {
        let lock = self.transitions.acquire((workspace_id, user_id)).await;
        {
            let _serial = lock.lock().await;
            self.connection_opened(user_id, workspace_id).await;
        }
        self.transitions.release((workspace_id, user_id), lock).await;
    }

    /// Drops one local connection. The user goes offline once none remain.
    pub async fn set_offline(&self, user_id: Uuid, workspace_id: Uuid) {
        let lock = self.transitions.acquire((workspace_id, user_id)).await;
        {
            let _serial = lock.lock().await;
            self.connection_closed(user_id, workspace_id).await;
        }
        self.transitions.release((workspace_id, user_id), lock).await;
    }

    pub async fn set_away(&self, user_id: Uuid, workspace_id: Uuid) -> ChatResult<()> {
        self.set_status(user_id, workspace_id, PresenceStatus::Away)
            .await
    }

    /// Explicit status change from a client. Only `online` and `away` may be
    /// chosen, and only while the user holds a connection in the workspace;
    /// `offline` follows from closing connections.
    pub async fn set_status(
        &self,
        user_id: Uuid,
        workspace_id: Uuid,
        status: PresenceStatus,
    ) -> ChatResult<()> {
        if status == PresenceStatus::Offline {
            return Err(ChatError::bad_request(
                "status must be either online or away",
            ));
        }

        let lock = self.transitions.acquire((workspace_id, user_id)).await;
        let changed = {
            let _serial = lock.lock().await;
            self.status_chosen(user_id, workspace_id, status).await
        };
        self.transitions.release((workspace_id, user_id), lock).await;
        changed
    }

    async fn connection_opened(&self, user_id: Uuid, workspace_id: Uuid) {
        let (status, transitioned, now) = {
            let mut online = self.online.write().await;
            let entry = online
                .entry(workspace_id)
                .or_default()
                .entry(user_id)
                .or_insert(LocalPresence {
                    connections: 0,
                    status: PresenceStatus::Online,
                });
            entry.connections += 1;
            (entry.status, entry.connections == 1, timestamp_now())
        };

        self.persist(user_id, workspace_id, status, now).await;
        if transitioned {
            debug!(%user_id, %workspace_id, "user online");
            self.announce(user_id, workspace_id, PresenceStatus::Online)
                .await;
        }
    }

    async fn connection_closed(&self, user_id: Uuid, workspace_id: Uuid) {
        let now = {
            let mut online = self.online.write().await;
            let Some(users) = online.get_mut(&workspace_id) else {
                return;
            };
            let Some(entry) = users.get_mut(&user_id) else {
                return;
            };
            entry.connections = entry.connections.saturating_sub(1);
            if entry.connections > 0 {
                return;
            }
            users.remove(&user_id);
            if users.is_empty() {
                online.remove(&workspace_id);
            }
            timestamp_now()
        };

        debug!(%user_id, %workspace_id, "user offline");
        self.persist(user_id, workspace_id, PresenceStatus::Offline, now)
            .await;
        self.announce(user_id, workspace_id, PresenceStatus::Offline)
            .await;
    }

    async fn status_chosen(
        &self,
        user_id: Uuid,
        workspace_id: Uuid,
        status: PresenceStatus,
    ) -> ChatResult<()> {
        let now = {
            let mut online = self.online.write().await;
            let entry = online
                .get_mut(&workspace_id)
                .and_then(|users| users.get_mut(&user_id))
                .ok_or_else(|| {
                    ChatError::bad_request("no live connection in this workspace")
                })?;
            entry.status = status;
            timestamp_now()
        };

        self.persist(user_id, workspace_id, status, now).await;
        self.announce(user_id, workspace_id, status).await;
        Ok(())
    }

    /// Refreshes `last_seen` for a user connected to this instance.
    pub async fn heartbeat(&self, user_id: Uuid, workspace_id: Uuid) {
        let snapshot = {
            let online = self.online.read().await;
            online
                .get(&workspace_id)
                .and_then(|users| users.get(&user_id))
                .map(|entry| (entry.status, timestamp_now()))
        };
        if let Some((status, now)) = snapshot {
            self.persist(user_id, workspace_id, status, now).await;
        }
    }

    pub async fn is_online(&self, user_id: Uuid, workspace_id: Uuid) -> bool {
        let online = self.online.read().await;
        online
            .get(&workspace_id)
            .is_some_and(|users| users.contains_key(&user_id))
    }

    /// Users with at least one connection to this instance, sorted.
    pub async fn list_online(&self, workspace_id: Uuid) -> Vec<Uuid> {
        let online = self.online.read().await;
        let mut users: Vec<Uuid> = online
            .get(&workspace_id)
            .map(|users| users.keys().copied().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    pub async fn has_workspace(&self, workspace_id: Uuid) -> bool {
        self.online.read().await.contains_key(&workspace_id)
    }

    /// Local state wins; otherwise the durable row, or offline when there is
    /// none.
    pub async fn user_status(&self, user_id: Uuid) -> ChatResult<PresenceView> {
        let local = {
            let online = self.online.read().await;
            online
                .values()
                .find_map(|users| users.get(&user_id).map(|entry| entry.status))
        };

        let record = match self.store.get_presence(user_id).await {
            Ok(record) => record,
            Err(err) if local.is_some() => {
                warn!(%user_id, error = %err, "presence lookup failed");
                None
            }
            Err(err) => return Err(err.into()),
        };
        let last_seen = record.as_ref().map(|record| record.last_seen);

        let status = match (local, record) {
            (Some(status), _) => status,
            (None, Some(record)) => record.status,
            (None, None) => PresenceStatus::Offline,
        };
        Ok(PresenceView {
            user_id,
            status,
            last_seen,
        })
    }

    async fn persist(
        &self,
        user_id: Uuid,
        workspace_id: Uuid,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    ) {
        let record = PresenceRecord {
            user_id,
            workspace_id,
            status,
            last_seen,
        };
        match self.store.upsert_presence(record).await {
            Ok(true) => {}
            Ok(false) => debug!(%user_id, %status, "skipped stale presence write"),
            Err(err) => warn!(%user_id, %workspace_id, error = %err, "failed to persist presence"),
        }
    }

    async fn announce(&self, user_id: Uuid, workspace_id: Uuid, status: PresenceStatus) {
        let event = ChatEvent::UserStatus(UserStatus { user_id, status });
        if let Err(err) =
            publish_event(self.bus.as_ref(), &presence_channel(workspace_id), &event).await
        {
            warn!(%user_id, %workspace_id, error = %err, "failed to publish presence event");
        }
    }
}
