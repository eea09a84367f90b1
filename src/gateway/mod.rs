//! Connection registry and fan-out for live sockets.
//!
//! Each connection owns a bounded outbound queue. Rooms are bus channels with
//! at least one local member. The first member starts the upstream
//! subscription, every member waits for its outcome, and the last one to
//! leave aborts the drain task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::bus::{chat_channel, presence_channel, PubSub, Subscription};
use crate::error::{ChatError, ChatResult};
use crate::events::{ClientFrame, ControlFrame};
use crate::models::Message;
use crate::services::messages::MessageDraft;
use crate::services::{MessageService, PresenceService};

pub mod session;

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Chat,
    /// Receives workspace presence only and may not join chat rooms.
    Presence,
}

impl ConnectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionKind::Chat => "chat",
            ConnectionKind::Presence => "presence",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Subscribed(Uuid),
    Disconnected,
}

struct Connection {
    user_id: Uuid,
    workspace_id: Uuid,
    kind: ConnectionKind,
    state: ConnectionState,
    outbound: mpsc::Sender<String>,
    /// Channels whose room lists this connection, including joins still
    /// waiting on the upstream subscription.
    joined: HashSet<String>,
}

impl Connection {
    fn room(&self) -> Option<Uuid> {
        match self.state {
            ConnectionState::Subscribed(chat_id) => Some(chat_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
enum Upstream {
    Opening,
    Open,
    Failed(String),
}

struct Room {
    /// Distinguishes this room from a later one on the same channel.
    generation: u64,
    members: HashSet<ConnectionId>,
    drain: Option<JoinHandle<()>>,
    upstream: watch::Sender<Upstream>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<String, Room>,
    generations: u64,
}

impl Registry {
    /// Adds the member. Returns the room's upstream status, plus the
    /// generation when this call created the room and must open it.
    fn enter(
        &mut self,
        channel: &str,
        connection_id: ConnectionId,
    ) -> (watch::Receiver<Upstream>, Option<u64>) {
        if let Some(connection) = self.connections.get_mut(&connection_id) {
            connection.joined.insert(channel.to_owned());
        }
        if let Some(room) = self.rooms.get_mut(channel) {
            room.members.insert(connection_id);
            return (room.upstream.subscribe(), None);
        }

        self.generations += 1;
        let (upstream, status) = watch::channel(Upstream::Opening);
        self.rooms.insert(
            channel.to_owned(),
            Room {
                generation: self.generations,
                members: HashSet::from([connection_id]),
                drain: None,
                upstream,
            },
        );
        (status, Some(self.generations))
    }

    /// Removes the member and tears the room down when it was the last one.
    fn leave(&mut self, channel: &str, connection_id: ConnectionId) {
        if let Some(connection) = self.connections.get_mut(&connection_id) {
            connection.joined.remove(channel);
        }
        let Some(room) = self.rooms.get_mut(channel) else {
            return;
        };
        room.members.remove(&connection_id);
        if room.members.is_empty() {
            if let Some(room) = self.rooms.remove(channel) {
                if let Some(drain) = room.drain {
                    drain.abort();
                }
                debug!(%channel, "closed upstream subscription");
            }
        }
    }

    /// Drops the room with every member and tells waiting joiners why.
    fn fail_room(&mut self, channel: &str, reason: String) {
        let Some(room) = self.rooms.remove(channel) else {
            return;
        };
        for connection_id in &room.members {
            if let Some(connection) = self.connections.get_mut(connection_id) {
                connection.joined.remove(channel);
            }
        }
        room.upstream.send_replace(Upstream::Failed(reason));
    }

    fn deliver(&self, channel: &str, payload: &str) {
        let Some(room) = self.rooms.get(channel) else {
            return;
        };
        for connection_id in &room.members {
            let Some(connection) = self.connections.get(connection_id) else {
                continue;
            };
            match connection.outbound.try_send(payload.to_owned()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        %connection_id,
                        user_id = %connection.user_id,
                        %channel,
                        "outbound queue full, dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(%connection_id, %channel, "outbound queue closed");
                }
            }
        }
    }
}

pub struct Gateway {
    registry: Arc<Mutex<Registry>>,
    bus: Arc<dyn PubSub>,
    messages: Arc<MessageService>,
    presence: Arc<PresenceService>,
    queue_capacity: usize,
}

impl Gateway {
    pub fn new(
        bus: Arc<dyn PubSub>,
        messages: Arc<MessageService>,
        presence: Arc<PresenceService>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            bus,
            messages,
            presence,
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Registers an authenticated connection, joins its workspace presence
    /// channel and marks the user online. The receiver feeds the socket
    /// writer.
    pub async fn connect(
        &self,
        user: &AuthenticatedUser,
        workspace_id: Uuid,
        kind: ConnectionKind,
    ) -> ChatResult<(ConnectionId, mpsc::Receiver<String>)> {
        let connection_id = Uuid::new_v4();
        let (outbound, receiver) = mpsc::channel(self.queue_capacity);
        {
            let mut registry = self.registry.lock().await;
            registry.connections.insert(
                connection_id,
                Connection {
                    user_id: user.user_id,
                    workspace_id,
                    kind,
                    state: ConnectionState::Connecting,
                    outbound,
                    joined: HashSet::new(),
                },
            );
        }

        if let Err(err) = self
            .join(connection_id, &presence_channel(workspace_id))
            .await
        {
            self.registry.lock().await.connections.remove(&connection_id);
            return Err(err);
        }

        self.presence.set_online(user.user_id, workspace_id).await;
        self.set_state(connection_id, ConnectionState::Authenticated)
            .await;
        info!(
            %connection_id,
            user_id = %user.user_id,
            %workspace_id,
            kind = kind.as_str(),
            "connection opened"
        );
        Ok((connection_id, receiver))
    }

    /// Joins the chat room, leaving the previously joined one. Requires an
    /// active participant on a chat connection.
    pub async fn subscribe(&self, connection_id: ConnectionId, chat_id: Uuid) -> ChatResult<()> {
        let (user_id, kind, current) = self.describe(connection_id).await?;
        if kind == ConnectionKind::Presence {
            return Err(ChatError::forbidden(
                "presence connections cannot join chat rooms",
            ));
        }
        if !self.messages.is_participant(chat_id, user_id).await? {
            return Err(ChatError::forbidden("not a participant of this chat"));
        }
        if current == Some(chat_id) {
            return Ok(());
        }

        if let Some(previous) = current {
            self.leave(connection_id, &chat_channel(previous)).await;
            self.set_state(connection_id, ConnectionState::Authenticated)
                .await;
        }
        if let Err(err) = self.join(connection_id, &chat_channel(chat_id)).await {
            self.set_state(connection_id, ConnectionState::Authenticated)
                .await;
            return Err(err);
        }

        let still_connected = self
            .set_state(connection_id, ConnectionState::Subscribed(chat_id))
            .await;
        if !still_connected {
            self.leave(connection_id, &chat_channel(chat_id)).await;
            return Err(ChatError::Unauthenticated);
        }
        debug!(%connection_id, %chat_id, "subscribed");
        Ok(())
    }

    /// Leaves the current room. Returns the chat that was left, if any.
    pub async fn unsubscribe(&self, connection_id: ConnectionId) -> ChatResult<Option<Uuid>> {
        let (_, _, current) = self.describe(connection_id).await?;
        let Some(chat_id) = current else {
            return Ok(None);
        };
        self.leave(connection_id, &chat_channel(chat_id)).await;
        self.set_state(connection_id, ConnectionState::Authenticated)
            .await;
        debug!(%connection_id, %chat_id, "unsubscribed");
        Ok(Some(chat_id))
    }

    /// Drops every registration of the connection and marks the user offline
    /// for this connection. Safe to call more than once.
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        let removed = {
            let mut registry = self.registry.lock().await;
            let Some(connection) = registry.connections.remove(&connection_id) else {
                return;
            };
            for channel in &connection.joined {
                registry.leave(channel, connection_id);
            }
            connection
        };

        self.presence
            .set_offline(removed.user_id, removed.workspace_id)
            .await;
        info!(
            %connection_id,
            user_id = %removed.user_id,
            workspace_id = %removed.workspace_id,
            "connection closed"
        );
    }

    /// Sends a message into the connection's current room.
    pub async fn send_message(
        &self,
        connection_id: ConnectionId,
        draft: MessageDraft,
    ) -> ChatResult<Message> {
        let (user_id, _, current) = self.describe(connection_id).await?;
        let chat_id =
            current.ok_or_else(|| ChatError::bad_request("subscribe to a chat first"))?;
        self.messages.create_message(chat_id, user_id, draft).await
    }

    pub async fn state(&self, connection_id: ConnectionId) -> ConnectionState {
        let registry = self.registry.lock().await;
        registry
            .connections
            .get(&connection_id)
            .map(|connection| connection.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Local connections currently joined to the channel.
    pub async fn local_members(&self, channel: &str) -> usize {
        let registry = self.registry.lock().await;
        registry
            .rooms
            .get(channel)
            .map(|room| room.members.len())
            .unwrap_or(0)
    }

    /// Dispatches one inbound text frame. Failures become an `ERROR` reply;
    /// the connection stays open.
    pub async fn handle_frame(&self, connection_id: ConnectionId, text: &str) {
        let frame = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%connection_id, error = %err, "unparseable client frame");
                self.reply_error(
                    connection_id,
                    &ChatError::bad_request(format!("invalid frame: {err}")),
                )
                .await;
                return;
            }
        };

        match self.dispatch(connection_id, frame).await {
            Ok(Some(reply)) => self.reply(connection_id, &reply).await,
            Ok(None) => {}
            Err(err) => self.reply_error(connection_id, &err).await,
        }
    }

    async fn dispatch(
        &self,
        connection_id: ConnectionId,
        frame: ClientFrame,
    ) -> ChatResult<Option<ControlFrame>> {
        match frame {
            ClientFrame::Subscribe { chat_id } => {
                self.subscribe(connection_id, chat_id).await?;
                Ok(Some(ControlFrame::Subscribed { chat_id }))
            }
            ClientFrame::Unsubscribe => Ok(self
                .unsubscribe(connection_id)
                .await?
                .map(|chat_id| ControlFrame::Unsubscribed { chat_id })),
            ClientFrame::SendMessage {
                content,
                message_type,
                file_url,
                file_name,
                file_size,
            } => {
                let draft = MessageDraft {
                    content,
                    message_type,
                    file_url,
                    file_name,
                    file_size,
                };
                let message = self.send_message(connection_id, draft).await?;
                Ok(Some(ControlFrame::MessageSent {
                    message_id: message.id,
                    chat_id: message.chat_id,
                }))
            }
            ClientFrame::MarkRead { message_id } => {
                let (user_id, _, _) = self.describe(connection_id).await?;
                self.messages.mark_read(message_id, user_id).await?;
                Ok(Some(ControlFrame::Read { message_id }))
            }
            ClientFrame::SetStatus { status } => {
                let (user_id, workspace_id) = self.owner(connection_id).await?;
                self.presence
                    .set_status(user_id, workspace_id, status)
                    .await?;
                Ok(None)
            }
            ClientFrame::Ping => {
                let (user_id, workspace_id) = self.owner(connection_id).await?;
                self.presence.heartbeat(user_id, workspace_id).await;
                Ok(Some(ControlFrame::Pong))
            }
        }
    }

    async fn reply(&self, connection_id: ConnectionId, frame: &ControlFrame) {
        let payload = match serde_json::to_string(frame) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%connection_id, error = %err, "failed to encode reply");
                return;
            }
        };
        let registry = self.registry.lock().await;
        if let Some(connection) = registry.connections.get(&connection_id) {
            if let Err(TrySendError::Full(_)) = connection.outbound.try_send(payload) {
                warn!(%connection_id, "outbound queue full, dropping reply");
            }
        }
    }

    async fn reply_error(&self, connection_id: ConnectionId, err: &ChatError) {
        let frame = ControlFrame::Error {
            code: err.code().to_string(),
            message: err.public_message(),
        };
        self.reply(connection_id, &frame).await;
    }

    async fn describe(
        &self,
        connection_id: ConnectionId,
    ) -> ChatResult<(Uuid, ConnectionKind, Option<Uuid>)> {
        let registry = self.registry.lock().await;
        registry
            .connections
            .get(&connection_id)
            .map(|connection| (connection.user_id, connection.kind, connection.room()))
            .ok_or(ChatError::Unauthenticated)
    }

    async fn owner(&self, connection_id: ConnectionId) -> ChatResult<(Uuid, Uuid)> {
        let registry = self.registry.lock().await;
        registry
            .connections
            .get(&connection_id)
            .map(|connection| (connection.user_id, connection.workspace_id))
            .ok_or(ChatError::Unauthenticated)
    }

    /// Returns false when the connection is gone.
    async fn set_state(&self, connection_id: ConnectionId, state: ConnectionState) -> bool {
        let mut registry = self.registry.lock().await;
        match registry.connections.get_mut(&connection_id) {
            Some(connection) => {
                connection.state = state;
                true
            }
            None => false,
        }
    }

    /// Adds the connection to the channel's room and waits until the room's
    /// upstream subscription is open. When it cannot be opened the room is
    /// dropped and every waiting member gets `Transient`.
    async fn join(&self, connection_id: ConnectionId, channel: &str) -> ChatResult<()> {
        let (mut status, generation) = self.registry.lock().await.enter(channel, connection_id);
        if let Some(generation) = generation {
            spawn_open(
                self.registry.clone(),
                self.bus.clone(),
                channel.to_owned(),
                generation,
            );
        }

        let outcome = status
            .wait_for(|upstream| !matches!(upstream, Upstream::Opening))
            .await
            .map(|upstream| (*upstream).clone())
            .unwrap_or_else(|_| Upstream::Failed("room closed".to_string()));
        match outcome {
            Upstream::Failed(reason) => {
                self.leave(connection_id, channel).await;
                Err(ChatError::Transient(reason))
            }
            Upstream::Opening | Upstream::Open => Ok(()),
        }
    }

    async fn leave(&self, connection_id: ConnectionId, channel: &str) {
        self.registry.lock().await.leave(channel, connection_id);
    }
}

/// Opens the upstream subscription for a room outside the registry lock. It
/// runs detached so a joiner that goes away mid-open cannot strand the room.
fn spawn_open(
    registry: Arc<Mutex<Registry>>,
    bus: Arc<dyn PubSub>,
    channel: String,
    generation: u64,
) {
    tokio::spawn(async move {
        let opened = bus.subscribe(&channel).await;
        let mut guard = registry.lock().await;
        let current = guard
            .rooms
            .get(&channel)
            .is_some_and(|room| room.generation == generation);
        match opened {
            Ok(subscription) if current => {
                let drain = spawn_drain(registry.clone(), subscription);
                if let Some(room) = guard.rooms.get_mut(&channel) {
                    room.drain = Some(drain);
                    room.upstream.send_replace(Upstream::Open);
                }
                debug!(%channel, "opened upstream subscription");
            }
            Ok(_) => debug!(%channel, "room closed before upstream subscription opened"),
            Err(err) => {
                warn!(%channel, error = %err, "failed to open upstream subscription");
                if current {
                    guard.fail_room(&channel, err.to_string());
                }
            }
        }
    });
}

fn spawn_drain(registry: Arc<Mutex<Registry>>, mut subscription: Subscription) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = subscription.next_event().await {
            registry.lock().await.deliver(subscription.channel(), &payload);
        }
        warn!(channel = subscription.channel(), "upstream subscription ended");
    })
}
