//! Channels: one topic subscription on the shared socket.

use super::socket::{PushOutcome, RealtimeClient};
use crate::error::{ConnectionError, SendError};
use crate::ClientError;
use parking_lot::RwLock;
use realtime_kit_protocol::presence::{self, PresenceChange};
use realtime_kit_protocol::{
    events, realtime_topic, BroadcastMessage, ChannelConfig, ChannelState, HttpBroadcastMessage,
    JoinPayload, PhoenixMessage, PresenceDiff, PresenceEntry, PresenceMessage, PresenceState,
    ReplyPayload, ReplyStatus,
};
use serde_json::Value;
use std::sync::Arc;

/// Outcome of [`RealtimeChannel::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeStatus {
    Subscribed,
    TimedOut,
    Closed,
    /// The service refused the join. Carries the reason it gave.
    ChannelError(String),
}

/// Outcome of a push on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStatus {
    Ok,
    TimedOut,
    Error(String),
}

/// Presence callback argument.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// The local presence state finished applying a snapshot or diff.
    Sync,
    Join {
        key: String,
        current: Option<PresenceEntry>,
        joined: PresenceEntry,
    },
    Leave {
        key: String,
        current: PresenceEntry,
        left: PresenceEntry,
    },
}

impl PresenceEvent {
    /// Event name used when binding: `sync`, `join` or `leave`.
    pub fn kind(&self) -> &'static str {
        match self {
            PresenceEvent::Sync => "sync",
            PresenceEvent::Join { .. } => "join",
            PresenceEvent::Leave { .. } => "leave",
        }
    }
}

impl From<PresenceChange> for PresenceEvent {
    fn from(change: PresenceChange) -> Self {
        match change {
            PresenceChange::Join {
                key,
                current,
                joined,
            } => PresenceEvent::Join {
                key,
                current,
                joined,
            },
            PresenceChange::Leave { key, current, left } => {
                PresenceEvent::Leave { key, current, left }
            }
        }
    }
}

type BroadcastCallback = Arc<dyn Fn(&BroadcastMessage) + Send + Sync>;
type PresenceCallback = Arc<dyn Fn(&PresenceEvent) + Send + Sync>;
type SystemCallback = Arc<dyn Fn(&Value) + Send + Sync>;

enum Binding {
    Broadcast {
        event: String,
        callback: BroadcastCallback,
    },
    Presence {
        event: String,
        callback: PresenceCallback,
    },
    System(SystemCallback),
}

pub(crate) struct ChannelInner {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) topic: String,
    config: ChannelConfig,
    state: RwLock<ChannelState>,
    join_ref: RwLock<Option<String>>,
    bindings: RwLock<Vec<Binding>>,
    presence: RwLock<PresenceState>,
}

impl ChannelInner {
    pub(crate) fn new(id: u64, name: &str, config: ChannelConfig) -> Self {
        Self {
            id,
            name: name.to_string(),
            topic: realtime_topic(name),
            config,
            state: RwLock::new(ChannelState::Closed),
            join_ref: RwLock::new(None),
            bindings: RwLock::new(Vec::new()),
            presence: RwLock::new(PresenceState::new()),
        }
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state.read()
    }

    fn set_state(&self, state: ChannelState) {
        let mut current = self.state.write();
        if *current != state {
            tracing::debug!("Channel {}: {:?} -> {:?}", self.topic, *current, state);
            *current = state;
        }
    }

    pub(crate) fn join_ref(&self) -> Option<String> {
        self.join_ref.read().clone()
    }

    pub(crate) fn on_join_reply(&self, reply: &ReplyPayload) {
        match reply.status {
            ReplyStatus::Ok => self.set_state(ChannelState::Joined),
            ReplyStatus::Error | ReplyStatus::Timeout => {
                tracing::warn!("Join of {} refused: {}", self.topic, reply.reason());
                self.set_state(ChannelState::Errored);
            }
        }
    }

    pub(crate) fn on_socket_closed(&self, lost: bool) {
        match self.state() {
            ChannelState::Joined | ChannelState::Joining if lost => {
                self.set_state(ChannelState::Errored)
            }
            ChannelState::Closed => {}
            _ => self.set_state(ChannelState::Closed),
        }
        self.join_ref.write().take();
        self.presence.write().clear();
    }

    /// Handle a non-reply frame addressed to this channel's topic.
    pub(crate) fn dispatch(&self, msg: &PhoenixMessage) {
        let ours = match (&msg.join_ref, self.join_ref()) {
            (Some(theirs), Some(mine)) => *theirs == mine,
            (Some(_), None) => false,
            (None, _) => true,
        };

        match msg.event.as_str() {
            events::CLOSE if ours => {
                tracing::info!("Channel {} closed by server", self.topic);
                self.set_state(ChannelState::Closed);
                self.join_ref.write().take();
            }
            events::ERROR if ours => {
                tracing::warn!("Channel {} errored: {}", self.topic, msg.payload);
                self.set_state(ChannelState::Errored);
            }
            _ if self.state() != ChannelState::Joined => {
                tracing::trace!("Ignoring {} on {} while not joined", msg.event, self.topic);
            }
            events::BROADCAST => self.dispatch_broadcast(&msg.payload),
            events::PRESENCE_STATE => match serde_json::from_value::<PresenceState>(msg.payload.clone()) {
                Ok(snapshot) => {
                    let changes = {
                        let mut state = self.presence.write();
                        let (next, changes) = presence::sync_state(&state, &snapshot);
                        *state = next;
                        changes
                    };
                    self.dispatch_presence(changes);
                }
                Err(e) => tracing::warn!("Malformed presence_state on {}: {}", self.topic, e),
            },
            events::PRESENCE_DIFF => match serde_json::from_value::<PresenceDiff>(msg.payload.clone()) {
                Ok(diff) => {
                    let changes = {
                        let mut state = self.presence.write();
                        let (next, changes) = presence::sync_diff(&state, &diff);
                        *state = next;
                        changes
                    };
                    self.dispatch_presence(changes);
                }
                Err(e) => tracing::warn!("Malformed presence_diff on {}: {}", self.topic, e),
            },
            events::SYSTEM => {
                let callbacks: Vec<SystemCallback> = self
                    .bindings
                    .read()
                    .iter()
                    .filter_map(|b| match b {
                        Binding::System(cb) => Some(Arc::clone(cb)),
                        _ => None,
                    })
                    .collect();
                for callback in callbacks {
                    callback(&msg.payload);
                }
            }
            other => tracing::trace!("Unhandled event {} on {}", other, self.topic),
        }
    }

    fn dispatch_broadcast(&self, payload: &Value) {
        let message: BroadcastMessage = match serde_json::from_value(payload.clone()) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Malformed broadcast on {}: {}", self.topic, e);
                return;
            }
        };

        let callbacks: Vec<BroadcastCallback> = self
            .bindings
            .read()
            .iter()
            .filter_map(|b| match b {
                Binding::Broadcast { event, callback } if event == "*" || *event == message.event => {
                    Some(Arc::clone(callback))
                }
                _ => None,
            })
            .collect();

        for callback in callbacks {
            callback(&message);
        }
    }

    fn dispatch_presence(&self, changes: Vec<PresenceChange>) {
        let callbacks: Vec<(String, PresenceCallback)> = self
            .bindings
            .read()
            .iter()
            .filter_map(|b| match b {
                Binding::Presence { event, callback } => Some((event.clone(), Arc::clone(callback))),
                _ => None,
            })
            .collect();
        if callbacks.is_empty() {
            return;
        }

        let mut events: Vec<PresenceEvent> = changes.into_iter().map(PresenceEvent::from).collect();
        events.push(PresenceEvent::Sync);
        for event in &events {
            for (filter, callback) in &callbacks {
                if filter == "*" || filter == event.kind() {
                    callback(event);
                }
            }
        }
    }
}

/// Handle to a channel. Clones refer to the same channel.
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
    socket: RealtimeClient,
}

impl std::fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("topic", &self.inner.topic)
            .field("state", &self.inner.state())
            .field("private", &self.inner.config.private)
            .finish()
    }
}

impl RealtimeChannel {
    pub(crate) fn new(inner: Arc<ChannelInner>, socket: RealtimeClient) -> Self {
        Self { inner, socket }
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn join_ref(&self) -> Option<String> {
        self.inner.join_ref()
    }

    /// Channel name as given by the caller.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Wire topic, `realtime:<name>`.
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    pub fn is_joined(&self) -> bool {
        self.inner.state() == ChannelState::Joined
    }

    /// Call `callback` for broadcasts named `event`, or every broadcast for `"*"`.
    pub fn on_broadcast<F>(&self, event: &str, callback: F) -> &Self
    where
        F: Fn(&BroadcastMessage) + Send + Sync + 'static,
    {
        self.inner.bindings.write().push(Binding::Broadcast {
            event: event.to_string(),
            callback: Arc::new(callback),
        });
        self
    }

    /// Call `callback` for presence `sync`, `join` or `leave` events, or all of them for `"*"`.
    pub fn on_presence<F>(&self, event: &str, callback: F) -> &Self
    where
        F: Fn(&PresenceEvent) + Send + Sync + 'static,
    {
        self.inner.bindings.write().push(Binding::Presence {
            event: event.to_string(),
            callback: Arc::new(callback),
        });
        self
    }

    pub fn on_system<F>(&self, callback: F) -> &Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner
            .bindings
            .write()
            .push(Binding::System(Arc::new(callback)));
        self
    }

    /// Join the topic, connecting the socket first if needed.
    ///
    /// Refusals and timeouts are reported through [`SubscribeStatus`];
    /// `Err` is reserved for failures to reach the service at all.
    pub async fn subscribe(&self) -> Result<SubscribeStatus, ClientError> {
        if self.is_joined() {
            return Ok(SubscribeStatus::Subscribed);
        }

        self.socket.connect().await?;
        let shared = &self.socket.shared;

        let join_ref = shared.make_ref();
        *self.inner.join_ref.write() = Some(join_ref.clone());
        self.inner.set_state(ChannelState::Joining);

        let payload = serde_json::to_value(JoinPayload {
            config: self.inner.config.clone(),
            access_token: shared.access_token(),
        })?;
        let msg = PhoenixMessage::new(&self.inner.topic, events::JOIN, payload)
            .with_ref(join_ref.clone())
            .with_join_ref(Some(join_ref.clone()));

        let rx = match shared.push_with_reply(&msg) {
            Ok(rx) => rx,
            Err(e) => {
                self.inner.set_state(ChannelState::Errored);
                return Err(e);
            }
        };

        let status = match shared.await_reply(&join_ref, rx).await {
            PushOutcome::Reply(reply) => match reply.status {
                ReplyStatus::Ok => SubscribeStatus::Subscribed,
                ReplyStatus::Error => SubscribeStatus::ChannelError(reply.reason()),
                ReplyStatus::Timeout => SubscribeStatus::TimedOut,
            },
            PushOutcome::TimedOut => {
                self.inner.set_state(ChannelState::Errored);
                SubscribeStatus::TimedOut
            }
            PushOutcome::Closed => SubscribeStatus::Closed,
        };

        tracing::info!("Subscribe to {}: {:?}", self.inner.topic, status);
        Ok(status)
    }

    /// Broadcast over the socket when joined, otherwise over REST.
    ///
    /// With `ack` enabled the call waits for the service to confirm.
    pub async fn send(&self, message: BroadcastMessage) -> Result<SendStatus, ClientError> {
        if !self.is_joined() {
            return match self.http_send(&message.event, message.payload).await {
                Ok(()) => Ok(SendStatus::Ok),
                Err(ClientError::Connection(ConnectionError::ServerRejected(reason))) => {
                    Ok(SendStatus::Error(reason))
                }
                Err(e) => Err(e),
            };
        }

        let payload = serde_json::to_value(&message)?;
        self.push(events::BROADCAST, payload, self.inner.config.broadcast.ack)
            .await
    }

    /// Publish through the REST broadcast endpoint regardless of join state.
    pub async fn http_send(&self, event: &str, payload: Value) -> Result<(), ClientError> {
        let token = self.socket.access_token();
        self.socket
            .shared
            .broadcast_endpoint
            .send(
                token.as_deref(),
                vec![HttpBroadcastMessage {
                    topic: self.inner.name.clone(),
                    event: event.to_string(),
                    payload,
                    private: self.inner.config.private,
                }],
            )
            .await
    }

    /// Announce this client's presence with `payload`.
    pub async fn track(&self, payload: Value) -> Result<SendStatus, ClientError> {
        self.ensure_joined()?;
        let payload = serde_json::to_value(PresenceMessage::track(payload))?;
        self.push(events::PRESENCE, payload, true).await
    }

    pub async fn untrack(&self) -> Result<SendStatus, ClientError> {
        self.ensure_joined()?;
        let payload = serde_json::to_value(PresenceMessage::untrack())?;
        self.push(events::PRESENCE, payload, true).await
    }

    /// Current presence state as last synced from the service.
    pub fn presence_state(&self) -> PresenceState {
        self.inner.presence.read().clone()
    }

    /// Leave the topic. The channel can be subscribed again afterwards.
    pub async fn unsubscribe(&self) -> Result<SendStatus, ClientError> {
        if !matches!(
            self.state(),
            ChannelState::Joined | ChannelState::Joining
        ) {
            self.inner.set_state(ChannelState::Closed);
            return Ok(SendStatus::Ok);
        }

        self.inner.set_state(ChannelState::Leaving);
        let shared = &self.socket.shared;
        let leave_ref = shared.make_ref();
        let msg = PhoenixMessage::new(&self.inner.topic, events::LEAVE, serde_json::json!({}))
            .with_ref(leave_ref.clone())
            .with_join_ref(self.inner.join_ref());

        let status = match shared.push_with_reply(&msg) {
            Ok(rx) => match shared.await_reply(&leave_ref, rx).await {
                PushOutcome::Reply(_) | PushOutcome::Closed => SendStatus::Ok,
                PushOutcome::TimedOut => SendStatus::TimedOut,
            },
            Err(ClientError::Send(SendError::NotConnected)) => SendStatus::Ok,
            Err(e) => return Err(e),
        };

        self.inner.set_state(ChannelState::Closed);
        self.inner.join_ref.write().take();
        self.inner.presence.write().clear();
        tracing::info!("Left {}", self.inner.topic);
        Ok(status)
    }

    fn ensure_joined(&self) -> Result<(), ClientError> {
        if self.is_joined() {
            Ok(())
        } else {
            Err(ClientError::Send(SendError::NotConnected))
        }
    }

    async fn push(
        &self,
        event: &str,
        payload: Value,
        wait_for_reply: bool,
    ) -> Result<SendStatus, ClientError> {
        let shared = &self.socket.shared;
        let msg_ref = shared.make_ref();
        let msg = PhoenixMessage::new(&self.inner.topic, event, payload)
            .with_ref(msg_ref.clone())
            .with_join_ref(self.inner.join_ref());

        if !wait_for_reply {
            shared.push(&msg)?;
            return Ok(SendStatus::Ok);
        }

        let rx = shared.push_with_reply(&msg)?;
        Ok(match shared.await_reply(&msg_ref, rx).await {
            PushOutcome::Reply(reply) => match reply.status {
                ReplyStatus::Ok => SendStatus::Ok,
                ReplyStatus::Error => SendStatus::Error(reply.reason()),
                ReplyStatus::Timeout => SendStatus::TimedOut,
            },
            PushOutcome::TimedOut => SendStatus::TimedOut,
            PushOutcome::Closed => SendStatus::Error("socket closed".to_string()),
        })
    }
}
