//! The realtime socket: one WebSocket multiplexing every channel.

use super::channel::{ChannelInner, RealtimeChannel};
use crate::api::{BroadcastEndpoint, ServiceUrls};
use crate::config::RealtimeOptions;
use crate::error::{ConnectionError, ConnectionState, DisconnectReason, SendError};
use crate::transport::websocket::WebSocketStream;
use crate::ClientError;
use dashmap::DashMap;
use parking_lot::RwLock;
use realtime_kit_protocol::{
    events, ChannelConfig, PhoenixMessage, ReplyPayload, Serializer, PHOENIX_TOPIC,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Normal closure code sent on explicit disconnect.
pub const WS_CLOSE_NORMAL: u16 = 1000;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) enum SocketCommand {
    Frame(String),
    Close { code: u16, reason: String },
}

/// How a push that expects a reply ended.
pub(crate) enum PushOutcome {
    Reply(ReplyPayload),
    TimedOut,
    Closed,
}

pub(crate) struct SocketShared {
    endpoint: String,
    api_key: String,
    options: RealtimeOptions,
    serializer: Serializer,
    pub(crate) broadcast_endpoint: BroadcastEndpoint,
    access_token: RwLock<Option<String>>,
    next_ref: AtomicU64,
    next_channel_id: AtomicU64,
    /// Bumped on every connect and explicit disconnect so a finished socket
    /// task never tears down its successor.
    generation: AtomicU64,
    state: RwLock<ConnectionState>,
    outbound: RwLock<Option<mpsc::UnboundedSender<SocketCommand>>>,
    pending: DashMap<String, oneshot::Sender<ReplyPayload>>,
    pub(crate) channels: DashMap<u64, Arc<ChannelInner>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl SocketShared {
    pub(crate) fn make_ref(&self) -> String {
        (self.next_ref.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    pub(crate) fn access_token(&self) -> Option<String> {
        self.access_token.read().clone()
    }

    /// Queue a frame for the socket task.
    pub(crate) fn push(&self, msg: &PhoenixMessage) -> Result<(), ClientError> {
        let text = self.serializer.encode(msg);
        tracing::trace!("-> {} {} ref={:?}", msg.topic, msg.event, msg.msg_ref);
        let outbound = self.outbound.read();
        let Some(tx) = outbound.as_ref() else {
            return Err(ClientError::Send(SendError::NotConnected));
        };
        tx.send(SocketCommand::Frame(text))
            .map_err(|_| ClientError::Send(SendError::ConnectionClosed))
    }

    /// Queue a frame whose reply the caller will await. `msg.msg_ref` must be set.
    pub(crate) fn push_with_reply(
        &self,
        msg: &PhoenixMessage,
    ) -> Result<oneshot::Receiver<ReplyPayload>, ClientError> {
        let msg_ref = msg.msg_ref.clone().unwrap_or_else(|| self.make_ref());
        let (tx, rx) = oneshot::channel();
        self.pending.insert(msg_ref.clone(), tx);

        let msg = msg.clone().with_ref(msg_ref.clone());
        if let Err(e) = self.push(&msg) {
            self.pending.remove(&msg_ref);
            return Err(e);
        }
        Ok(rx)
    }

    /// Wait for a reply, bounded by the configured push timeout.
    pub(crate) async fn await_reply(
        &self,
        msg_ref: &str,
        rx: oneshot::Receiver<ReplyPayload>,
    ) -> PushOutcome {
        match tokio::time::timeout(self.options.timeout(), rx).await {
            Ok(Ok(reply)) => PushOutcome::Reply(reply),
            Ok(Err(_)) => PushOutcome::Closed,
            Err(_) => {
                self.pending.remove(msg_ref);
                tracing::debug!("Push {} timed out after {:?}", msg_ref, self.options.timeout());
                PushOutcome::TimedOut
            }
        }
    }

    fn channels_for_topic(&self, topic: &str) -> Vec<Arc<ChannelInner>> {
        let mut found: Vec<Arc<ChannelInner>> = self
            .channels
            .iter()
            .filter(|entry| entry.value().topic == topic)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        found.sort_by_key(|c| c.id);
        found
    }

    /// Route one incoming text frame.
    fn handle_frame(&self, text: &str, pending_heartbeat: &mut Option<String>) {
        let msg = match self.serializer.decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Dropping undecodable frame: {}", e);
                return;
            }
        };
        tracing::trace!("<- {} {} ref={:?}", msg.topic, msg.event, msg.msg_ref);

        if msg.event == events::REPLY {
            if msg.topic == PHOENIX_TOPIC {
                if msg.msg_ref.is_some() && pending_heartbeat.as_deref() == msg.msg_ref.as_deref() {
                    *pending_heartbeat = None;
                }
                return;
            }

            let reply: ReplyPayload = match serde_json::from_value(msg.payload.clone()) {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::warn!("Malformed reply on {}: {}", msg.topic, e);
                    return;
                }
            };

            // Join replies settle channel state before anything else on
            // the topic is dispatched.
            if let Some(msg_ref) = &msg.msg_ref {
                for channel in self.channels_for_topic(&msg.topic) {
                    if channel.join_ref().as_deref() == Some(msg_ref.as_str()) {
                        channel.on_join_reply(&reply);
                    }
                }
                if let Some((_, tx)) = self.pending.remove(msg_ref) {
                    let _ = tx.send(reply);
                }
            }
            return;
        }

        for channel in self.channels_for_topic(&msg.topic) {
            channel.dispatch(&msg);
        }
    }

    /// Reset connection state after the socket went away.
    fn teardown(&self, state: ConnectionState) {
        *self.outbound.write() = None;
        let lost = state.is_lost();
        *self.state.write() = state;
        self.pending.clear();
        for entry in self.channels.iter() {
            entry.value().on_socket_closed(lost);
        }
    }
}

/// Client for the realtime service. Cheap to clone; clones share the socket.
#[derive(Clone)]
pub struct RealtimeClient {
    pub(crate) shared: Arc<SocketShared>,
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut topics: Vec<String> = self
            .shared
            .channels
            .iter()
            .map(|entry| entry.value().topic.clone())
            .collect();
        topics.sort();
        f.debug_struct("RealtimeClient")
            .field("endpoint", &self.shared.endpoint)
            .field("vsn", &self.shared.serializer.vsn())
            .field("options", &self.shared.options)
            .field("state", &*self.shared.state.read())
            .field("channels", &topics)
            .finish()
    }
}

impl RealtimeClient {
    pub fn new(
        urls: &ServiceUrls,
        api_key: &str,
        options: RealtimeOptions,
    ) -> Result<Self, ClientError> {
        let serializer = options.serializer()?;
        Ok(Self {
            shared: Arc::new(SocketShared {
                endpoint: urls.realtime_socket(),
                api_key: api_key.to_string(),
                options,
                serializer,
                broadcast_endpoint: BroadcastEndpoint::new(urls, api_key),
                access_token: RwLock::new(None),
                next_ref: AtomicU64::new(0),
                next_channel_id: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                state: RwLock::new(ConnectionState::Disconnected),
                outbound: RwLock::new(None),
                pending: DashMap::new(),
                channels: DashMap::new(),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn options(&self) -> &RealtimeOptions {
        &self.shared.options
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.read().is_connected()
    }

    /// Open the socket if it is not already open.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let _guard = self.shared.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let url = url::Url::parse_with_params(
            &self.shared.endpoint,
            &[
                ("apikey", self.shared.api_key.as_str()),
                ("vsn", self.shared.serializer.vsn()),
            ],
        )
        .map_err(|e| ClientError::Connection(ConnectionError::InvalidUrl(e.to_string())))?;

        *self.shared.state.write() = ConnectionState::Connecting;
        let connecting = tokio::time::timeout(CONNECT_TIMEOUT, WebSocketStream::connect(url.as_str()));
        let stream = match connecting
            .await
            .unwrap_or(Err(ClientError::Connection(ConnectionError::Timeout)))
        {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Realtime connect to {} failed: {}", self.shared.endpoint, e);
                *self.shared.state.write() =
                    ConnectionState::Lost(DisconnectReason::NetworkError(e.to_string()));
                return Err(e);
            }
        };

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.outbound.write() = Some(tx);
        *self.shared.state.write() = ConnectionState::Connected;

        tracing::info!("Realtime socket connected to {}", self.shared.endpoint);
        tokio::spawn(run_socket(Arc::clone(&self.shared), stream, rx, generation));
        Ok(())
    }

    /// Close the socket. Channels move to `Closed`.
    pub fn disconnect(&self) {
        self.disconnect_with(WS_CLOSE_NORMAL, "");
    }

    pub fn disconnect_with(&self, code: u16, reason: &str) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.shared.outbound.read().as_ref() {
            let _ = tx.send(SocketCommand::Close {
                code,
                reason: reason.to_string(),
            });
        }
        self.shared.teardown(ConnectionState::Disconnected);
        tracing::info!("Realtime socket disconnected ({} {})", code, reason);
    }

    /// Create a channel. Nothing is sent until [`RealtimeChannel::subscribe`].
    pub fn channel(&self, name: &str, config: ChannelConfig) -> RealtimeChannel {
        let id = self.shared.next_channel_id.fetch_add(1, Ordering::Relaxed) + 1;
        let inner = Arc::new(ChannelInner::new(id, name, config));
        self.shared.channels.insert(id, Arc::clone(&inner));
        RealtimeChannel::new(inner, self.clone())
    }

    /// All channels created through this client, oldest first.
    pub fn channels(&self) -> Vec<RealtimeChannel> {
        let mut inners: Vec<Arc<ChannelInner>> = self
            .shared
            .channels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        inners.sort_by_key(|c| c.id);
        inners
            .into_iter()
            .map(|inner| RealtimeChannel::new(inner, self.clone()))
            .collect()
    }

    /// Leave and forget a channel. Disconnects once no channels remain.
    pub async fn remove_channel(&self, channel: &RealtimeChannel) -> Result<(), ClientError> {
        channel.unsubscribe().await?;
        self.shared.channels.remove(&channel.id());
        if self.shared.channels.is_empty() && self.is_connected() {
            self.disconnect();
        }
        Ok(())
    }

    /// Leave every channel and disconnect.
    pub async fn remove_all_channels(&self) -> Result<(), ClientError> {
        for channel in self.channels() {
            channel.unsubscribe().await?;
            self.shared.channels.remove(&channel.id());
        }
        if self.is_connected() {
            self.disconnect();
        }
        Ok(())
    }

    /// Set the token sent with joins and push it to every joined channel.
    pub fn set_auth(&self, token: Option<String>) {
        *self.shared.access_token.write() = token.clone();
        let Some(token) = token else {
            return;
        };
        for channel in self.channels() {
            if channel.is_joined() {
                let msg = PhoenixMessage::new(
                    channel.topic(),
                    events::ACCESS_TOKEN,
                    serde_json::json!({ "access_token": token }),
                )
                .with_ref(self.shared.make_ref())
                .with_join_ref(channel.join_ref());
                if let Err(e) = self.shared.push(&msg) {
                    tracing::warn!("Failed to push access token to {}: {}", channel.topic(), e);
                }
            }
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.shared.access_token()
    }
}

/// Socket task: owns the stream, sends heartbeats and routes frames.
async fn run_socket(
    shared: Arc<SocketShared>,
    stream: WebSocketStream,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
    generation: u64,
) {
    let stream = Arc::new(stream);
    let (read_tx, mut read_rx) = mpsc::unbounded_channel::<Result<String, ClientError>>();

    let reader = {
        let stream = Arc::clone(&stream);
        tokio::spawn(async move {
            loop {
                match stream.read_text().await {
                    Ok(text) => {
                        if read_tx.send(Ok(text)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = read_tx.send(Err(e));
                        break;
                    }
                }
            }
        })
    };

    let mut heartbeat = tokio::time::interval(shared.options.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await;
    let mut pending_heartbeat: Option<String> = None;

    let reason = loop {
        tokio::select! {
            frame = read_rx.recv() => match frame {
                Some(Ok(text)) => shared.handle_frame(&text, &mut pending_heartbeat),
                Some(Err(ClientError::Disconnected(reason))) => break reason,
                Some(Err(e)) => break DisconnectReason::NetworkError(e.to_string()),
                None => break DisconnectReason::ServerClosed,
            },
            command = commands.recv() => match command {
                Some(SocketCommand::Frame(text)) => {
                    if let Err(e) = stream.write_text(text).await {
                        break DisconnectReason::NetworkError(e.to_string());
                    }
                }
                Some(SocketCommand::Close { code, reason }) => {
                    let _ = stream.close(code, &reason).await;
                    break DisconnectReason::ClientClosed;
                }
                None => {
                    let _ = stream.close(WS_CLOSE_NORMAL, "").await;
                    break DisconnectReason::ClientClosed;
                }
            },
            _ = heartbeat.tick() => {
                if let Some(missed) = pending_heartbeat.take() {
                    tracing::warn!("Heartbeat {} not acknowledged, closing socket", missed);
                    let _ = stream.close(WS_CLOSE_NORMAL, "heartbeat timeout").await;
                    break DisconnectReason::HeartbeatTimeout;
                }
                let heartbeat_ref = shared.make_ref();
                let msg = PhoenixMessage::new(PHOENIX_TOPIC, events::HEARTBEAT, serde_json::json!({}))
                    .with_ref(heartbeat_ref.clone());
                if let Err(e) = stream.write_text(shared.serializer.encode(&msg)).await {
                    break DisconnectReason::NetworkError(e.to_string());
                }
                tracing::trace!("Heartbeat {} sent", heartbeat_ref);
                pending_heartbeat = Some(heartbeat_ref);
            }
        }
    };

    reader.abort();

    if shared.generation.load(Ordering::SeqCst) == generation {
        tracing::info!("Realtime socket lost: {}", reason);
        shared.teardown(ConnectionState::Lost(reason));
    } else {
        tracing::debug!("Realtime socket task {} finished: {}", generation, reason);
    }
}
