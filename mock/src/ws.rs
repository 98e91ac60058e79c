//! Realtime WebSocket endpoint.
//!
//! Each socket is one `RealtimeSession` actor speaking the Phoenix channel
//! protocol. A socket multiplexes any number of topics.

use crate::topics::{Outbound, SessionId, Subscriber, TopicKey, TopicRegistry};
use crate::tokens::{Claims, TokenManager};
use crate::PrivateTopicPolicy;
use actix::{Actor, ActorContext, AsyncContext, Handler, StreamHandler};
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use realtime_kit_protocol::{
    events, BroadcastMessage, JoinPayload, PhoenixMessage, PresenceMessage, Serializer,
    PERMISSION_DENIED_REASON, PHOENIX_TOPIC,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared state for WebSocket handlers.
pub struct WsState {
    pub registry: Arc<TopicRegistry>,
    pub tokens: Arc<TokenManager>,
    pub policy: PrivateTopicPolicy,
}

struct Joined {
    key: TopicKey,
    join_ref: Option<String>,
    presence_key: String,
    ack: bool,
}

/// One client socket.
pub struct RealtimeSession {
    id: SessionId,
    serializer: Serializer,
    registry: Arc<TopicRegistry>,
    tokens: Arc<TokenManager>,
    policy: PrivateTopicPolicy,
    /// Claims of the socket's `apikey`, used when a join carries no token.
    api_claims: Claims,
    /// Joined channels by wire topic.
    joined: HashMap<String, Joined>,
    last_seen: Instant,
}

impl RealtimeSession {
    pub fn new(
        state: &WsState,
        serializer: Serializer,
        api_claims: Claims,
    ) -> Self {
        Self {
            id: state.registry.next_session_id(),
            serializer,
            registry: Arc::clone(&state.registry),
            tokens: Arc::clone(&state.tokens),
            policy: state.policy,
            api_claims,
            joined: HashMap::new(),
            last_seen: Instant::now(),
        }
    }

    fn idle_check(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(IDLE_CHECK_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_seen) > CLIENT_TIMEOUT {
                tracing::debug!("Session {} idle, closing", act.id);
                ctx.stop();
            }
        });
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, msg: &PhoenixMessage) {
        ctx.text(self.serializer.encode(msg));
    }

    fn reply(
        &self,
        ctx: &mut ws::WebsocketContext<Self>,
        msg: &PhoenixMessage,
        status: &str,
        response: Value,
    ) {
        self.send(ctx, &msg.reply(status, response));
    }

    fn handle_frame(&mut self, msg: PhoenixMessage, ctx: &mut ws::WebsocketContext<Self>) {
        tracing::trace!(
            "Session {} <- {} {} ref={:?}",
            self.id,
            msg.topic,
            msg.event,
            msg.msg_ref
        );

        if msg.topic == PHOENIX_TOPIC {
            if msg.event == events::HEARTBEAT {
                self.reply(ctx, &msg, "ok", json!({}));
            }
            return;
        }

        match msg.event.as_str() {
            events::JOIN => self.handle_join(msg, ctx),
            events::LEAVE => self.handle_leave(msg, ctx),
            events::ACCESS_TOKEN => self.handle_access_token(msg, ctx),
            events::BROADCAST => self.handle_broadcast(msg, ctx),
            events::PRESENCE => self.handle_presence(msg, ctx),
            other => {
                tracing::debug!("Session {}: unsupported event {}", self.id, other);
                self.reply(ctx, &msg, "error", json!({ "reason": "unsupported event" }));
            }
        }
    }

    fn handle_join(&mut self, msg: PhoenixMessage, ctx: &mut ws::WebsocketContext<Self>) {
        let payload: JoinPayload = match serde_json::from_value(msg.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!("Session {}: malformed join: {}", self.id, e);
                self.reply(ctx, &msg, "error", json!({ "reason": "malformed join payload" }));
                return;
            }
        };

        let claims = match &payload.access_token {
            Some(token) => match self.tokens.validate(token) {
                Ok(claims) => claims,
                Err(e) => {
                    tracing::debug!("Session {}: join with bad token: {}", self.id, e);
                    self.reply(ctx, &msg, "error", json!({ "reason": "Invalid token" }));
                    return;
                }
            },
            None => self.api_claims.clone(),
        };

        let config = payload.config;
        if config.private && !self.policy.allows(&claims) {
            tracing::info!(
                "Session {}: denied private join of {} as {}",
                self.id,
                msg.topic,
                claims.role
            );
            self.reply(ctx, &msg, "error", json!({ "reason": PERMISSION_DENIED_REASON }));
            return;
        }

        // A second join on the same topic replaces the first.
        if let Some(previous) = self.joined.remove(&msg.topic) {
            self.registry.leave(&previous.key, self.id);
        }

        let key = TopicKey::new(msg.topic.clone(), config.private);
        let presence_key = if config.presence.key.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            config.presence.key.clone()
        };

        self.registry.join(
            &key,
            self.id,
            Subscriber {
                join_ref: msg.join_ref.clone(),
                self_broadcast: config.broadcast.self_broadcast,
                recipient: ctx.address().recipient(),
            },
        );
        self.joined.insert(
            msg.topic.clone(),
            Joined {
                key: key.clone(),
                join_ref: msg.join_ref.clone(),
                presence_key,
                ack: config.broadcast.ack,
            },
        );

        tracing::info!("Session {} joined {} (private: {})", self.id, msg.topic, config.private);
        self.reply(ctx, &msg, "ok", json!({ "postgres_changes": [] }));

        let snapshot = self.registry.presence_state(&key);
        match serde_json::to_value(&snapshot) {
            Ok(state) => {
                let frame = PhoenixMessage::new(&msg.topic, events::PRESENCE_STATE, state)
                    .with_join_ref(msg.join_ref.clone());
                self.send(ctx, &frame);
            }
            Err(e) => tracing::warn!("Unserializable presence state: {}", e),
        }
    }

    fn handle_leave(&mut self, msg: PhoenixMessage, ctx: &mut ws::WebsocketContext<Self>) {
        if let Some(joined) = self.joined.remove(&msg.topic) {
            self.registry.leave(&joined.key, self.id);
            tracing::info!("Session {} left {}", self.id, msg.topic);
        }
        self.reply(ctx, &msg, "ok", json!({}));
        let close = PhoenixMessage::new(&msg.topic, events::CLOSE, json!({}))
            .with_join_ref(msg.join_ref.clone());
        self.send(ctx, &close);
    }

    fn handle_access_token(&mut self, msg: PhoenixMessage, ctx: &mut ws::WebsocketContext<Self>) {
        let token = msg.payload.get("access_token").and_then(Value::as_str);
        let valid = token.map(|t| self.tokens.validate(t)).transpose();
        let private = self.joined.get(&msg.topic).is_some_and(|j| j.key.private);

        match valid {
            Ok(Some(claims)) if private && !self.policy.allows(&claims) => {
                tracing::info!(
                    "Session {}: token for {} no longer grants the private topic ({})",
                    self.id,
                    msg.topic,
                    claims.role
                );
                self.evict(&msg.topic, PERMISSION_DENIED_REASON, ctx);
            }
            Ok(Some(claims)) => {
                tracing::debug!("Session {}: token refreshed for {} ({})", self.id, msg.topic, claims.role);
            }
            Ok(None) | Err(_) => {
                tracing::info!("Session {}: rejected access token on {}", self.id, msg.topic);
                self.evict(&msg.topic, "Invalid token", ctx);
            }
        }
    }

    /// Drop a joined topic, telling the client why before closing it.
    fn evict(&mut self, topic: &str, reason: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(joined) = self.joined.remove(topic) else {
            return;
        };
        self.registry.leave(&joined.key, self.id);
        let system = PhoenixMessage::new(
            topic,
            events::SYSTEM,
            json!({
                "extension": "system",
                "status": "error",
                "message": reason,
                "channel": realtime_kit_protocol::strip_realtime_prefix(topic),
            }),
        )
        .with_join_ref(joined.join_ref.clone());
        self.send(ctx, &system);
        let close = PhoenixMessage::new(topic, events::CLOSE, json!({})).with_join_ref(joined.join_ref);
        self.send(ctx, &close);
    }

    fn handle_broadcast(&mut self, msg: PhoenixMessage, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(joined) = self.joined.get(&msg.topic) else {
            self.reply(ctx, &msg, "error", json!({ "reason": "unmatched topic" }));
            return;
        };

        let message: BroadcastMessage = match serde_json::from_value(msg.payload.clone()) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Session {}: malformed broadcast: {}", self.id, e);
                self.reply(ctx, &msg, "error", json!({ "reason": "malformed broadcast" }));
                return;
            }
        };

        let ack = joined.ack;
        self.registry.broadcast(&joined.key, Some(self.id), &message);
        if ack {
            self.reply(ctx, &msg, "ok", json!({}));
        }
    }

    fn handle_presence(&mut self, msg: PhoenixMessage, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(joined) = self.joined.get(&msg.topic) else {
            self.reply(ctx, &msg, "error", json!({ "reason": "unmatched topic" }));
            return;
        };

        let presence: PresenceMessage = match serde_json::from_value(msg.payload.clone()) {
            Ok(presence) => presence,
            Err(e) => {
                tracing::debug!("Session {}: malformed presence: {}", self.id, e);
                self.reply(ctx, &msg, "error", json!({ "reason": "malformed presence" }));
                return;
            }
        };

        match presence.event.as_str() {
            "track" => {
                let payload = presence.payload.unwrap_or(Value::Null);
                self.registry
                    .track(&joined.key, self.id, &joined.presence_key, payload);
                self.reply(ctx, &msg, "ok", json!({}));
            }
            "untrack" => {
                self.registry.untrack(&joined.key, self.id);
                self.reply(ctx, &msg, "ok", json!({}));
            }
            other => {
                self.reply(
                    ctx,
                    &msg,
                    "error",
                    json!({ "reason": format!("unknown presence event {}", other) }),
                );
            }
        }
    }
}

impl Actor for RealtimeSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::debug!("Session {} opened ({})", self.id, self.serializer.vsn());
        self.idle_check(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.joined.clear();
        self.registry.drop_session(self.id);
        tracing::debug!("Session {} closed", self.id);
    }
}

impl Handler<Outbound> for RealtimeSession {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        self.send(ctx, &msg.0);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RealtimeSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_seen = Instant::now();
        match msg {
            Ok(ws::Message::Ping(msg)) => ctx.pong(&msg),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Text(text)) => match self.serializer.decode(&text) {
                Ok(frame) => self.handle_frame(frame, ctx),
                Err(e) => tracing::debug!("Session {}: undecodable frame: {}", self.id, e),
            },
            Ok(ws::Message::Binary(_)) => {
                tracing::debug!("Session {}: ignoring binary frame", self.id);
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::debug!("WebSocket close: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Session {}: protocol error: {}", self.id, e);
                ctx.stop();
            }
        }
    }
}

#[derive(serde::Deserialize)]
pub struct SocketQuery {
    pub apikey: String,
    #[serde(default)]
    pub vsn: Option<String>,
}

/// GET /realtime/v1/websocket - upgrade to a realtime socket.
pub async fn realtime_ws(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<SocketQuery>,
    state: web::Data<WsState>,
) -> Result<HttpResponse, actix_web::Error> {
    let api_claims = state
        .tokens
        .validate(&query.apikey)
        .map_err(|_| actix_web::error::ErrorUnauthorized("Invalid apikey"))?;

    let serializer = match &query.vsn {
        Some(vsn) => Serializer::from_vsn(vsn)
            .map_err(|e| actix_web::error::ErrorBadRequest(e.to_string()))?,
        None => Serializer::V1,
    };

    tracing::info!("Realtime socket upgrade (vsn {})", serializer.vsn());
    ws::start(RealtimeSession::new(&state, serializer, api_claims), &req, stream)
}
