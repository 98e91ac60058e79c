//! Topic registry: who is joined where, broadcast fan-out and presence.
//!
//! Sessions register an actix `Recipient` per joined topic; fan-out is a
//! `do_send` to each, so nothing here blocks on a slow socket.

use actix::{Message, Recipient};
use dashmap::DashMap;
use realtime_kit_protocol::{
    events, BroadcastMessage, PhoenixMessage, PresenceDiff, PresenceEntry, PresenceMeta,
    PresenceState,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub type SessionId = u64;

/// A frame queued for one socket.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Outbound(pub PhoenixMessage);

/// Public and private channels with the same name are distinct topics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicKey {
    /// Wire topic, `realtime:<name>`.
    pub topic: String,
    pub private: bool,
}

impl TopicKey {
    pub fn new(topic: impl Into<String>, private: bool) -> Self {
        Self {
            topic: topic.into(),
            private,
        }
    }
}

#[derive(Clone)]
pub struct Subscriber {
    pub join_ref: Option<String>,
    pub self_broadcast: bool,
    pub recipient: Recipient<Outbound>,
}

struct Tracked {
    key: String,
    meta: PresenceMeta,
}

#[derive(Default)]
struct Topic {
    subscribers: HashMap<SessionId, Subscriber>,
    presences: HashMap<SessionId, Tracked>,
}

#[derive(Default)]
pub struct TopicRegistry {
    topics: DashMap<TopicKey, Topic>,
    next_session: AtomicU64,
    next_presence_ref: AtomicU64,
}

fn frame(topic: &str, event: &str, payload: Value, join_ref: Option<String>) -> PhoenixMessage {
    PhoenixMessage::new(topic, event, payload).with_join_ref(join_ref)
}

fn entry(meta: PresenceMeta) -> PresenceEntry {
    PresenceEntry { metas: vec![meta] }
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_session_id(&self) -> SessionId {
        self.next_session.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Add or replace `session`'s subscription to `key`.
    pub fn join(&self, key: &TopicKey, session: SessionId, subscriber: Subscriber) {
        self.topics
            .entry(key.clone())
            .or_default()
            .subscribers
            .insert(session, subscriber);
        tracing::debug!("Session {} joined {:?}", session, key);
    }

    /// Remove `session` from `key`, dropping its presence. Returns whether it was joined.
    pub fn leave(&self, key: &TopicKey, session: SessionId) -> bool {
        self.untrack(key, session);

        let mut removed = false;
        let mut empty = false;
        if let Some(mut topic) = self.topics.get_mut(key) {
            removed = topic.subscribers.remove(&session).is_some();
            empty = topic.subscribers.is_empty();
        }
        if empty {
            self.topics.remove_if(key, |_, topic| topic.subscribers.is_empty());
        }
        if removed {
            tracing::debug!("Session {} left {:?}", session, key);
        }
        removed
    }

    /// Remove `session` from every topic, e.g. after its socket closed.
    pub fn drop_session(&self, session: SessionId) {
        let keys: Vec<TopicKey> = self
            .topics
            .iter()
            .filter(|entry| entry.value().subscribers.contains_key(&session))
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            self.leave(&key, session);
        }
    }

    pub fn subscriber_count(&self, key: &TopicKey) -> usize {
        self.topics
            .get(key)
            .map(|topic| topic.subscribers.len())
            .unwrap_or(0)
    }

    /// Deliver a broadcast to every subscriber of `key`.
    ///
    /// `from` is skipped unless it joined with `self` broadcast enabled.
    /// Returns the number of sockets the message was queued for.
    pub fn broadcast(
        &self,
        key: &TopicKey,
        from: Option<SessionId>,
        message: &BroadcastMessage,
    ) -> usize {
        let targets: Vec<Subscriber> = match self.topics.get(key) {
            Some(topic) => topic
                .subscribers
                .iter()
                .filter(|(id, sub)| Some(**id) != from || sub.self_broadcast)
                .map(|(_, sub)| sub.clone())
                .collect(),
            None => Vec::new(),
        };

        let payload = match serde_json::to_value(message) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Unserializable broadcast on {}: {}", key.topic, e);
                return 0;
            }
        };

        for sub in &targets {
            sub.recipient.do_send(Outbound(frame(
                &key.topic,
                events::BROADCAST,
                payload.clone(),
                sub.join_ref.clone(),
            )));
        }
        tracing::trace!("Broadcast {} on {} to {} socket(s)", message.event, key.topic, targets.len());
        targets.len()
    }

    pub fn presence_state(&self, key: &TopicKey) -> PresenceState {
        let mut state = PresenceState::new();
        if let Some(topic) = self.topics.get(key) {
            for tracked in topic.presences.values() {
                state
                    .entry(tracked.key.clone())
                    .or_default()
                    .metas
                    .push(tracked.meta.clone());
            }
        }
        state
    }

    /// Track or update `session`'s presence under `presence_key`.
    pub fn track(&self, key: &TopicKey, session: SessionId, presence_key: &str, payload: Value) {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("payload".to_string(), other);
                map
            }
        };
        let phx_ref = (self.next_presence_ref.fetch_add(1, Ordering::Relaxed) + 1).to_string();

        let mut diff = PresenceDiff::default();
        {
            let Some(mut topic) = self.topics.get_mut(key) else {
                return;
            };
            let previous = topic.presences.remove(&session);
            let meta = PresenceMeta {
                phx_ref,
                phx_ref_prev: previous.as_ref().map(|p| p.meta.phx_ref.clone()),
                payload,
            };
            if let Some(previous) = previous {
                diff.leaves.insert(previous.key.clone(), entry(previous.meta));
            }
            diff.joins.insert(presence_key.to_string(), entry(meta.clone()));
            topic.presences.insert(
                session,
                Tracked {
                    key: presence_key.to_string(),
                    meta,
                },
            );
        }
        self.fan_out_diff(key, &diff);
    }

    pub fn untrack(&self, key: &TopicKey, session: SessionId) {
        let removed = self
            .topics
            .get_mut(key)
            .and_then(|mut topic| topic.presences.remove(&session));
        if let Some(tracked) = removed {
            let mut diff = PresenceDiff::default();
            diff.leaves.insert(tracked.key, entry(tracked.meta));
            self.fan_out_diff(key, &diff);
        }
    }

    fn fan_out_diff(&self, key: &TopicKey, diff: &PresenceDiff) {
        let payload = match serde_json::to_value(diff) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Unserializable presence diff on {}: {}", key.topic, e);
                return;
            }
        };
        let targets: Vec<Subscriber> = self
            .topics
            .get(key)
            .map(|topic| topic.subscribers.values().cloned().collect())
            .unwrap_or_default();
        for sub in targets {
            sub.recipient.do_send(Outbound(frame(
                &key.topic,
                events::PRESENCE_DIFF,
                payload.clone(),
                sub.join_ref,
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix::{Actor, Addr, Context, Handler};
    use serde_json::json;

    #[derive(Default)]
    struct Collector {
        frames: Vec<PhoenixMessage>,
    }

    impl Actor for Collector {
        type Context = Context<Self>;
    }

    impl Handler<Outbound> for Collector {
        type Result = ();

        fn handle(&mut self, msg: Outbound, _ctx: &mut Self::Context) {
            self.frames.push(msg.0);
        }
    }

    #[derive(Message)]
    #[rtype(result = "Vec<PhoenixMessage>")]
    struct Drain;

    impl Handler<Drain> for Collector {
        type Result = Vec<PhoenixMessage>;

        fn handle(&mut self, _msg: Drain, _ctx: &mut Self::Context) -> Self::Result {
            std::mem::take(&mut self.frames)
        }
    }

    fn subscriber(addr: &Addr<Collector>, join_ref: &str, self_broadcast: bool) -> Subscriber {
        Subscriber {
            join_ref: Some(join_ref.to_string()),
            self_broadcast,
            recipient: addr.clone().recipient(),
        }
    }

    #[actix::test]
    async fn broadcast_skips_sender_unless_self_enabled() {
        let registry = TopicRegistry::new();
        let key = TopicKey::new("realtime:room", false);
        let a = Collector::default().start();
        let b = Collector::default().start();
        registry.join(&key, 1, subscriber(&a, "1", false));
        registry.join(&key, 2, subscriber(&b, "7", true));

        let msg = BroadcastMessage::new("ping", json!({"n": 1}));
        assert_eq!(registry.broadcast(&key, Some(1), &msg), 1);
        assert_eq!(registry.broadcast(&key, Some(2), &msg), 2);

        assert_eq!(a.send(Drain).await.unwrap().len(), 1);
        let to_b = b.send(Drain).await.unwrap();
        assert_eq!(to_b.len(), 2);
        assert_eq!(to_b[0].join_ref.as_deref(), Some("7"));
        assert_eq!(to_b[0].event, events::BROADCAST);
        assert_eq!(to_b[0].payload["payload"], json!({"n": 1}));
    }

    #[actix::test]
    async fn private_and_public_topics_are_separate() {
        let registry = TopicRegistry::new();
        let public = TopicKey::new("realtime:room", false);
        let private = TopicKey::new("realtime:room", true);
        let a = Collector::default().start();
        registry.join(&private, 1, subscriber(&a, "1", true));

        let msg = BroadcastMessage::new("ping", json!({}));
        assert_eq!(registry.broadcast(&public, None, &msg), 0);
        assert_eq!(registry.broadcast(&private, None, &msg), 1);
    }

    #[actix::test]
    async fn track_update_and_drop_session_emit_diffs() {
        let registry = TopicRegistry::new();
        let key = TopicKey::new("realtime:lobby", false);
        let a = Collector::default().start();
        registry.join(&key, 1, subscriber(&a, "1", false));

        registry.track(&key, 1, "alice", json!({"status": "online"}));
        registry.track(&key, 1, "alice", json!({"status": "away"}));
        let state = registry.presence_state(&key);
        assert_eq!(state["alice"].metas.len(), 1);
        assert_eq!(state["alice"].metas[0].payload["status"], json!("away"));
        assert_eq!(state["alice"].metas[0].phx_ref_prev.as_deref(), Some("1"));

        registry.drop_session(1);
        assert_eq!(registry.subscriber_count(&key), 0);
        assert!(registry.presence_state(&key).is_empty());

        let frames = a.send(Drain).await.unwrap();
        // join, leave+join on update, then the leave on drop
        assert_eq!(frames.len(), 3);
        let last: PresenceDiff = serde_json::from_value(frames[2].payload.clone()).unwrap();
        assert!(last.leaves.contains_key("alice"));
        assert!(last.joins.is_empty());
    }
}
