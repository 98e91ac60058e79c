//! Presence state and the sync algorithm shared by client and service.
//!
//! The service pushes a full `presence_state` after join and incremental
//! `presence_diff`s afterwards. Each tracked key holds a list of metas,
//! one per connection that tracked under that key, told apart by `phx_ref`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};

/// One tracked presence for a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub phx_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phx_ref_prev: Option<String>,
    /// User payload passed to `track`.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub metas: Vec<PresenceMeta>,
}

impl PresenceEntry {
    fn refs(&self) -> HashSet<&str> {
        self.metas.iter().map(|m| m.phx_ref.as_str()).collect()
    }
}

pub type PresenceState = BTreeMap<String, PresenceEntry>;

/// Payload of `presence_diff`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceDiff {
    #[serde(default)]
    pub joins: PresenceState,
    #[serde(default)]
    pub leaves: PresenceState,
}

/// A join or leave observed while syncing.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceChange {
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

/// Replace `current` with a full snapshot, reporting what joined and left.
pub fn sync_state(
    current: &PresenceState,
    snapshot: &PresenceState,
) -> (PresenceState, Vec<PresenceChange>) {
    let mut diff = PresenceDiff::default();

    for (key, presence) in current {
        if !snapshot.contains_key(key) {
            diff.leaves.insert(key.clone(), presence.clone());
        }
    }

    for (key, incoming) in snapshot {
        match current.get(key) {
            Some(existing) => {
                let incoming_refs = incoming.refs();
                let existing_refs = existing.refs();
                let joined: Vec<PresenceMeta> = incoming
                    .metas
                    .iter()
                    .filter(|m| !existing_refs.contains(m.phx_ref.as_str()))
                    .cloned()
                    .collect();
                let left: Vec<PresenceMeta> = existing
                    .metas
                    .iter()
                    .filter(|m| !incoming_refs.contains(m.phx_ref.as_str()))
                    .cloned()
                    .collect();
                if !joined.is_empty() {
                    diff.joins
                        .insert(key.clone(), PresenceEntry { metas: joined });
                }
                if !left.is_empty() {
                    diff.leaves.insert(key.clone(), PresenceEntry { metas: left });
                }
            }
            None => {
                diff.joins.insert(key.clone(), incoming.clone());
            }
        }
    }

    sync_diff(current, &diff)
}

/// Apply an incremental diff.
pub fn sync_diff(
    current: &PresenceState,
    diff: &PresenceDiff,
) -> (PresenceState, Vec<PresenceChange>) {
    let mut state = current.clone();
    let mut changes = Vec::new();

    for (key, joined) in &diff.joins {
        let existing = state.get(key).cloned();
        let mut merged = existing.clone().unwrap_or_default();
        merged.metas.extend(joined.metas.iter().cloned());
        state.insert(key.clone(), merged);
        changes.push(PresenceChange::Join {
            key: key.clone(),
            current: existing,
            joined: joined.clone(),
        });
    }

    for (key, left) in &diff.leaves {
        let Some(entry) = state.get_mut(key) else {
            continue;
        };
        let refs_to_remove = left.refs();
        entry
            .metas
            .retain(|m| !refs_to_remove.contains(m.phx_ref.as_str()));
        changes.push(PresenceChange::Leave {
            key: key.clone(),
            current: entry.clone(),
            left: left.clone(),
        });
        if entry.metas.is_empty() {
            state.remove(key);
        }
    }

    (state, changes)
}

/// Flatten a presence state into `(key, metas)` pairs.
pub fn list(state: &PresenceState) -> Vec<(String, Vec<PresenceMeta>)> {
    state
        .iter()
        .map(|(key, entry)| (key.clone(), entry.metas.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(phx_ref: &str, name: &str) -> PresenceMeta {
        let mut payload = Map::new();
        payload.insert("name".into(), json!(name));
        PresenceMeta {
            phx_ref: phx_ref.into(),
            phx_ref_prev: None,
            payload,
        }
    }

    fn entry(metas: Vec<PresenceMeta>) -> PresenceEntry {
        PresenceEntry { metas }
    }

    #[test]
    fn snapshot_on_empty_state_joins_everyone() {
        let mut snapshot = PresenceState::new();
        snapshot.insert("alice".into(), entry(vec![meta("1", "Alice")]));
        snapshot.insert("bob".into(), entry(vec![meta("2", "Bob")]));

        let (state, changes) = sync_state(&PresenceState::new(), &snapshot);
        assert_eq!(state, snapshot);
        assert_eq!(changes.len(), 2);
        assert!(changes
            .iter()
            .all(|c| matches!(c, PresenceChange::Join { current: None, .. })));
    }

    #[test]
    fn snapshot_drops_missing_keys_and_metas() {
        let mut current = PresenceState::new();
        current.insert("alice".into(), entry(vec![meta("1", "Alice"), meta("3", "Alice")]));
        current.insert("bob".into(), entry(vec![meta("2", "Bob")]));

        let mut snapshot = PresenceState::new();
        snapshot.insert("alice".into(), entry(vec![meta("1", "Alice")]));

        let (state, changes) = sync_state(&current, &snapshot);
        assert_eq!(state.len(), 1);
        assert_eq!(state["alice"].metas.len(), 1);
        assert_eq!(state["alice"].metas[0].phx_ref, "1");
        let leaves: Vec<&str> = changes
            .iter()
            .filter_map(|c| match c {
                PresenceChange::Leave { key, .. } => Some(key.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(leaves, vec!["alice", "bob"]);
    }

    #[test]
    fn diff_appends_metas_after_existing_ones() {
        let mut current = PresenceState::new();
        current.insert("alice".into(), entry(vec![meta("1", "Alice")]));

        let mut diff = PresenceDiff::default();
        diff.joins.insert("alice".into(), entry(vec![meta("4", "Alice tab 2")]));

        let (state, _) = sync_diff(&current, &diff);
        let refs: Vec<&str> = state["alice"].metas.iter().map(|m| m.phx_ref.as_str()).collect();
        assert_eq!(refs, vec!["1", "4"]);
    }

    #[test]
    fn leave_of_last_meta_removes_key() {
        let mut current = PresenceState::new();
        current.insert("bob".into(), entry(vec![meta("2", "Bob")]));

        let mut diff = PresenceDiff::default();
        diff.leaves.insert("bob".into(), entry(vec![meta("2", "Bob")]));

        let (state, changes) = sync_diff(&current, &diff);
        assert!(state.is_empty());
        assert!(matches!(
            &changes[0],
            PresenceChange::Leave { current, .. } if current.metas.is_empty()
        ));
    }

    #[test]
    fn leave_for_unknown_key_is_ignored() {
        let mut diff = PresenceDiff::default();
        diff.leaves.insert("ghost".into(), entry(vec![meta("9", "Ghost")]));
        let (state, changes) = sync_diff(&PresenceState::new(), &diff);
        assert!(state.is_empty());
        assert!(changes.is_empty());
    }

    #[test]
    fn list_pairs_keys_with_their_metas() {
        let mut state = PresenceState::new();
        state.insert("bob".into(), entry(vec![meta("2", "Bob")]));
        state.insert("alice".into(), entry(vec![meta("1", "Alice"), meta("3", "Alice")]));

        let listed = list(&state);
        let keys: Vec<&str> = listed.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, vec!["alice", "bob"]);
        assert_eq!(listed[0].1.len(), 2);
        assert!(list(&PresenceState::new()).is_empty());
    }

    #[test]
    fn meta_payload_is_flattened() {
        let value = serde_json::to_value(meta("1", "Alice")).unwrap();
        assert_eq!(value, json!({"phx_ref": "1", "name": "Alice"}));
        let parsed: PresenceMeta = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.payload["name"], "Alice");
    }
}
