//! # Consolidated State Store
//!
//! Owns the single mutable consolidated-state tree and the update counter.
//!
//! There is exactly one [`StateWriter`], held by the upstream reader. Every
//! mutation happens inside one `watch::Sender::send_modify` call, so a whole
//! frame's worth of events is applied under the channel's write lock and
//! readers observe either the pre-frame or the post-frame snapshot, never an
//! intermediate one. [`StateReader`]s clone an `Arc` out of the channel and do
//! their (comparatively slow) serialization outside of any lock.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::core::merge::{deep_merge, Tree};

/// Lifecycle of the upstream link, published alongside the state for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// No session; the supervisor is waiting to retry.
    Disconnected,
    /// A handshake or websocket connect is in flight.
    Negotiating,
    /// The upstream stream is open and subscribed.
    Connected,
}

/// One unit of upstream information, ready to be merged.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEvent {
    /// A single incremental topic update delivered mid-stream.
    Feed {
        /// Base topic name (never a compressed variant).
        topic: String,
        /// New value for the topic.
        value: Value,
    },
    /// A bulk set of topic values, typically the reply to the subscription.
    Snapshot {
        /// Topic name to value; compressed variants already decoded and renamed.
        values: Tree,
    },
}

impl UpdateEvent {
    /// How many counter increments this event is worth.
    pub fn units(&self) -> u64 {
        match self {
            UpdateEvent::Feed { .. } => 1,
            UpdateEvent::Snapshot { values } => values.len() as u64,
        }
    }

    fn into_modifier(self) -> Tree {
        match self {
            UpdateEvent::Feed { topic, value } => {
                let mut modifier = Tree::new();
                modifier.insert(topic, value);
                modifier
            }
            UpdateEvent::Snapshot { values } => values,
        }
    }
}

/// An immutable, cheaply clonable view of the state at one point in time.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    /// The consolidated state, keyed by topic.
    pub tree: Arc<Tree>,
    /// Update units processed since the last reset.
    pub updates: u64,
    /// Bumped on every publish; lets readers skip work when nothing changed.
    pub version: u64,
    /// Upstream link state at publish time.
    pub link: LinkState,
}

impl StateSnapshot {
    fn empty() -> Self {
        Self {
            tree: Arc::new(Tree::new()),
            updates: 0,
            version: 0,
            link: LinkState::Disconnected,
        }
    }
}

/// The single writer of the consolidated state.
pub struct StateWriter {
    tx: watch::Sender<StateSnapshot>,
}

/// Read-only handle to the latest published snapshot.
#[derive(Clone)]
pub struct StateReader {
    rx: watch::Receiver<StateSnapshot>,
}

/// Creates an empty state store and returns its writer and a first reader.
pub fn state_store() -> (StateWriter, StateReader) {
    let (tx, rx) = watch::channel(StateSnapshot::empty());
    (StateWriter { tx }, StateReader { rx })
}

impl StateWriter {
    /// Empties the state and zeroes the counter. Called on every fresh upstream connection.
    pub fn reset(&self) {
        self.tx.send_modify(|snapshot| {
            snapshot.tree = Arc::new(Tree::new());
            snapshot.updates = 0;
            snapshot.version += 1;
        });
    }

    /// Records the upstream link state.
    pub fn set_link(&self, link: LinkState) {
        self.tx.send_if_modified(|snapshot| {
            if snapshot.link == link {
                return false;
            }
            snapshot.link = link;
            snapshot.version += 1;
            true
        });
    }

    /// Merges every event, in order, as one atomic publish.
    ///
    /// Returns the number of update units added to the counter.
    pub fn apply(&self, events: Vec<UpdateEvent>) -> u64 {
        if events.is_empty() {
            return 0;
        }

        let mut applied = 0;
        self.tx.send_modify(|snapshot| {
            let tree = Arc::make_mut(&mut snapshot.tree);
            for event in events {
                applied += event.units();
                let base = std::mem::take(tree);
                *tree = deep_merge(base, Some(event.into_modifier()));
            }
            snapshot.updates += applied;
            snapshot.version += 1;
        });
        applied
    }
}

impl StateReader {
    /// The latest published snapshot.
    pub fn current(&self) -> StateSnapshot {
        self.rx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed(topic: &str, value: Value) -> UpdateEvent {
        UpdateEvent::Feed { topic: topic.to_string(), value }
    }

    fn snapshot_event(value: Value) -> UpdateEvent {
        match value {
            Value::Object(values) => UpdateEvent::Snapshot { values },
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn starts_empty_and_disconnected() {
        let (_writer, reader) = state_store();
        let snap = reader.current();
        assert!(snap.tree.is_empty());
        assert_eq!(snap.updates, 0);
        assert_eq!(snap.link, LinkState::Disconnected);
    }

    #[test]
    fn counts_feed_events_and_snapshot_keys() {
        let (writer, reader) = state_store();

        let units = writer.apply(vec![snapshot_event(json!({
            "SessionInfo": {"Name": "Race"},
            "LapCount": {"CurrentLap": 1},
            "Heartbeat": {"Utc": "x"}
        }))]);
        assert_eq!(units, 3);

        let units = writer.apply(vec![
            feed("LapCount", json!({"CurrentLap": 2})),
            feed("TrackStatus", json!({"Status": "1"})),
        ]);
        assert_eq!(units, 2);

        let snap = reader.current();
        assert_eq!(snap.updates, 5);
        assert_eq!(snap.tree["LapCount"], json!({"CurrentLap": 2}));
        assert_eq!(snap.tree["SessionInfo"], json!({"Name": "Race"}));
    }

    #[test]
    fn feed_after_snapshot_wins_and_vice_versa() {
        let (writer, reader) = state_store();
        writer.apply(vec![feed("TrackStatus", json!({"Status": "2"}))]);
        writer.apply(vec![snapshot_event(json!({"TrackStatus": {"Status": "1", "Message": "AllClear"}}))]);
        assert_eq!(reader.current().tree["TrackStatus"], json!({"Status": "1", "Message": "AllClear"}));

        writer.apply(vec![feed("TrackStatus", json!({"Status": "4"}))]);
        assert_eq!(reader.current().tree["TrackStatus"], json!({"Status": "4", "Message": "AllClear"}));
    }

    #[test]
    fn reset_clears_tree_and_counter() {
        let (writer, reader) = state_store();
        writer.apply(vec![feed("LapCount", json!({"CurrentLap": 2}))]);
        writer.reset();

        let snap = reader.current();
        assert!(snap.tree.is_empty());
        assert_eq!(snap.updates, 0);
    }

    #[test]
    fn held_snapshot_is_not_affected_by_later_merges() {
        let (writer, reader) = state_store();
        writer.apply(vec![feed("LapCount", json!({"CurrentLap": 1}))]);
        let held = reader.current();

        writer.apply(vec![feed("LapCount", json!({"CurrentLap": 2}))]);

        assert_eq!(held.tree["LapCount"], json!({"CurrentLap": 1}));
        assert_eq!(reader.current().tree["LapCount"], json!({"CurrentLap": 2}));
        assert!(reader.current().version > held.version);
    }

    #[test]
    fn empty_apply_publishes_nothing() {
        let (writer, reader) = state_store();
        let before = reader.current().version;
        assert_eq!(writer.apply(Vec::new()), 0);
        assert_eq!(reader.current().version, before);
    }

    #[test]
    fn link_state_changes_bump_version_once() {
        let (writer, reader) = state_store();
        writer.set_link(LinkState::Connected);
        let version = reader.current().version;
        writer.set_link(LinkState::Connected);
        assert_eq!(reader.current().version, version);
        assert_eq!(reader.current().link, LinkState::Connected);
    }
}
