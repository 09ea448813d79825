//! Subscription table and retained-message store
//!
//! Exact-topic filters live in a map; wildcard filters live in a sequential
//! list because every published topic must be tested against each of them.
//! Retained messages are keyed by exact topic. One mutex guards all three
//! structures; every read path returns a snapshot so no job queue is ever
//! touched while the lock is held.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::debug;

use crate::broker::connection::Connection;
use crate::protocol::Publish;
use crate::topic;

/// One wildcard subscription: pre-split filter parts plus the owner.
struct WildcardSub {
    parts: Vec<String>,
    conn: Arc<Connection>,
}

impl WildcardSub {
    fn parts_eq<P: AsRef<str>>(&self, parts: &[P]) -> bool {
        self.parts.len() == parts.len()
            && self.parts.iter().zip(parts).all(|(a, b)| a == b.as_ref())
    }
}

#[derive(Default)]
struct TableState {
    /// Exact filters. Unsubscribing nulls slots instead of compacting so
    /// nothing shifts under a snapshot taken moments earlier; fully-null
    /// vectors are dropped.
    exact: AHashMap<String, Vec<Option<Arc<Connection>>>>,
    wildcards: Vec<WildcardSub>,
    /// Stored copies carry retain=true so replay to new subscribers
    /// announces them as old. Never holds a zero-payload entry.
    retained: AHashMap<String, Publish>,
}

/// Concurrency-safe subscription table plus retained store.
#[derive(Default)]
pub struct SubscriptionTable {
    inner: Mutex<TableState>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription. Ill-formed wildcard filters are ignored, and a
    /// (filter, connection) pair already present is not added twice, so a
    /// client re-subscribing does not accrue duplicate deliveries.
    pub fn add(&self, filter: &str, conn: &Arc<Connection>) {
        let mut state = self.inner.lock();
        if topic::is_wildcard(filter) {
            let parts: Vec<String> = filter.split('/').map(str::to_owned).collect();
            if !topic::valid_filter(&parts) {
                debug!(filter = %filter, "ignoring ill-formed filter");
                return;
            }
            if state
                .wildcards
                .iter()
                .any(|w| w.parts == parts && Arc::ptr_eq(&w.conn, conn))
            {
                return;
            }
            state.wildcards.push(WildcardSub {
                parts,
                conn: conn.clone(),
            });
        } else {
            let slots = state.exact.entry(filter.to_owned()).or_default();
            if slots
                .iter()
                .flatten()
                .any(|existing| Arc::ptr_eq(existing, conn))
            {
                return;
            }
            slots.push(Some(conn.clone()));
        }
    }

    /// Remove one subscription for a connection.
    pub fn unsubscribe(&self, filter: &str, conn: &Arc<Connection>) {
        let mut state = self.inner.lock();
        if topic::is_wildcard(filter) {
            let parts: Vec<&str> = filter.split('/').collect();
            state
                .wildcards
                .retain(|w| !(w.parts_eq(&parts) && Arc::ptr_eq(&w.conn, conn)));
        } else if let Some(slots) = state.exact.get_mut(filter) {
            for slot in slots.iter_mut() {
                if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
                    *slot = None;
                }
            }
            if slots.iter().all(Option::is_none) {
                state.exact.remove(filter);
            }
        }
    }

    /// Remove every subscription that refers to a connection. Runs on the
    /// writer's exit path so no reference outlives the connection.
    pub fn unsubscribe_all(&self, conn: &Arc<Connection>) {
        let mut state = self.inner.lock();
        for slots in state.exact.values_mut() {
            for slot in slots.iter_mut() {
                if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
                    *slot = None;
                }
            }
        }
        state.exact.retain(|_, slots| slots.iter().any(Option::is_some));
        state.wildcards.retain(|w| !Arc::ptr_eq(&w.conn, conn));
    }

    /// Snapshot of every connection subscribed to this topic.
    pub fn subscribers(&self, topic_name: &str) -> SmallVec<[Arc<Connection>; 8]> {
        let parts: Vec<&str> = topic_name.split('/').collect();
        let state = self.inner.lock();

        let mut result: SmallVec<[Arc<Connection>; 8]> = SmallVec::new();
        if let Some(slots) = state.exact.get(topic_name) {
            result.extend(slots.iter().flatten().cloned());
        }
        for w in &state.wildcards {
            if topic::filter_matches(&w.parts, &parts) {
                result.push(w.conn.clone());
            }
        }
        result
    }

    /// Retained messages a new subscription to `filter` should see.
    ///
    /// An exact filter looks up its one entry; a wildcard filter walks the
    /// whole store and collects every matching key, in unspecified order.
    pub fn retained_for(&self, filter: &str) -> Vec<Publish> {
        let state = self.inner.lock();
        if topic::is_wildcard(filter) {
            let parts: Vec<&str> = filter.split('/').collect();
            state
                .retained
                .iter()
                .filter(|(key, _)| {
                    let key_parts: Vec<&str> = key.split('/').collect();
                    topic::filter_matches(&parts, &key_parts)
                })
                .map(|(_, message)| message.clone())
                .collect()
        } else {
            state.retained.get(filter).cloned().into_iter().collect()
        }
    }

    /// Install the retained message for a topic. The stored copy gets
    /// retain=true so later replay carries the flag on the wire.
    pub fn store_retained(&self, publish: &Publish) {
        let mut message = publish.clone();
        message.retain = true;
        self.inner
            .lock()
            .retained
            .insert(message.topic.to_string(), message);
    }

    /// Drop the retained message for a topic, if any.
    pub fn delete_retained(&self, topic_name: &str) {
        self.inner.lock().retained.remove(topic_name);
    }

    /// Number of retained messages currently stored.
    pub fn retained_len(&self) -> usize {
        self.inner.lock().retained.len()
    }

    #[cfg(test)]
    fn exact_slots(&self, filter: &str) -> Option<Vec<bool>> {
        self.inner
            .lock()
            .exact
            .get(filter)
            .map(|slots| slots.iter().map(Option::is_some).collect())
    }

    #[cfg(test)]
    fn wildcard_len(&self) -> usize {
        self.inner.lock().wildcards.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn test_conn() -> Arc<Connection> {
        let (conn, _rx) = Connection::new("127.0.0.1:0".parse().unwrap(), 8);
        conn
    }

    fn publish(topic_name: &str, payload: &[u8], retain: bool) -> Publish {
        Publish {
            retain,
            topic: Arc::from(topic_name),
            payload: Bytes::copy_from_slice(payload),
            ..Publish::default()
        }
    }

    #[test]
    fn exact_add_and_match() {
        let table = SubscriptionTable::new();
        let a = test_conn();
        let b = test_conn();

        table.add("a/b", &a);
        table.add("a/b", &b);

        let subs = table.subscribers("a/b");
        assert_eq!(subs.len(), 2);
        assert!(table.subscribers("a/c").is_empty());
    }

    #[test]
    fn duplicate_add_is_single_entry() {
        let table = SubscriptionTable::new();
        let conn = test_conn();

        table.add("a/b", &conn);
        table.add("a/b", &conn);
        assert_eq!(table.subscribers("a/b").len(), 1);

        table.add("a/+", &conn);
        table.add("a/+", &conn);
        assert_eq!(table.wildcard_len(), 1);
    }

    #[test]
    fn wildcard_add_and_match() {
        let table = SubscriptionTable::new();
        let conn = test_conn();

        table.add("sport/+/player1", &conn);
        assert_eq!(table.subscribers("sport/tennis/player1").len(), 1);
        assert!(table.subscribers("sport/tennis/player2").is_empty());
    }

    #[test]
    fn ill_formed_filter_is_ignored() {
        let table = SubscriptionTable::new();
        let conn = test_conn();

        table.add("finance#", &conn);
        table.add("a/#/b", &conn);
        assert_eq!(table.wildcard_len(), 0);
    }

    #[test]
    fn unsubscribe_nulls_then_deletes() {
        let table = SubscriptionTable::new();
        let a = test_conn();
        let b = test_conn();

        table.add("a/b", &a);
        table.add("a/b", &b);

        table.unsubscribe("a/b", &a);
        // a's slot is nulled, b's remains
        assert_eq!(table.exact_slots("a/b"), Some(vec![false, true]));
        assert_eq!(table.subscribers("a/b").len(), 1);

        table.unsubscribe("a/b", &b);
        // all slots null: the key is gone
        assert_eq!(table.exact_slots("a/b"), None);
    }

    #[test]
    fn unsubscribe_all_clears_every_reference() {
        let table = SubscriptionTable::new();
        let gone = test_conn();
        let stays = test_conn();

        table.add("a/b", &gone);
        table.add("a/b", &stays);
        table.add("x/#", &gone);
        table.add("x/#", &stays);

        table.unsubscribe_all(&gone);

        assert_eq!(table.subscribers("a/b").len(), 1);
        assert_eq!(table.wildcard_len(), 1);
        assert!(table
            .subscribers("x/y")
            .iter()
            .all(|c| Arc::ptr_eq(c, &stays)));
    }

    #[test]
    fn retained_store_and_lookup() {
        let table = SubscriptionTable::new();

        table.store_retained(&publish("status/device1", b"on", false));
        assert_eq!(table.retained_len(), 1);

        let replayed = table.retained_for("status/device1");
        assert_eq!(replayed.len(), 1);
        assert!(replayed[0].retain, "stored copy must carry retain=true");
        assert_eq!(replayed[0].payload.as_ref(), b"on");

        table.delete_retained("status/device1");
        assert!(table.retained_for("status/device1").is_empty());
    }

    #[test]
    fn retained_wildcard_lookup() {
        let table = SubscriptionTable::new();

        table.store_retained(&publish("status/device1", b"on", false));
        table.store_retained(&publish("status/device2", b"off", false));
        table.store_retained(&publish("other/topic", b"x", false));

        let mut replayed = table.retained_for("status/+");
        replayed.sort_by(|a, b| a.topic.cmp(&b.topic));
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].topic.as_ref(), "status/device1");
        assert_eq!(replayed[1].topic.as_ref(), "status/device2");

        assert_eq!(table.retained_for("#").len(), 3);
    }
}
