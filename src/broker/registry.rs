//! Client identifier registry
//!
//! Process-wide map from client identifier to the currently-active
//! connection, enforcing one session per identifier. The registry lock is
//! the innermost lock in the broker: nothing else is taken while it is
//! held.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::broker::connection::Connection;

#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<AHashMap<Arc<str>, Arc<Connection>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a connection under its client identifier, returning any
    /// previously-registered connection for the same identifier. The caller
    /// owns telling the displaced connection to disconnect and waiting for
    /// its writer to flush.
    pub fn register(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let id = conn.client_id();
        self.clients.lock().insert(id, conn)
    }

    /// Remove a connection's registry entry, but only while it still points
    /// at this connection: a displaced session cleaning up late must not
    /// evict its replacement.
    pub fn deregister(&self, conn: &Arc<Connection>) {
        let id = conn.client_id();
        let mut clients = self.clients.lock();
        if clients.get(&id).is_some_and(|current| Arc::ptr_eq(current, conn)) {
            clients.remove(&id);
        }
    }

    /// Look up the active connection for an identifier.
    pub fn get(&self, client_id: &str) -> Option<Arc<Connection>> {
        self.clients.lock().get(client_id).cloned()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named_conn(id: &str) -> Arc<Connection> {
        let (conn, _rx) = Connection::new("127.0.0.1:0".parse().unwrap(), 8);
        conn.set_test_client_id(id);
        conn
    }

    #[test]
    fn register_and_deregister() {
        let registry = ClientRegistry::new();
        let conn = named_conn("c1");

        assert!(registry.register(conn.clone()).is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.get("c1").is_some());

        registry.deregister(&conn);
        assert!(registry.is_empty());
    }

    #[test]
    fn register_returns_displaced_connection() {
        let registry = ClientRegistry::new();
        let first = named_conn("c1");
        let second = named_conn("c1");

        assert!(registry.register(first.clone()).is_none());
        let displaced = registry.register(second.clone()).expect("expected displaced");
        assert!(Arc::ptr_eq(&displaced, &first));
        assert!(Arc::ptr_eq(&registry.get("c1").unwrap(), &second));
    }

    #[test]
    fn late_deregister_does_not_evict_replacement() {
        let registry = ClientRegistry::new();
        let first = named_conn("c1");
        let second = named_conn("c1");

        registry.register(first.clone());
        registry.register(second.clone());

        // The displaced writer's cleanup arrives after the takeover.
        registry.deregister(&first);
        assert!(Arc::ptr_eq(&registry.get("c1").unwrap(), &second));

        registry.deregister(&second);
        assert!(registry.is_empty());
    }
}
