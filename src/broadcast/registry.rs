use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Serialised wire frame shared by every recipient of one broadcast
pub type Frame = Arc<str>;

/// Opaque handle for one connected listener
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Live listener as seen by a broadcast: its handle and outbound channel
#[derive(Clone, Debug)]
pub struct ClientEntry {
    pub id: ClientId,
    pub sender: mpsc::Sender<Frame>,
}

/// Connected listeners. The registry is the only long-lived owner of client
/// senders; broadcasts iterate a snapshot so registration and removal never
/// wait on an in-flight delivery.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<RwLock<HashMap<ClientId, mpsc::Sender<Frame>>>>,
    next_id: Arc<AtomicU64>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sender: mpsc::Sender<Frame>) -> ClientId {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let count = {
            let mut clients = self.clients.write();
            clients.insert(id, sender);
            clients.len()
        };
        info!("Registered {} ({} connected)", id, count);
        id
    }

    /// Returns whether the client was still registered.
    pub fn unregister(&self, id: ClientId) -> bool {
        let (removed, count) = {
            let mut clients = self.clients.write();
            let removed = clients.remove(&id).is_some();
            (removed, clients.len())
        };
        if removed {
            info!("Unregistered {} ({} connected)", id, count);
        } else {
            debug!("{} was already unregistered", id);
        }
        removed
    }

    /// Clients live at the time of the call, ordered by registration.
    pub fn snapshot(&self) -> Vec<ClientEntry> {
        let mut entries: Vec<ClientEntry> = self
            .clients
            .read()
            .iter()
            .map(|(id, sender)| ClientEntry {
                id: *id,
                sender: sender.clone(),
            })
            .collect();
        entries.sort_by_key(|entry| entry.id);
        entries
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Drops every handle without notifying the clients. Their outbound
    /// channels close once the connection tasks notice.
    pub fn clear(&self) {
        let dropped = {
            let mut clients = self.clients.write();
            let dropped = clients.len();
            clients.clear();
            dropped
        };
        info!("Client registry cleared, dropped {} clients", dropped);
    }
}

impl fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_assigns_distinct_handles() {
        let registry = ClientRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let a = registry.register(tx.clone());
        let b = registry.register(tx);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(a) && registry.contains(b));
    }

    #[test]
    fn unregister_removes_from_snapshot() {
        let registry = ClientRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let a = registry.register(tx.clone());
        let b = registry.register(tx);

        assert!(registry.unregister(a));
        assert!(!registry.unregister(a));

        let ids: Vec<ClientId> = registry.snapshot().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![b]);
    }

    #[test]
    fn snapshot_is_detached_from_later_changes() {
        let registry = ClientRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let a = registry.register(tx.clone());
        let snapshot = registry.snapshot();

        registry.unregister(a);
        registry.register(tx);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, a);
    }

    #[test]
    fn clear_drops_all_clients() {
        let registry = ClientRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        registry.register(tx.clone());
        registry.register(tx);
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn concurrent_registration_and_removal() {
        let registry = ClientRegistry::new();
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let (tx, _rx) = mpsc::channel(1);
                        let id = registry.register(tx);
                        let _ = registry.snapshot();
                        registry.unregister(id);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
