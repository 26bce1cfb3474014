use super::{Reachability, Source};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Connection state for a registered peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Attempt in flight
    Connecting,

    /// At least one path completed the handshake
    Connected,

    /// Both paths failed
    Failed,
}

/// What the registry knows about one identity
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub state: PeerState,

    /// Outcome of the attempt, once it has finished
    pub reachability: Option<Reachability>,

    pub registered_at: Instant,

    pub updated_at: Instant,
}

impl PeerStatus {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            state: PeerState::Connecting,
            reachability: None,
            registered_at: now,
            updated_at: now,
        }
    }

    fn record(&mut self, reachability: Reachability) {
        self.state = if reachability.is_reachable() {
            PeerState::Connected
        } else {
            PeerState::Failed
        };
        self.reachability = Some(reachability);
        self.updated_at = Instant::now();
    }
}

#[derive(Debug)]
struct PeerEntry<S> {
    source: Arc<S>,
    status: PeerStatus,
}

/// Registry of every identity we have attempted to connect to.
///
/// An identity is registered atomically before its attempt starts, so
/// concurrent discoveries of the same peer trigger exactly one attempt.
#[derive(Debug)]
pub struct PeerRegistry<S> {
    peers: RwLock<HashMap<String, PeerEntry<S>>>,
}

impl<S: Source> PeerRegistry<S> {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Register `source` unless its identity is already known.
    ///
    /// Returns the shared source when this call won the registration.
    pub async fn try_register(&self, source: S) -> Option<Arc<S>> {
        let mut peers = self.peers.write().await;

        match peers.entry(source.id().to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let source = Arc::new(source);
                slot.insert(PeerEntry {
                    source: Arc::clone(&source),
                    status: PeerStatus::new(),
                });
                Some(source)
            }
        }
    }

    /// Register and attempt a newly discovered source.
    ///
    /// Returns `None` when the identity was already attempted; otherwise the
    /// handle of the spawned attempt.
    pub async fn dispatch(self: &Arc<Self>, source: S) -> Option<JoinHandle<Reachability>> {
        let id = source.id().to_string();

        let Some(source) = self.try_register(source).await else {
            debug!("Peer {} already attempted, ignoring", id);
            return None;
        };

        debug!("Dispatching connection attempt to {}", id);

        let registry = Arc::clone(self);
        Some(tokio::spawn(async move {
            let reachability = source.try_connect().await.reachability();
            registry.record(&id, reachability).await;
            reachability
        }))
    }

    /// Dispatch every source received until the channel closes
    pub async fn run(self: Arc<Self>, mut sources: mpsc::Receiver<S>) {
        while let Some(source) = sources.recv().await {
            self.dispatch(source).await;
        }

        debug!("Source channel closed, registry stopped");
    }

    async fn record(&self, id: &str, reachability: Reachability) {
        if let Some(entry) = self.peers.write().await.get_mut(id) {
            entry.status.record(reachability);
            info!("Peer {} marked {:?} ({})", id, entry.status.state, reachability);
        }
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.peers.read().await.contains_key(id)
    }

    pub async fn status(&self, id: &str) -> Option<PeerStatus> {
        self.peers.read().await.get(id).map(|e| e.status.clone())
    }

    pub async fn source(&self, id: &str) -> Option<Arc<S>> {
        self.peers.read().await.get(id).map(|e| Arc::clone(&e.source))
    }

    /// Forget an identity so it may be attempted again
    pub async fn remove(&self, id: &str) -> bool {
        self.peers.write().await.remove(id).is_some()
    }

    /// Forget every failed identity, returning their ids
    pub async fn remove_failed(&self) -> Vec<String> {
        let mut peers = self.peers.write().await;

        let failed: Vec<_> = peers
            .iter()
            .filter(|(_, e)| e.status.state == PeerState::Failed)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &failed {
            peers.remove(id);
        }

        failed
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    pub async fn stats(&self) -> RegistryStats {
        let peers = self.peers.read().await;
        let count = |state| peers.values().filter(|e| e.status.state == state).count();

        RegistryStats {
            total_peers: peers.len(),
            connecting: count(PeerState::Connecting),
            connected: count(PeerState::Connected),
            failed: count(PeerState::Failed),
        }
    }
}

impl<S: Source> Default for PeerRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub total_peers: usize,
    pub connecting: usize,
    pub connected: usize,
    pub failed: usize,
}
