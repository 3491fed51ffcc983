use crate::model::Role;
use crate::state::lock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

pub type PeerId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(Arc<str>),
    Binary(Arc<[u8]>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("peer outbound queue closed")]
    Closed,
    #[error("peer outbound queue full past delivery timeout")]
    TimedOut,
}

#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    role: Role,
    remote: Option<SocketAddr>,
    connected_at: Instant,
    tx: mpsc::Sender<Outbound>,
    close: Notify,
}

impl Peer {
    pub fn new(
        role: Role,
        remote: Option<SocketAddr>,
        queue: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let peer = Arc::new(Self {
            id: Uuid::new_v4(),
            role,
            remote,
            connected_at: Instant::now(),
            tx,
            close: Notify::new(),
        });
        (peer, rx)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub async fn deliver(&self, message: Outbound, timeout: Duration) -> Result<(), DeliveryError> {
        self.tx
            .send_timeout(message, timeout)
            .await
            .map_err(|err| match err {
                mpsc::error::SendTimeoutError::Closed(_) => DeliveryError::Closed,
                mpsc::error::SendTimeoutError::Timeout(_) => DeliveryError::TimedOut,
            })
    }

    pub fn close(&self) {
        self.close.notify_one();
    }

    pub async fn closed(&self) {
        self.close.notified().await;
    }
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    devices: Mutex<HashMap<PeerId, Arc<Peer>>>,
    controllers: Mutex<HashMap<PeerId, Arc<Peer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn members(&self, role: Role) -> &Mutex<HashMap<PeerId, Arc<Peer>>> {
        match role {
            Role::Device => &self.devices,
            Role::Controller => &self.controllers,
        }
    }

    pub fn register(&self, peer: Arc<Peer>) {
        let role = peer.role();
        let count = {
            let mut members = lock(self.members(role));
            members.insert(peer.id(), peer.clone());
            members.len()
        };
        tracing::debug!(peer_id = %peer.id(), %role, count, "peer registered");
    }

    // false when it was already gone
    pub fn unregister(&self, id: PeerId) -> bool {
        for role in [Role::Device, Role::Controller] {
            if lock(self.members(role)).remove(&id).is_some() {
                tracing::debug!(peer_id = %id, %role, "peer unregistered");
                return true;
            }
        }
        false
    }

    pub fn snapshot(&self, role: Role) -> Vec<Arc<Peer>> {
        lock(self.members(role)).values().cloned().collect()
    }

    pub fn count(&self, role: Role) -> usize {
        lock(self.members(role)).len()
    }

    #[cfg(test)]
    pub fn contains(&self, id: PeerId) -> bool {
        lock(&self.devices).contains_key(&id) || lock(&self.controllers).contains_key(&id)
    }

    pub fn close_all(&self) {
        for role in [Role::Device, Role::Controller] {
            for peer in self.snapshot(role) {
                peer.close();
            }
        }
    }
}
