use crate::model::{Command, DeviceMessage, Role};
use crate::registry::{Outbound, Peer, PeerId, PeerRegistry};
use crate::state::SharedState;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

// Never surfaced to the sender.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub recipients: usize,
    pub delivered: usize,
    pub pruned: usize,
}

pub struct Router {
    registry: Arc<PeerRegistry>,
    state: Arc<SharedState>,
    delivery_timeout: Duration,
}

impl Router {
    pub fn new(
        registry: Arc<PeerRegistry>,
        state: Arc<SharedState>,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            state,
            delivery_timeout,
        }
    }

    pub async fn handle_command(&self, command: Command, source: Option<PeerId>) -> BroadcastReport {
        self.state.set_action(&command.action, command.speed);

        let json = match serde_json::to_string(&DeviceMessage::from(&command)) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, action = %command.action, "failed to encode action message");
                return BroadcastReport::default();
            }
        };

        let report = self
            .broadcast(Role::Device, Outbound::Text(Arc::from(json)))
            .await;
        debug!(
            source = ?source,
            action = %command.action,
            speed = command.speed,
            recipients = report.recipients,
            pruned = report.pruned,
            "command routed"
        );
        report
    }

    pub async fn handle_frame(&self, bytes: Arc<[u8]>, source: Option<PeerId>) -> BroadcastReport {
        let size = bytes.len();
        self.state.set_frame(bytes.clone());

        let report = self.broadcast(Role::Controller, Outbound::Binary(bytes)).await;
        debug!(
            source = ?source,
            size,
            recipients = report.recipients,
            pruned = report.pruned,
            "frame routed"
        );
        report
    }

    pub async fn emergency_stop(&self) -> BroadcastReport {
        warn!("emergency stop requested");
        self.state.mark_emergency_stop();
        self.handle_command(Command::new("stop", Some(0)), None).await
    }

    async fn broadcast(&self, role: Role, message: Outbound) -> BroadcastReport {
        let recipients = self.registry.snapshot(role);
        if recipients.is_empty() {
            debug!(%role, "no peers to deliver to");
            return BroadcastReport::default();
        }

        let timeout = self.delivery_timeout;
        let outcomes = join_all(recipients.iter().map(|peer| {
            let message = message.clone();
            async move { (peer, peer.deliver(message, timeout).await) }
        }))
        .await;

        let mut report = BroadcastReport {
            recipients: recipients.len(),
            ..Default::default()
        };
        for (peer, outcome) in outcomes {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    prune(&self.registry, peer, &err);
                    report.pruned += 1;
                }
            }
        }
        report
    }
}

fn prune(registry: &PeerRegistry, peer: &Peer, err: &dyn std::error::Error) {
    warn!(
        peer_id = %peer.id(),
        role = %peer.role(),
        remote = ?peer.remote(),
        error = %err,
        "delivery failed, dropping peer"
    );
    registry.unregister(peer.id());
    peer.close();
}
