//! Membership view consumed by coordinators.
//!
//! Failure detection lives outside the core; it reports transitions through
//! [`Membership::set_status`]. Readers take an immutable snapshot per query
//! and subscribe to liveness changes (hint delivery waits on `Down -> Up`).

use crate::node::Liveness;
use crate::snapshot::RingSnapshot;
use cirrus_common::NodeId;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// A liveness transition for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessChange {
    pub node: NodeId,
    pub from: Liveness,
    pub to: Liveness,
}

impl LivenessChange {
    /// True for transitions that make a node reachable again.
    pub fn is_recovery(&self) -> bool {
        !self.from.is_alive() && self.to.is_alive()
    }
}

#[derive(Debug)]
pub struct Membership {
    ring: RwLock<Arc<RingSnapshot>>,
    changes: broadcast::Sender<LivenessChange>,
}

impl Membership {
    pub fn new(initial: RingSnapshot) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            ring: RwLock::new(Arc::new(initial)),
            changes,
        }
    }

    /// The current ring. Callers keep it for the duration of one query.
    pub async fn snapshot(&self) -> Arc<RingSnapshot> {
        self.ring.read().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LivenessChange> {
        self.changes.subscribe()
    }

    /// Record a liveness report. Publishes a new snapshot and a change
    /// notification when the status actually changes.
    pub async fn set_status(&self, node: NodeId, status: Liveness) -> bool {
        let change = {
            let mut ring = self.ring.write().await;
            let Some(from) = ring.node(&node).map(|n| n.status) else {
                tracing::warn!("liveness report for unknown node {}", node);
                return false;
            };
            if from == status {
                return false;
            }
            let Some(next) = ring.with_status(&node, status) else {
                return false;
            };
            *ring = Arc::new(next);
            LivenessChange {
                node,
                from,
                to: status,
            }
        };

        tracing::info!("node {} is now {:?} (was {:?})", node, change.to, change.from);
        // No subscribers is fine.
        let _ = self.changes.send(change);
        true
    }
}
