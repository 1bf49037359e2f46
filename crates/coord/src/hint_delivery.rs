//! Hinted-handoff delivery task.
//!
//! The task owns the [`HintStore`]. Coordinators talk to it through a
//! [`HintHandle`]; membership recovery events drain every hint owed to the
//! recovered node, and a periodic tick retries and expires hints one
//! bounded cycle at a time.

use crate::hint_store::{HintStore, HintStoreError};
use crate::replica_client::{ReplicaClient, WriteMode};
use cirrus_common::{now_secs, NodeId};
use cirrus_ring::Membership;
use cirrus_storage::Mutation;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval, Duration};

#[derive(Debug, Clone)]
pub struct HintDeliveryConfig {
    /// How often to retry pending hints.
    pub check_interval: Duration,
    /// Maximum hints to deliver per cycle.
    pub max_hints_per_cycle: usize,
    /// How long a stored hint stays deliverable.
    pub hint_deadline: Duration,
    /// Per-hint delivery timeout.
    pub delivery_timeout: Duration,
}

impl Default for HintDeliveryConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            max_hints_per_cycle: 100,
            hint_deadline: Duration::from_secs(3 * 3600),
            delivery_timeout: Duration::from_secs(2),
        }
    }
}

impl HintDeliveryConfig {
    pub fn from_config(c: &cirrus_config::CoordinatorConfig) -> Self {
        Self {
            check_interval: Duration::from_secs(c.hint_delivery_interval_secs.max(1)),
            max_hints_per_cycle: c.max_hints_per_cycle,
            hint_deadline: Duration::from_secs(c.hint_deadline_seconds),
            delivery_timeout: Duration::from_millis(c.write_timeout_ms),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HintError {
    #[error("hint delivery task has stopped")]
    Closed,
    #[error(transparent)]
    Store(#[from] HintStoreError),
}

enum HintRequest {
    Store {
        target: NodeId,
        mutation: Mutation,
        mode: WriteMode,
        reply: oneshot::Sender<Result<u64, HintStoreError>>,
    },
    Pending {
        target: Option<NodeId>,
        reply: oneshot::Sender<usize>,
    },
    DeliverNow {
        reply: oneshot::Sender<usize>,
    },
}

/// Cloneable handle to the hint delivery task.
#[derive(Debug, Clone)]
pub struct HintHandle {
    tx: mpsc::Sender<HintRequest>,
}

impl std::fmt::Debug for HintRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HintRequest::Store { target, .. } => write!(f, "Store({})", target),
            HintRequest::Pending { .. } => write!(f, "Pending"),
            HintRequest::DeliverNow { .. } => write!(f, "DeliverNow"),
        }
    }
}

impl HintHandle {
    /// Durably store a hint for `target`; returns once it is logged.
    /// The hint is replayed with the same `mode` as the original write.
    pub async fn store(
        &self,
        target: NodeId,
        mutation: Mutation,
        mode: WriteMode,
    ) -> Result<u64, HintError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HintRequest::Store {
                target,
                mutation,
                mode,
                reply,
            })
            .await
            .map_err(|_| HintError::Closed)?;
        Ok(rx.await.map_err(|_| HintError::Closed)??)
    }

    /// Pending hints, for one target or all of them.
    pub async fn pending(&self, target: Option<NodeId>) -> Result<usize, HintError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HintRequest::Pending { target, reply })
            .await
            .map_err(|_| HintError::Closed)?;
        rx.await.map_err(|_| HintError::Closed)
    }

    /// Deliver every hint owed to reachable targets now; returns hints
    /// delivered.
    pub async fn deliver_now(&self) -> Result<usize, HintError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HintRequest::DeliverNow { reply })
            .await
            .map_err(|_| HintError::Closed)?;
        rx.await.map_err(|_| HintError::Closed)
    }
}

/// Spawn the hint delivery task.
///
/// The task stops when `shutdown` flips to true or every handle is dropped.
pub fn spawn_hint_delivery_task<R: ReplicaClient>(
    mut store: HintStore,
    membership: Arc<Membership>,
    client: Arc<R>,
    config: HintDeliveryConfig,
    mut shutdown: watch::Receiver<bool>,
) -> (HintHandle, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<HintRequest>(1024);
    let mut changes = membership.subscribe();

    let task = tokio::spawn(async move {
        let mut tick = interval(config.check_interval);
        loop {
            tokio::select! {
                request = rx.recv() => {
                    let Some(request) = request else { break };
                    match request {
                        HintRequest::Store { target, mutation, mode, reply } => {
                            let deadline = now_secs() + config.hint_deadline.as_secs() as i64;
                            let result = store.store(target, mutation, mode, deadline);
                            if result.is_ok() {
                                cirrus_metrics::metrics().hints_stored.inc();
                            }
                            let _ = reply.send(result);
                        }
                        HintRequest::Pending { target, reply } => {
                            let count = match target {
                                Some(t) => store.hint_count_for(&t),
                                None => store.hint_count(),
                            };
                            let _ = reply.send(count);
                        }
                        HintRequest::DeliverNow { reply } => {
                            let delivered =
                                drain_hints(&mut store, &membership, &client, &config, None).await;
                            let _ = reply.send(delivered);
                        }
                    }
                }
                _ = tick.tick() => {
                    deliver_hints(&mut store, &membership, &client, &config, None).await;
                    if let Err(e) = store.sync() {
                        tracing::warn!("hint log sync failed: {}", e);
                    }
                }
                change = changes.recv() => match change {
                    Ok(change) if change.is_recovery() => {
                        tracing::info!("node {} recovered, replaying hints", change.node);
                        drain_hints(&mut store, &membership, &client, &config, Some(change.node)).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!("missed {} membership events, replaying all hints", missed);
                        drain_hints(&mut store, &membership, &client, &config, None).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        if let Err(e) = store.compact() {
            tracing::warn!("hint log compaction failed: {}", e);
        }
        tracing::debug!("hint delivery task stopped");
    });

    (HintHandle { tx }, task)
}

/// Run delivery cycles until a cycle comes in under `max_hints_per_cycle`,
/// so a backlog larger than one cycle is not left for the periodic tick.
pub async fn drain_hints<R: ReplicaClient>(
    store: &mut HintStore,
    membership: &Membership,
    client: &Arc<R>,
    config: &HintDeliveryConfig,
    only: Option<NodeId>,
) -> usize {
    let mut total = 0usize;
    loop {
        let before = store.hint_count();
        let delivered = deliver_hints(store, membership, client, config, only).await;
        total += delivered;
        if delivered < config.max_hints_per_cycle || store.hint_count() >= before {
            return total;
        }
    }
}

/// One delivery cycle: expire stale hints, then replay to reachable targets.
///
/// Every target not known to be `Down` is attempted. A failed delivery stops
/// that target for this cycle so later hints never overtake earlier ones.
pub async fn deliver_hints<R: ReplicaClient>(
    store: &mut HintStore,
    membership: &Membership,
    client: &Arc<R>,
    config: &HintDeliveryConfig,
    only: Option<NodeId>,
) -> usize {
    let m = cirrus_metrics::metrics();
    match store.expire(now_secs()) {
        Ok(0) => {}
        Ok(expired) => {
            m.hints_expired.inc_by(expired as u64);
            tracing::warn!("dropped {} hint(s) past their deadline", expired);
        }
        Err(e) => tracing::warn!("failed to expire hints: {}", e),
    }

    let snapshot = membership.snapshot().await;
    let mut delivered = 0usize;

    for target_id in store.targets() {
        if only.is_some_and(|n| n != target_id) {
            continue;
        }
        if delivered >= config.max_hints_per_cycle {
            break;
        }
        let Some(target) = snapshot.node(&target_id).cloned() else {
            tracing::debug!("hint target {} left the ring, skipping", target_id);
            continue;
        };
        if !target.status.is_alive() {
            continue;
        }

        for hint in store.hints_for(&target_id) {
            if delivered >= config.max_hints_per_cycle {
                break;
            }
            let attempt = client.apply(&target, &hint.mutation, hint.mode);
            match tokio::time::timeout(config.delivery_timeout, attempt).await {
                Ok(Ok(_)) => {
                    if let Err(e) = store.remove(&target_id, hint.id) {
                        tracing::warn!("failed to remove delivered hint: {}", e);
                    }
                    delivered += 1;
                    m.hints_delivered.inc();
                    tracing::debug!("delivered hint {} for {} to {}", hint.id, hint.mutation.partition, target.name);
                }
                Ok(Err(e)) => {
                    m.hint_delivery_failures.inc();
                    tracing::debug!("hint delivery to {} failed: {}, will retry later", target.name, e);
                    break;
                }
                Err(_) => {
                    m.hint_delivery_failures.inc();
                    tracing::debug!("hint delivery to {} timed out, will retry later", target.name);
                    break;
                }
            }
        }
    }

    if delivered > 0 {
        tracing::info!("hint delivery cycle: delivered {} hint(s)", delivered);
    }
    delivered
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
