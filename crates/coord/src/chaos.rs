//! Fault injection around a [`ReplicaClient`].
//!
//! [`ChaosReplicaClient`] wraps any `R: ReplicaClient` and fails or delays
//! calls: per-node partitions, a random failure rate and added latency.

use crate::replica_client::{ReplicaClient, ReplicaError, ReplicaRead, WriteAck, WriteMode};
use cirrus_common::NodeId;
use cirrus_ring::NodeEntry;
use cirrus_storage::{Mutation, PartitionKey, ReadFilter};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

#[derive(Debug, Clone)]
pub struct ChaosReplicaConfig {
    /// Probability of returning an error \[0.0, 1.0\].
    pub failure_rate: f64,
    /// Fixed latency injected before forwarding.
    pub latency: Duration,
    /// Random additional latency in \[0, jitter\].
    pub jitter: Duration,
}

impl Default for ChaosReplicaConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

pub struct ChaosReplicaClient<R: ReplicaClient> {
    inner: Arc<R>,
    config: Arc<RwLock<ChaosReplicaConfig>>,
    /// Nodes that are unreachable until recovered.
    partitioned: Arc<RwLock<HashSet<NodeId>>>,
}

impl<R: ReplicaClient> std::fmt::Debug for ChaosReplicaClient<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosReplicaClient").finish_non_exhaustive()
    }
}

impl<R: ReplicaClient> ChaosReplicaClient<R> {
    pub fn new(inner: R, config: ChaosReplicaConfig) -> Self {
        Self::wrap(Arc::new(inner), config)
    }

    /// Wrap a client that is also used directly elsewhere.
    pub fn wrap(inner: Arc<R>, config: ChaosReplicaConfig) -> Self {
        Self {
            inner,
            config: Arc::new(RwLock::new(config)),
            partitioned: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn inner(&self) -> &Arc<R> {
        &self.inner
    }

    /// Make a node unreachable.
    pub async fn fail_node(&self, node: NodeId) {
        self.partitioned.write().await.insert(node);
    }

    pub async fn recover_node(&self, node: NodeId) {
        self.partitioned.write().await.remove(&node);
    }

    pub async fn set_failure_rate(&self, rate: f64) {
        self.config.write().await.failure_rate = rate;
    }

    pub async fn set_latency(&self, latency: Duration) {
        self.config.write().await.latency = latency;
    }

    async fn maybe_fail(&self, target: &NodeEntry) -> Result<(), ReplicaError> {
        if self.partitioned.read().await.contains(&target.id) {
            return Err(ReplicaError::RpcFailed(format!(
                "chaos: {} is partitioned",
                target.name
            )));
        }

        let (delay, failure_rate) = {
            let config = self.config.read().await;
            let jitter_ms = if config.jitter.is_zero() {
                0
            } else {
                rand::thread_rng().gen_range(0..=config.jitter.as_millis() as u64)
            };
            (
                config.latency + Duration::from_millis(jitter_ms),
                config.failure_rate,
            )
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if failure_rate > 0.0 && rand::thread_rng().gen_bool(failure_rate.min(1.0)) {
            return Err(ReplicaError::RpcFailed("chaos: random failure".into()));
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl<R: ReplicaClient> ReplicaClient for ChaosReplicaClient<R> {
    async fn apply(
        &self,
        target: &NodeEntry,
        mutation: &Mutation,
        mode: WriteMode,
    ) -> Result<WriteAck, ReplicaError> {
        self.maybe_fail(target).await?;
        self.inner.apply(target, mutation, mode).await
    }

    async fn read(
        &self,
        target: &NodeEntry,
        partition: &PartitionKey,
        filter: &ReadFilter,
    ) -> Result<ReplicaRead, ReplicaError> {
        self.maybe_fail(target).await?;
        self.inner.read(target, partition, filter).await
    }

    async fn release_views(&self, target: &NodeEntry, batch_id: u64) -> Result<(), ReplicaError> {
        self.maybe_fail(target).await?;
        self.inner.release_views(target, batch_id).await
    }
}

// ────── Tests ──────

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_storage::PartitionData;

    struct OkReplicaClient;

    #[async_trait::async_trait]
    impl ReplicaClient for OkReplicaClient {
        async fn apply(
            &self,
            _target: &NodeEntry,
            _mutation: &Mutation,
            _mode: WriteMode,
        ) -> Result<WriteAck, ReplicaError> {
            Ok(WriteAck::default())
        }

        async fn read(
            &self,
            _target: &NodeEntry,
            _partition: &PartitionKey,
            _filter: &ReadFilter,
        ) -> Result<ReplicaRead, ReplicaError> {
            Ok(ReplicaRead::default())
        }

        async fn release_views(&self, _target: &NodeEntry, _batch_id: u64) -> Result<(), ReplicaError> {
            Ok(())
        }
    }

    fn mutation() -> Mutation {
        Mutation::new(PartitionKey::new("ks", "t", b"k".to_vec()), PartitionData::new())
    }

    fn target(name: &str) -> NodeEntry {
        NodeEntry::new(name, "dc1", "r1", 1)
    }

    #[tokio::test]
    async fn test_chaos_replica_passthrough() {
        let chaos = ChaosReplicaClient::new(OkReplicaClient, ChaosReplicaConfig::default());
        let t = target("node1");
        let m = mutation();
        assert!(chaos.apply(&t, &m, WriteMode::Base).await.is_ok());
        assert!(chaos.read(&t, &m.partition, &ReadFilter::all()).await.is_ok());
        assert!(chaos.release_views(&t, 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_chaos_replica_fail_and_recover_node() {
        let chaos = ChaosReplicaClient::new(OkReplicaClient, ChaosReplicaConfig::default());
        let t = target("node1");
        let m = mutation();

        chaos.fail_node(t.id).await;
        let err = chaos.apply(&t, &m, WriteMode::Base).await.unwrap_err();
        assert!(err.is_unreachable());
        assert!(chaos.read(&t, &m.partition, &ReadFilter::all()).await.is_err());

        // Other nodes still work
        assert!(chaos.apply(&target("node2"), &m, WriteMode::Base).await.is_ok());

        chaos.recover_node(t.id).await;
        assert!(chaos.apply(&t, &m, WriteMode::Base).await.is_ok());
    }

    #[tokio::test]
    async fn test_chaos_replica_random_failure() {
        let config = ChaosReplicaConfig {
            failure_rate: 1.0,
            ..Default::default()
        };
        let chaos = ChaosReplicaClient::new(OkReplicaClient, config);
        let t = target("node1");
        let m = mutation();

        for _ in 0..10 {
            assert!(chaos.apply(&t, &m, WriteMode::Plain).await.is_err());
        }

        chaos.set_failure_rate(0.0).await;
        assert!(chaos.apply(&t, &m, WriteMode::Plain).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_chaos_replica_latency() {
        let config = ChaosReplicaConfig {
            latency: Duration::from_millis(200),
            ..Default::default()
        };
        let chaos = ChaosReplicaClient::new(OkReplicaClient, config);
        let start = tokio::time::Instant::now();
        chaos.apply(&target("node1"), &mutation(), WriteMode::Plain).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
