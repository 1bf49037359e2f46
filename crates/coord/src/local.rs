//! In-process transport: every replica lives in the same process.

use crate::replica::LocalReplica;
use crate::replica_client::{ReplicaClient, ReplicaError, ReplicaRead, WriteAck, WriteMode};
use cirrus_common::NodeId;
use cirrus_ring::NodeEntry;
use cirrus_storage::{Mutation, PartitionKey, ReadFilter};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Routes replica calls to registered [`LocalReplica`]s by node id.
#[derive(Debug, Clone, Default)]
pub struct InProcessReplicaClient {
    replicas: Arc<RwLock<HashMap<NodeId, Arc<LocalReplica>>>>,
}

impl InProcessReplicaClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, node: NodeId, replica: Arc<LocalReplica>) {
        self.replicas.write().await.insert(node, replica);
    }

    pub async fn unregister(&self, node: &NodeId) -> Option<Arc<LocalReplica>> {
        self.replicas.write().await.remove(node)
    }

    pub async fn replica(&self, node: &NodeId) -> Option<Arc<LocalReplica>> {
        self.replicas.read().await.get(node).cloned()
    }

    async fn lookup(&self, target: &NodeEntry) -> Result<Arc<LocalReplica>, ReplicaError> {
        self.replica(&target.id)
            .await
            .ok_or(ReplicaError::UnknownNode(target.id))
    }
}

#[async_trait::async_trait]
impl ReplicaClient for InProcessReplicaClient {
    async fn apply(
        &self,
        target: &NodeEntry,
        mutation: &Mutation,
        mode: WriteMode,
    ) -> Result<WriteAck, ReplicaError> {
        self.lookup(target).await?.apply(mutation.clone(), mode).await
    }

    async fn read(
        &self,
        target: &NodeEntry,
        partition: &PartitionKey,
        filter: &ReadFilter,
    ) -> Result<ReplicaRead, ReplicaError> {
        self.lookup(target).await?.read(partition, filter).await
    }

    async fn release_views(&self, target: &NodeEntry, batch_id: u64) -> Result<(), ReplicaError> {
        self.lookup(target).await?.release_views(batch_id).await
    }
}
