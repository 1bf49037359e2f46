//! Abstraction over coordinator-to-replica calls.
//!
//! Transport is outside this crate; [`crate::local::InProcessReplicaClient`]
//! dispatches straight to each node's [`crate::replica::LocalReplica`].

use cirrus_common::NodeId;
use cirrus_ring::NodeEntry;
use cirrus_storage::{Mutation, PartitionData, PartitionKey, ReadFilter, StorageError};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error("RPC failed: {0}")]
    RpcFailed(String),
    #[error("timeout")]
    Timeout,
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("pending view queue is full ({capacity} batches)")]
    ViewQueueFull { capacity: usize },
    #[error("scanned {scanned} tombstones, over the limit of {threshold}")]
    TombstoneOverflow { scanned: usize, threshold: usize },
}

impl ReplicaError {
    /// The replica could not be reached, as opposed to refusing the request.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            ReplicaError::RpcFailed(_) | ReplicaError::Timeout | ReplicaError::UnknownNode(_)
        )
    }
}

impl From<StorageError> for ReplicaError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::ViewQueueFull { capacity } => ReplicaError::ViewQueueFull { capacity },
            other => ReplicaError::Storage(other.to_string()),
        }
    }
}

/// How a replica applies a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WriteMode {
    /// A client write to a base table: derive and queue view mutations.
    Base,
    /// Apply as-is: view rows and repairs.
    #[default]
    Plain,
}

/// View mutations a replica queued alongside a base write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewBatch {
    pub id: u64,
    pub mutations: Vec<Mutation>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteAck {
    pub view_batch: Option<ViewBatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaRead {
    pub data: PartitionData,
    pub tombstones_scanned: usize,
}

/// Transport for replica calls.
#[async_trait::async_trait]
pub trait ReplicaClient: Send + Sync + 'static {
    /// Apply a mutation on a replica.
    async fn apply(
        &self,
        target: &NodeEntry,
        mutation: &Mutation,
        mode: WriteMode,
    ) -> Result<WriteAck, ReplicaError>;

    /// Read a partition slice from a replica, tombstones included.
    async fn read(
        &self,
        target: &NodeEntry,
        partition: &PartitionKey,
        filter: &ReadFilter,
    ) -> Result<ReplicaRead, ReplicaError>;

    /// Tell a replica its queued view batch has been replicated.
    async fn release_views(&self, target: &NodeEntry, batch_id: u64) -> Result<(), ReplicaError>;
}
