//! Read reconciliation and read repair.
//!
//! Replica responses are merged cell by cell (last write wins, tombstones
//! win ties) and every replica that lacks part of the merged result is sent
//! exactly the part it lacks.

use crate::replica::LocalReplica;
use crate::replica_client::{ReplicaClient, WriteMode};
use cirrus_common::NodeId;
use cirrus_ring::NodeEntry;
use cirrus_storage::{Mutation, PartitionData, PartitionKey};
use std::sync::Arc;

/// One replica's answer to a read.
#[derive(Debug, Clone)]
pub struct ReplicaResponse {
    pub node: NodeEntry,
    pub data: PartitionData,
}

/// Merge all responses into the newest view of the slice.
pub fn resolve(responses: &[ReplicaResponse]) -> PartitionData {
    let mut resolved = PartitionData::new();
    for response in responses {
        resolved.merge(response.data.clone());
    }
    resolved
}

/// Per-replica repair mutations: what each response lacks against `resolved`.
pub fn repairs(
    responses: &[ReplicaResponse],
    resolved: &PartitionData,
) -> Vec<(NodeEntry, PartitionData)> {
    responses
        .iter()
        .filter_map(|r| r.data.diff(resolved).map(|d| (r.node.clone(), d)))
        .collect()
}

/// Send repair mutations in the background.
///
/// Repairs never block the read that found them; failures are logged and
/// counted. The handle resolves to the number of successful repair writes.
pub fn spawn_read_repair<R: ReplicaClient>(
    client: Arc<R>,
    local: Arc<LocalReplica>,
    local_id: NodeId,
    partition: PartitionKey,
    repairs: Vec<(NodeEntry, PartitionData)>,
) -> tokio::task::JoinHandle<usize> {
    let m = cirrus_metrics::metrics();
    if !repairs.is_empty() {
        m.read_repairs.inc();
    }
    tokio::spawn(async move {
        let mut repaired = 0usize;
        for (node, data) in repairs {
            let mutation = Mutation::new(partition.clone(), data);
            let result = if node.id == local_id {
                local.apply(mutation, WriteMode::Plain).await
            } else {
                client.apply(&node, &mutation, WriteMode::Plain).await
            };
            match result {
                Ok(_) => {
                    repaired += 1;
                    cirrus_metrics::metrics().repair_writes.inc();
                    tracing::debug!("repaired {} on {}", partition, node.name);
                }
                Err(e) => {
                    cirrus_metrics::metrics().repair_failures.inc();
                    tracing::warn!("read repair of {} on {} failed: {}", partition, node.name, e);
                }
            }
        }
        repaired
    })
}
