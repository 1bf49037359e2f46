//! Replica-side request handling over a node's storage engine.

use crate::replica_client::{ReplicaError, ReplicaRead, ViewBatch, WriteAck, WriteMode};
use crate::schema::Schema;
use crate::views;
use cirrus_common::now_secs;
use cirrus_storage::{Mutation, PartitionData, PartitionKey, ReadFilter, StorageEngine};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Tombstone scan limits per read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TombstoneThresholds {
    pub warn: usize,
    pub fail: usize,
}

impl Default for TombstoneThresholds {
    fn default() -> Self {
        Self {
            warn: 1_000,
            fail: 100_000,
        }
    }
}

impl From<&cirrus_config::TombstoneConfig> for TombstoneThresholds {
    fn from(c: &cirrus_config::TombstoneConfig) -> Self {
        Self {
            warn: c.warn_threshold,
            fail: c.fail_threshold,
        }
    }
}

/// One node's replica: applies writes, derives view updates, serves reads.
#[derive(Debug)]
pub struct LocalReplica {
    storage: Arc<RwLock<StorageEngine>>,
    schema: Arc<Schema>,
    thresholds: TombstoneThresholds,
}

impl LocalReplica {
    pub fn new(
        storage: Arc<RwLock<StorageEngine>>,
        schema: Arc<Schema>,
        thresholds: TombstoneThresholds,
    ) -> Self {
        Self {
            storage,
            schema,
            thresholds,
        }
    }

    pub fn storage(&self) -> &Arc<RwLock<StorageEngine>> {
        &self.storage
    }

    pub fn thresholds(&self) -> TombstoneThresholds {
        self.thresholds
    }

    /// Apply a mutation.
    ///
    /// Base writes read the rows they touch under the write lock, derive the
    /// view mutations and log both in one WAL entry. A full view queue
    /// rejects the write without applying it.
    pub async fn apply(&self, mutation: Mutation, mode: WriteMode) -> Result<WriteAck, ReplicaError> {
        let views = match mode {
            WriteMode::Base => self
                .schema
                .views_for(&mutation.partition.keyspace, &mutation.partition.table),
            WriteMode::Plain => Vec::new(),
        };

        let mut engine = self.storage.write().await;
        if views.is_empty() {
            engine.apply(mutation)?;
            return Ok(WriteAck::default());
        }

        let now = now_secs();
        let before = read_affected(&engine, &mutation.partition, &mutation.data, now);
        let view_mutations = views::derive(&views, &mutation.partition, &before, &mutation.data, now);
        let batch_id = engine.apply_batch(mutation, view_mutations.clone())?;

        Ok(WriteAck {
            view_batch: batch_id.map(|id| ViewBatch {
                id,
                mutations: view_mutations,
            }),
        })
    }

    /// Read a slice, enforcing the tombstone fail threshold.
    pub async fn read(
        &self,
        partition: &PartitionKey,
        filter: &ReadFilter,
    ) -> Result<ReplicaRead, ReplicaError> {
        let result = self.storage.read().await.read(partition, filter, now_secs());
        cirrus_metrics::metrics()
            .tombstones_scanned
            .observe(result.tombstones_scanned as f64);

        if result.tombstones_scanned > self.thresholds.fail {
            cirrus_metrics::metrics().tombstone_failures.inc();
            tracing::warn!(
                "read of {} scanned {} tombstones (fail threshold {})",
                partition,
                result.tombstones_scanned,
                self.thresholds.fail
            );
            return Err(ReplicaError::TombstoneOverflow {
                scanned: result.tombstones_scanned,
                threshold: self.thresholds.fail,
            });
        }

        Ok(ReplicaRead {
            data: result.data,
            tombstones_scanned: result.tombstones_scanned,
        })
    }

    pub async fn release_views(&self, batch_id: u64) -> Result<(), ReplicaError> {
        let released = self.storage.write().await.release_views(batch_id)?;
        if !released {
            tracing::debug!("view batch {} was already released", batch_id);
        }
        Ok(())
    }
}

/// Current state of the rows an update touches.
fn read_affected(
    engine: &StorageEngine,
    partition: &PartitionKey,
    update: &PartitionData,
    now_secs: i64,
) -> PartitionData {
    if update.deletion.is_some() {
        return engine.read(partition, &ReadFilter::all(), now_secs).data;
    }
    let mut before = PartitionData::new();
    for key in update.rows.keys() {
        before.merge(engine.read(partition, &ReadFilter::row(key.clone()), now_secs).data);
    }
    before
}

// ────── Tests ──────
