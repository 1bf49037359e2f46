//! Storage engine: combines WAL + per-partition memtables and segments.
//!
//! All writes go through the WAL first (for durability), then into the
//! partition's memtable. Memtables past the flush threshold are sealed into
//! immutable segments; reads merge segments and memtable on the fly.

use crate::memtable::Memtable;
use crate::partition::{Mutation, PartitionData, PartitionKey, ReadFilter};
use crate::segment::{Segment, SegmentId, SegmentSnapshot};
use crate::wal::{FsyncPolicy, Wal, WalError};
use cirrus_common::{now_micros, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("pending view queue is full ({capacity} batches)")]
    ViewQueueFull { capacity: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub fsync: FsyncPolicy,
    /// Seal a memtable into a segment once it holds this many cells.
    pub flush_threshold: usize,
    /// Maximum number of unreleased view batches.
    pub view_queue_capacity: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            fsync: FsyncPolicy::Batch,
            flush_threshold: 10_000,
            view_queue_capacity: 1024,
        }
    }
}

/// View mutations logged together with the base write that produced them,
/// held until the coordinator confirms they were replicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingViewBatch {
    pub id: u64,
    pub mutations: Vec<Mutation>,
    /// Local time the batch was queued, in microseconds. Replay age is
    /// measured from here, not from the client-supplied write timestamp.
    pub created_at: Timestamp,
}

#[derive(Debug, Serialize, Deserialize)]
enum WalEntry {
    Apply {
        mutations: Vec<Mutation>,
        #[serde(default)]
        views: Option<PendingViewBatch>,
    },
    ReleaseViews {
        batch_id: u64,
    },
}

/// Result of a local read: merged data, tombstones included.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadResult {
    pub data: PartitionData,
    pub tombstones_scanned: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    Swapped,
    /// The partition changed in a way that invalidates the merge; nothing
    /// was replaced.
    Stale,
}

#[derive(Debug, Default)]
struct PartitionState {
    memtable: Memtable,
    segments: Vec<Arc<Segment>>,
}

impl PartitionState {
    fn is_empty(&self) -> bool {
        self.memtable.is_empty() && self.segments.is_empty()
    }
}

/// The storage engine. All operations are synchronous (blocking I/O).
/// The async boundary is at the caller (replica layer).
#[derive(Debug)]
pub struct StorageEngine {
    partitions: BTreeMap<PartitionKey, PartitionState>,
    pending_views: BTreeMap<u64, PendingViewBatch>,
    wal: Wal,
    options: EngineOptions,
    next_segment_id: SegmentId,
    next_batch_id: u64,
}

impl StorageEngine {
    /// Open or create a storage engine at the given directory.
    pub fn open(data_dir: &Path, options: EngineOptions) -> Result<Self, StorageError> {
        std::fs::create_dir_all(data_dir)?;
        let wal_path = data_dir.join("wal.log");

        // Replay WAL to rebuild memtables and the pending view queue
        let entries: Vec<WalEntry> = Wal::replay(&wal_path)?;
        let replayed = entries.len();
        let wal = Wal::open(&wal_path, options.fsync)?;

        let mut engine = Self {
            partitions: BTreeMap::new(),
            pending_views: BTreeMap::new(),
            wal,
            options,
            next_segment_id: 1,
            next_batch_id: 1,
        };

        for entry in entries {
            match entry {
                WalEntry::Apply { mutations, views } => {
                    for mutation in mutations {
                        engine.apply_in_memory(mutation);
                    }
                    if let Some(batch) = views {
                        engine.next_batch_id = engine.next_batch_id.max(batch.id + 1);
                        engine.pending_views.insert(batch.id, batch);
                    }
                }
                WalEntry::ReleaseViews { batch_id } => {
                    engine.pending_views.remove(&batch_id);
                }
            }
        }

        tracing::info!(
            "storage engine opened: {} partitions, {} pending view batches recovered from {} WAL entries at {:?}",
            engine.partitions.len(),
            engine.pending_views.len(),
            replayed,
            engine.wal.path()
        );

        Ok(engine)
    }

    fn apply_in_memory(&mut self, mutation: Mutation) {
        let state = self.partitions.entry(mutation.partition.clone()).or_default();
        state.memtable.apply(mutation.data);
        if state.memtable.len() >= self.options.flush_threshold {
            self.flush(&mutation.partition);
        }
    }

    /// Apply a mutation: writes to WAL first, then the memtable.
    pub fn apply(&mut self, mutation: Mutation) -> Result<(), StorageError> {
        self.wal.append(&WalEntry::Apply {
            mutations: vec![mutation.clone()],
            views: None,
        })?;
        self.apply_in_memory(mutation);
        Ok(())
    }

    /// Apply a base mutation and queue its view mutations in one WAL entry.
    ///
    /// Returns the id of the queued view batch, or `None` when `views` is
    /// empty. Fails without applying anything if the view queue is full.
    /// The entry reaches disk before this returns unless fsync is disabled.
    pub fn apply_batch(
        &mut self,
        mutation: Mutation,
        views: Vec<Mutation>,
    ) -> Result<Option<u64>, StorageError> {
        if views.is_empty() {
            self.apply(mutation)?;
            return Ok(None);
        }
        if self.pending_views.len() >= self.options.view_queue_capacity {
            return Err(StorageError::ViewQueueFull {
                capacity: self.options.view_queue_capacity,
            });
        }

        let batch = PendingViewBatch {
            id: self.next_batch_id,
            mutations: views,
            created_at: now_micros(),
        };
        self.wal.append(&WalEntry::Apply {
            mutations: vec![mutation.clone()],
            views: Some(batch.clone()),
        })?;
        if self.options.fsync == FsyncPolicy::Batch {
            self.wal.sync()?;
        }
        self.next_batch_id += 1;
        self.apply_in_memory(mutation);
        let id = batch.id;
        self.pending_views.insert(id, batch);
        Ok(Some(id))
    }

    /// Drop a view batch once its mutations are replicated.
    /// Returns false if the batch was unknown.
    pub fn release_views(&mut self, batch_id: u64) -> Result<bool, StorageError> {
        if !self.pending_views.contains_key(&batch_id) {
            return Ok(false);
        }
        self.wal.append(&WalEntry::ReleaseViews { batch_id })?;
        self.pending_views.remove(&batch_id);
        Ok(true)
    }

    /// All unreleased view batches, oldest first.
    pub fn pending_views(&self) -> Vec<PendingViewBatch> {
        self.pending_views.values().cloned().collect()
    }

    pub fn pending_view_count(&self) -> usize {
        self.pending_views.len()
    }

    /// Read a partition slice, merging segments and memtable.
    pub fn read(&self, partition: &PartitionKey, filter: &ReadFilter, now_secs: i64) -> ReadResult {
        let Some(state) = self.partitions.get(partition) else {
            return ReadResult::default();
        };
        let mut data = state.memtable.data().slice(filter);
        for segment in &state.segments {
            data.merge(segment.data.slice(filter));
        }
        let tombstones_scanned = data.tombstone_count(now_secs);
        ReadResult {
            data,
            tombstones_scanned,
        }
    }

    /// Seal a partition's memtable into a new segment.
    pub fn flush(&mut self, partition: &PartitionKey) -> Option<SegmentId> {
        let state = self.partitions.get_mut(partition)?;
        if state.memtable.is_empty() {
            return None;
        }
        let id = self.next_segment_id;
        self.next_segment_id += 1;
        let segment = Segment::new(id, state.memtable.take());
        tracing::debug!(
            "flushed {} into segment {} ({} cells)",
            partition,
            id,
            segment.data.cell_count()
        );
        state.segments.push(Arc::new(segment));
        Some(id)
    }

    /// Flush every non-empty memtable. Returns the number of segments created.
    pub fn flush_all(&mut self) -> usize {
        self.partitions()
            .iter()
            .filter_map(|p| self.flush(p))
            .count()
    }

    /// Handles to the partition's current segments, for merging without the
    /// engine lock.
    pub fn segment_snapshot(&self, partition: &PartitionKey) -> Option<SegmentSnapshot> {
        let state = self.partitions.get(partition)?;
        Some(SegmentSnapshot {
            segments: state.segments.clone(),
            memtable_min_timestamp: state.memtable.min_timestamp(),
        })
    }

    /// Atomically replace `replaced` segments with one holding `merged`.
    ///
    /// Refused when any replaced segment is gone, or when data at or below
    /// `max_purged_timestamp` now exists outside the replaced set.
    pub fn replace_segments(
        &mut self,
        partition: &PartitionKey,
        replaced: &[SegmentId],
        merged: PartitionData,
        max_purged_timestamp: Option<Timestamp>,
    ) -> SwapOutcome {
        let Some(state) = self.partitions.get_mut(partition) else {
            return SwapOutcome::Stale;
        };
        if !replaced
            .iter()
            .all(|id| state.segments.iter().any(|s| s.id == *id))
        {
            return SwapOutcome::Stale;
        }
        if let Some(purged) = max_purged_timestamp {
            let outside_min = state
                .segments
                .iter()
                .filter(|s| !replaced.contains(&s.id))
                .map(|s| s.min_timestamp)
                .chain(state.memtable.min_timestamp())
                .min();
            if outside_min.map_or(false, |m| m <= purged) {
                return SwapOutcome::Stale;
            }
        }

        state.segments.retain(|s| !replaced.contains(&s.id));
        if !merged.is_empty() {
            let id = self.next_segment_id;
            self.next_segment_id += 1;
            state.segments.push(Arc::new(Segment::new(id, merged)));
        }
        if state.is_empty() {
            self.partitions.remove(partition);
        }
        SwapOutcome::Swapped
    }

    /// Rewrite the WAL as one entry per partition plus the pending view
    /// queue, making compaction results durable.
    pub fn checkpoint(&mut self) -> Result<(), StorageError> {
        let mut entries = Vec::with_capacity(self.partitions.len() + self.pending_views.len());
        for (key, state) in &self.partitions {
            let mut data = state.memtable.data().clone();
            for segment in &state.segments {
                data.merge(segment.data.clone());
            }
            entries.push(WalEntry::Apply {
                mutations: vec![Mutation::new(key.clone(), data)],
                views: None,
            });
        }
        for batch in self.pending_views.values() {
            entries.push(WalEntry::Apply {
                mutations: Vec::new(),
                views: Some(batch.clone()),
            });
        }
        self.wal.rewrite(&entries)?;
        tracing::debug!("checkpointed WAL with {} entries", entries.len());
        Ok(())
    }

    /// All partitions with data on this node.
    pub fn partitions(&self) -> Vec<PartitionKey> {
        self.partitions.keys().cloned().collect()
    }

    pub fn segment_count(&self, partition: &PartitionKey) -> usize {
        self.partitions
            .get(partition)
            .map_or(0, |s| s.segments.len())
    }

    /// Sync the WAL to disk (for batch fsync mode).
    pub fn sync(&mut self) -> Result<(), StorageError> {
        self.wal.sync()?;
        Ok(())
    }
}

// ────── Tests ──────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{Cell, Deletion};
    use crate::compaction::{compact, PurgePolicy};
    use crate::partition::ClusteringKey;
    use tempfile::TempDir;

    fn options() -> EngineOptions {
        EngineOptions {
            fsync: FsyncPolicy::None,
            flush_threshold: 1_000,
            view_queue_capacity: 2,
        }
    }

    fn pk(key: &str) -> PartitionKey {
        PartitionKey::new("ks", "t", key.as_bytes().to_vec())
    }

    fn put(key: &str, row: &str, value: &str, ts: Timestamp) -> Mutation {
        let mut data = PartitionData::new();
        data.row_mut(ClusteringKey::from(row))
            .set_cell("v", Cell::live(value.as_bytes().to_vec(), ts));
        Mutation::new(pk(key), data)
    }

    fn delete_row(key: &str, row: &str, ts: Timestamp) -> Mutation {
        let mut data = PartitionData::new();
        data.row_mut(ClusteringKey::from(row)).deletion = Some(Deletion::new(ts));
        Mutation::new(pk(key), data)
    }

    fn value(engine: &StorageEngine, key: &str, row: &str) -> Option<Vec<u8>> {
        let result = engine.read(&pk(key), &ReadFilter::all(), 0);
        result
            .data
            .row(&ClusteringKey::from(row))
            .and_then(|r| r.live_value("v", 0))
            .map(|v| v.to_vec())
    }

    #[test]
    fn test_engine_apply_read() {
        let dir = TempDir::new().unwrap();
        let mut engine = StorageEngine::open(dir.path(), options()).unwrap();

        engine.apply(put("k1", "r", "v1", 1)).unwrap();
        assert_eq!(value(&engine, "k1", "r"), Some(b"v1".to_vec()));
        assert_eq!(value(&engine, "k2", "r"), None);
    }

    #[test]
    fn test_engine_crash_recovery() {
        let dir = TempDir::new().unwrap();

        {
            let mut engine = StorageEngine::open(dir.path(), options()).unwrap();
            engine.apply(put("k1", "r", "v1", 1)).unwrap();
            engine.apply(put("k1", "r", "v2", 2)).unwrap();
            engine.apply(put("k2", "r", "x", 1)).unwrap();
            engine.apply(delete_row("k2", "r", 5)).unwrap();
        }
        // Engine dropped (simulating crash)

        let engine = StorageEngine::open(dir.path(), options()).unwrap();
        assert_eq!(engine.partitions().len(), 2);
        assert_eq!(value(&engine, "k1", "r"), Some(b"v2".to_vec()));
        assert_eq!(value(&engine, "k2", "r"), None);
    }

    #[test]
    fn test_read_counts_tombstones() {
        let dir = TempDir::new().unwrap();
        let mut engine = StorageEngine::open(dir.path(), options()).unwrap();
        for i in 0..10 {
            engine.apply(delete_row("k", &format!("r{:02}", i), 10)).unwrap();
        }
        engine.apply(put("k", "live", "v", 11)).unwrap();

        let result = engine.read(&pk("k"), &ReadFilter::all(), 0);
        assert_eq!(result.tombstones_scanned, 10);
        assert_eq!(result.data.live_rows(0).count(), 1);
    }

    #[test]
    fn test_flush_threshold_seals_segments() {
        let dir = TempDir::new().unwrap();
        let mut opts = options();
        opts.flush_threshold = 3;
        let mut engine = StorageEngine::open(dir.path(), opts).unwrap();

        for i in 0..7 {
            engine.apply(put("k", &format!("r{}", i), "v", i)).unwrap();
        }
        assert_eq!(engine.segment_count(&pk("k")), 2);
        assert_eq!(engine.read(&pk("k"), &ReadFilter::all(), 0).data.rows.len(), 7);

        assert_eq!(engine.flush_all(), 1);
        assert_eq!(engine.segment_count(&pk("k")), 3);
    }

    #[test]
    fn test_replace_segments_swaps_merged_data() {
        let dir = TempDir::new().unwrap();
        let mut engine = StorageEngine::open(dir.path(), options()).unwrap();
        engine.apply(put("k", "a", "old", 1_000_000)).unwrap();
        engine.flush(&pk("k"));
        engine.apply(delete_row("k", "a", 2_000_000)).unwrap();
        engine.flush(&pk("k"));

        let snapshot = engine.segment_snapshot(&pk("k")).unwrap();
        assert_eq!(snapshot.segments.len(), 2);
        assert_eq!(snapshot.memtable_min_timestamp, None);

        let policy = PurgePolicy::new(1_000, 10, Timestamp::MAX);
        let out = compact(&snapshot.segments, &policy);
        assert_eq!(out.tombstones_purged, 1);

        let outcome = engine.replace_segments(
            &pk("k"),
            &snapshot.ids(),
            out.data,
            out.max_purged_timestamp,
        );
        assert_eq!(outcome, SwapOutcome::Swapped);
        assert!(engine.partitions().is_empty());
        assert_eq!(engine.read(&pk("k"), &ReadFilter::all(), 0).tombstones_scanned, 0);
    }

    #[test]
    fn test_replace_segments_refuses_stale_merge() {
        let dir = TempDir::new().unwrap();
        let mut engine = StorageEngine::open(dir.path(), options()).unwrap();
        engine.apply(delete_row("k", "a", 2_000_000)).unwrap();
        engine.flush(&pk("k"));
        let snapshot = engine.segment_snapshot(&pk("k")).unwrap();

        // Older data arrives (e.g. a hint) after the snapshot.
        engine.apply(put("k", "a", "late", 1_000_000)).unwrap();

        let outcome = engine.replace_segments(
            &pk("k"),
            &snapshot.ids(),
            PartitionData::new(),
            Some(2_000_000),
        );
        assert_eq!(outcome, SwapOutcome::Stale);
        assert_eq!(engine.segment_count(&pk("k")), 1);
        assert_eq!(value(&engine, "k", "a"), None);

        let missing = engine.replace_segments(&pk("k"), &[999], PartitionData::new(), None);
        assert_eq!(missing, SwapOutcome::Stale);
    }

    #[test]
    fn test_view_batches_persist_until_released() {
        let dir = TempDir::new().unwrap();
        let view = put("vk", "r", "view", 1);

        let id = {
            let mut engine = StorageEngine::open(dir.path(), options()).unwrap();
            let id = engine
                .apply_batch(put("k", "r", "base", 1), vec![view.clone()])
                .unwrap()
                .unwrap();
            let other = engine
                .apply_batch(put("k", "r2", "base", 2), vec![view.clone()])
                .unwrap()
                .unwrap();
            assert!(engine.release_views(other).unwrap());
            id
        };

        let mut engine = StorageEngine::open(dir.path(), options()).unwrap();
        let pending = engine.pending_views();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].mutations, vec![view]);
        assert_eq!(value(&engine, "k", "r"), Some(b"base".to_vec()));

        // New ids never collide with recovered ones.
        let next = engine
            .apply_batch(put("k", "r3", "base", 3), vec![put("vk", "r3", "v", 3)])
            .unwrap()
            .unwrap();
        assert!(next > id + 1);
        assert!(!engine.release_views(12345).unwrap());
    }

    #[test]
    fn test_view_batch_age_uses_local_clock() {
        let dir = TempDir::new().unwrap();
        let mut opts = options();
        opts.fsync = FsyncPolicy::Batch;
        let far_future = now_micros() + 3_600_000_000;

        let before = now_micros();
        {
            let mut engine = StorageEngine::open(dir.path(), opts).unwrap();
            engine
                .apply_batch(
                    put("k", "r", "base", far_future),
                    vec![put("vk", "r", "view", far_future)],
                )
                .unwrap();
            let pending = engine.pending_views();
            assert!(pending[0].created_at >= before);
            assert!(pending[0].created_at <= now_micros());
        }

        // Batch fsync still leaves the queued views recoverable.
        let engine = StorageEngine::open(dir.path(), opts).unwrap();
        assert_eq!(engine.pending_view_count(), 1);
        assert!(engine.pending_views()[0].created_at < far_future);
    }

    #[test]
    fn test_full_view_queue_rejects_whole_write() {
        let dir = TempDir::new().unwrap();
        let mut engine = StorageEngine::open(dir.path(), options()).unwrap();
        let view = put("vk", "r", "view", 1);
        engine.apply_batch(put("k", "a", "1", 1), vec![view.clone()]).unwrap();
        engine.apply_batch(put("k", "b", "1", 1), vec![view.clone()]).unwrap();

        let err = engine
            .apply_batch(put("k", "c", "1", 1), vec![view])
            .unwrap_err();
        assert!(matches!(err, StorageError::ViewQueueFull { capacity: 2 }));
        assert_eq!(value(&engine, "k", "c"), None);

        // Writes without view mutations are unaffected.
        engine.apply_batch(put("k", "d", "1", 1), vec![]).unwrap();
        assert_eq!(value(&engine, "k", "d"), Some(b"1".to_vec()));
    }

    #[test]
    fn test_checkpoint_keeps_state_and_drops_purged() {
        let dir = TempDir::new().unwrap();
        {
            let mut engine = StorageEngine::open(dir.path(), options()).unwrap();
            engine.apply(put("k", "a", "v", 1_000_000)).unwrap();
            engine.apply(delete_row("k", "b", 1_000_000)).unwrap();
            engine
                .apply_batch(put("k", "c", "v", 2), vec![put("vk", "c", "v", 2)])
                .unwrap();
            engine.flush_all();

            let snapshot = engine.segment_snapshot(&pk("k")).unwrap();
            let out = compact(&snapshot.segments, &PurgePolicy::new(1_000, 10, Timestamp::MAX));
            engine.replace_segments(&pk("k"), &snapshot.ids(), out.data, out.max_purged_timestamp);
            engine.checkpoint().unwrap();
        }

        let engine = StorageEngine::open(dir.path(), options()).unwrap();
        let result = engine.read(&pk("k"), &ReadFilter::all(), 0);
        assert_eq!(result.tombstones_scanned, 0);
        assert_eq!(value(&engine, "k", "a"), Some(b"v".to_vec()));
        assert_eq!(value(&engine, "k", "c"), Some(b"v".to_vec()));
        assert_eq!(engine.pending_view_count(), 1);
    }
}
