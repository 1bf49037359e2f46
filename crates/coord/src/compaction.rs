//! Scheduled compaction of a node's storage engine.
//!
//! Per partition the memtable is sealed, the segments are snapshotted under
//! the lock, merged and purged without it, then swapped in atomically. A
//! swap that raced with new data at or below a purged timestamp is refused
//! and retried on the next run.

use cirrus_common::{now_secs, Timestamp};
use cirrus_storage::{compact, PurgePolicy, StorageEngine, StorageError, SwapOutcome};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, Duration};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub partitions_compacted: usize,
    pub stale_swaps: usize,
    pub tombstones_purged: usize,
}

/// Compact every partition of `storage` once.
pub async fn compact_node(
    storage: &Arc<RwLock<StorageEngine>>,
    grace_period_secs: i64,
    now_secs: i64,
) -> Result<CompactionReport, StorageError> {
    let m = cirrus_metrics::metrics();
    let mut report = CompactionReport::default();
    let partitions = storage.read().await.partitions();

    for partition in partitions {
        let snapshot = {
            let mut engine = storage.write().await;
            engine.flush(&partition);
            engine.segment_snapshot(&partition)
        };
        let Some(snapshot) = snapshot else { continue };

        let max_purgeable = snapshot.memtable_min_timestamp.unwrap_or(Timestamp::MAX);
        let policy = PurgePolicy::new(now_secs, grace_period_secs, max_purgeable);
        let output = compact(&snapshot.segments, &policy);
        if output.input_segments <= 1 && output.tombstones_purged == 0 {
            continue;
        }

        let outcome = storage.write().await.replace_segments(
            &partition,
            &snapshot.ids(),
            output.data,
            output.max_purged_timestamp,
        );
        match outcome {
            SwapOutcome::Swapped => {
                m.compactions.inc();
                m.tombstones_purged.inc_by(output.tombstones_purged as u64);
                report.partitions_compacted += 1;
                report.tombstones_purged += output.tombstones_purged;
                tracing::debug!(
                    "compacted {} segment(s) of {}, purged {} tombstone(s)",
                    output.input_segments,
                    partition,
                    output.tombstones_purged
                );
            }
            SwapOutcome::Stale => {
                m.compactions_stale.inc();
                report.stale_swaps += 1;
                tracing::debug!("compaction of {} raced with a write, will retry", partition);
            }
        }
    }

    // Any swap leaves the WAL holding data the segments no longer need.
    if report.partitions_compacted > 0 {
        storage.write().await.checkpoint()?;
    }
    Ok(report)
}

/// Run [`compact_node`] every `every` until `shutdown` flips to true, then
/// sync the WAL so writes under batch fsync reach disk at least once a tick.
pub fn spawn_compaction_task(
    storage: Arc<RwLock<StorageEngine>>,
    every: Duration,
    grace_period_secs: i64,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(every);
        // The first tick completes immediately.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match compact_node(&storage, grace_period_secs, now_secs()).await {
                        Ok(report) if report.partitions_compacted > 0 => {
                            tracing::info!(
                                "compaction: {} partition(s), {} tombstone(s) purged",
                                report.partitions_compacted,
                                report.tombstones_purged
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!("compaction failed: {}", e),
                    }
                    if let Err(e) = storage.write().await.sync() {
                        tracing::warn!("WAL sync failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("compaction task stopped");
    })
}

// ────── Tests ──────
