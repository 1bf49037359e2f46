//! Segment merge and tombstone purge.
//!
//! This is the pure half of compaction: given a set of segments and a purge
//! policy it produces the merged partition. Scheduling, locking and the
//! atomic swap live with the caller.

use crate::partition::PartitionData;
use crate::segment::Segment;
use cirrus_common::Timestamp;
use std::sync::Arc;

/// When a deletion may be physically dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgePolicy {
    /// Deletions that took effect strictly before this second are past grace.
    pub gc_before: i64,
    /// Only deletions with a timestamp strictly below this may go; it is the
    /// oldest timestamp of any data for the partition outside the merge.
    pub max_purgeable_timestamp: Timestamp,
}

impl PurgePolicy {
    pub fn new(now_secs: i64, grace_period_secs: i64, max_purgeable_timestamp: Timestamp) -> Self {
        Self {
            gc_before: now_secs.saturating_sub(grace_period_secs),
            max_purgeable_timestamp,
        }
    }

    /// A policy that never purges; merges only.
    pub fn retain_all() -> Self {
        Self {
            gc_before: i64::MIN,
            max_purgeable_timestamp: Timestamp::MIN,
        }
    }

    pub fn can_purge(&self, deletion_time: i64, timestamp: Timestamp) -> bool {
        deletion_time < self.gc_before && timestamp < self.max_purgeable_timestamp
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompactionOutput {
    pub data: PartitionData,
    pub input_segments: usize,
    pub tombstones_purged: usize,
    /// Newest timestamp among purged deletions. The swap must be refused if
    /// data at or below it appeared outside the merge meanwhile.
    pub max_purged_timestamp: Option<Timestamp>,
}

#[derive(Default)]
struct PurgeTally {
    count: usize,
    max_timestamp: Option<Timestamp>,
}

impl PurgeTally {
    fn record(&mut self, timestamp: Timestamp) {
        self.count += 1;
        self.max_timestamp = Some(self.max_timestamp.map_or(timestamp, |m| m.max(timestamp)));
    }
}

/// Merge segments in ascending timestamp order and purge what the policy
/// allows.
pub fn compact(segments: &[Arc<Segment>], policy: &PurgePolicy) -> CompactionOutput {
    let mut ordered: Vec<&Arc<Segment>> = segments.iter().collect();
    ordered.sort_by_key(|s| (s.min_timestamp, s.id));

    let mut merged = PartitionData::new();
    for segment in ordered {
        merged.merge(segment.data.clone());
    }

    let mut tally = PurgeTally::default();

    if let Some(d) = merged.deletion {
        if policy.can_purge(d.deleted_at, d.timestamp) {
            merged.deletion = None;
            tally.record(d.timestamp);
        }
    }

    merged.rows.retain(|_, row| {
        if let Some(d) = row.deletion {
            if policy.can_purge(d.deleted_at, d.timestamp) {
                row.deletion = None;
                tally.record(d.timestamp);
            }
        }
        if let Some(m) = row.marker {
            if let Some(expired_at) = m.expires_at {
                if policy.can_purge(expired_at, m.timestamp) {
                    row.marker = None;
                    tally.record(m.timestamp);
                }
            }
        }
        row.cells.retain(|_, cell| match cell.deletion_time() {
            Some(dt) if policy.can_purge(dt, cell.timestamp) => {
                tally.record(cell.timestamp);
                false
            }
            _ => true,
        });
        !row.is_empty()
    });

    CompactionOutput {
        data: merged,
        input_segments: segments.len(),
        tombstones_purged: tally.count,
        max_purged_timestamp: tally.max_timestamp,
    }
}

// ────── Tests ──────
