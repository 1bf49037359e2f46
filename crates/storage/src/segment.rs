//! Immutable, sealed partition segments.

use crate::partition::PartitionData;
use cirrus_common::Timestamp;
use std::sync::Arc;

pub type SegmentId = u64;

/// A sealed memtable or the output of a compaction. Never mutated once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub id: SegmentId,
    pub data: PartitionData,
    /// Smallest timestamp of anything in the segment, `i64::MAX` when empty.
    pub min_timestamp: Timestamp,
    pub max_timestamp: Timestamp,
}

impl Segment {
    pub fn new(id: SegmentId, data: PartitionData) -> Self {
        let min_timestamp = data.min_timestamp().unwrap_or(Timestamp::MAX);
        let max_timestamp = data.max_timestamp().unwrap_or(Timestamp::MIN);
        Self {
            id,
            data,
            min_timestamp,
            max_timestamp,
        }
    }
}

/// Point-in-time view of one partition's segments, taken under the storage
/// lock and consumed without it.
#[derive(Debug, Clone)]
pub struct SegmentSnapshot {
    pub segments: Vec<Arc<Segment>>,
    /// Smallest timestamp still in the memtable, if it holds anything.
    pub memtable_min_timestamp: Option<Timestamp>,
}

impl SegmentSnapshot {
    pub fn ids(&self) -> Vec<SegmentId> {
        self.segments.iter().map(|s| s.id).collect()
    }
}
