//! In-memory table absorbing writes for one partition.
//!
//! Writes merge into a single `PartitionData`; once it grows past the flush
//! threshold the engine seals it into an immutable segment.

use crate::partition::PartitionData;
use cirrus_common::Timestamp;

#[derive(Debug, Default)]
pub struct Memtable {
    data: PartitionData,
    min_timestamp: Option<Timestamp>,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an update into the table.
    pub fn apply(&mut self, update: PartitionData) {
        if let Some(ts) = update.min_timestamp() {
            self.min_timestamp = Some(self.min_timestamp.map_or(ts, |m| m.min(ts)));
        }
        self.data.merge(update);
    }

    pub fn data(&self) -> &PartitionData {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Cells, markers and deletions held.
    pub fn len(&self) -> usize {
        self.data.cell_count()
    }

    /// Smallest timestamp ever merged in since the last flush.
    ///
    /// Tracked on the way in, so data shadowed and dropped during the merge
    /// still counts; compaction treats it as possibly live elsewhere.
    pub fn min_timestamp(&self) -> Option<Timestamp> {
        self.min_timestamp
    }

    /// Take the contents, leaving the table empty.
    pub fn take(&mut self) -> PartitionData {
        self.min_timestamp = None;
        std::mem::take(&mut self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Cell;
    use crate::partition::ClusteringKey;

    fn update(ts: Timestamp) -> PartitionData {
        let mut p = PartitionData::new();
        p.row_mut(ClusteringKey::EMPTY)
            .set_cell("v", Cell::live(ts.to_string().into_bytes(), ts));
        p
    }

    #[test]
    fn test_memtable_apply_and_take() {
        let mut mt = Memtable::new();
        assert!(mt.is_empty());

        mt.apply(update(20));
        mt.apply(update(10));
        assert_eq!(mt.len(), 1);
        assert_eq!(mt.min_timestamp(), Some(10));

        let data = mt.take();
        assert_eq!(
            data.row(&ClusteringKey::EMPTY).unwrap().live_value("v", 0),
            Some(&b"20"[..])
        );
        assert!(mt.is_empty());
        assert_eq!(mt.min_timestamp(), None);
    }
}
