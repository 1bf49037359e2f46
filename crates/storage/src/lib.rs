//! Storage engine for cirrus: WAL + per-partition memtables and segments.
//!
//! Partitions hold rows keyed by clustering key; rows hold timestamped cells.
//! The WAL provides durability, memtables absorb writes and are sealed into
//! immutable segments that the compactor merges and purges.

pub mod cell;
pub mod compaction;
pub mod engine;
pub mod memtable;
pub mod partition;
pub mod segment;
pub mod wal;

pub use cell::{compare_cells, reconcile, Cell, CellValue, Deletion, RowMarker};
pub use compaction::{compact, CompactionOutput, PurgePolicy};
pub use engine::{
    EngineOptions, PendingViewBatch, ReadResult, StorageEngine, StorageError, SwapOutcome,
};
pub use partition::{
    compose, ClusteringKey, ClusteringRange, KeyTooLong, Mutation, PartitionData, PartitionKey,
    ReadFilter, Row,
};
pub use segment::{Segment, SegmentId, SegmentSnapshot};
pub use wal::{FsyncPolicy, Wal, WalError};
