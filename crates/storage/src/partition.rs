//! Partitions, rows and mutations.
//!
//! `PartitionData` is used both for stored state and for updates: applying
//! a mutation is a merge, and merging is commutative, associative and
//! idempotent, so replicas converge regardless of delivery order.

use crate::cell::{Cell, Deletion, RowMarker};
use cirrus_common::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Bound;

/// Identifies a partition: keyspace, table and the serialized partition key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub keyspace: String,
    pub table: String,
    pub key: Vec<u8>,
}

impl PartitionKey {
    pub fn new(keyspace: impl Into<String>, table: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            keyspace: keyspace.into(),
            table: table.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}[{}]",
            self.keyspace,
            self.table,
            String::from_utf8_lossy(&self.key)
        )
    }
}

/// Serialized clustering key. Rows sort by these bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusteringKey(pub Vec<u8>);

impl ClusteringKey {
    /// The key of the single row in a table without clustering columns.
    pub const EMPTY: ClusteringKey = ClusteringKey(Vec::new());

    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for ClusteringKey {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for ClusteringKey {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

/// Encode several key components into one key.
///
/// A single component is kept as-is. Multiple components are each written as
/// a big-endian u16 length, the bytes, and a zero end-of-component byte, so
/// a component longer than `u16::MAX` bytes cannot be encoded.
pub fn compose(parts: &[Vec<u8>]) -> Result<Vec<u8>, KeyTooLong> {
    if let [single] = parts {
        return Ok(single.clone());
    }
    let mut out = Vec::with_capacity(parts.iter().map(|p| p.len() + 3).sum());
    for part in parts {
        let len = u16::try_from(part.len()).map_err(|_| KeyTooLong { len: part.len() })?;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(part);
        out.push(0);
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("key component of {len} bytes exceeds the 65535 byte limit")]
pub struct KeyTooLong {
    pub len: usize,
}

/// Inclusive clustering slice. Missing bounds are open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusteringRange {
    pub start: Option<ClusteringKey>,
    pub end: Option<ClusteringKey>,
}

impl ClusteringRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn single(key: ClusteringKey) -> Self {
        Self {
            start: Some(key.clone()),
            end: Some(key),
        }
    }

    pub fn contains(&self, key: &ClusteringKey) -> bool {
        self.start.as_ref().map_or(true, |s| key >= s) && self.end.as_ref().map_or(true, |e| key <= e)
    }

    fn is_inverted(&self) -> bool {
        matches!((&self.start, &self.end), (Some(s), Some(e)) if s > e)
    }

    fn bounds(&self) -> (Bound<&ClusteringKey>, Bound<&ClusteringKey>) {
        (
            self.start.as_ref().map_or(Bound::Unbounded, Bound::Included),
            self.end.as_ref().map_or(Bound::Unbounded, Bound::Included),
        )
    }
}

/// Which rows and columns a read wants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadFilter {
    #[serde(default)]
    pub range: ClusteringRange,
    /// `None` selects every column.
    #[serde(default)]
    pub columns: Option<BTreeSet<String>>,
}

impl ReadFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn row(key: ClusteringKey) -> Self {
        Self {
            range: ClusteringRange::single(key),
            columns: None,
        }
    }
}

/// One row: a marker, an optional row deletion and a set of cells.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<RowMarker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion: Option<Deletion>,
    #[serde(default)]
    pub cells: BTreeMap<String, Cell>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a cell, keeping the winning version if one is present.
    pub fn set_cell(&mut self, column: impl Into<String>, cell: Cell) {
        match self.cells.entry(column.into()) {
            Entry::Vacant(e) => {
                e.insert(cell);
            }
            Entry::Occupied(mut e) => {
                if crate::cell::compare_cells(&cell, e.get()).is_gt() {
                    e.insert(cell);
                }
            }
        }
    }

    pub fn merge(&mut self, other: Row) {
        self.marker = RowMarker::supersede(self.marker, other.marker);
        self.deletion = Deletion::supersede(self.deletion, other.deletion);
        for (column, cell) in other.cells {
            self.set_cell(column, cell);
        }
        self.purge_shadowed(None);
    }

    /// Drop everything covered by the row deletion or an enclosing partition
    /// deletion.
    pub(crate) fn purge_shadowed(&mut self, partition_deletion: Option<Deletion>) {
        if let (Some(pd), Some(rd)) = (partition_deletion, self.deletion) {
            if pd.shadows(rd.timestamp) {
                self.deletion = None;
            }
        }
        let Some(effective) = Deletion::supersede(self.deletion, partition_deletion) else {
            return;
        };
        self.cells.retain(|_, c| !effective.shadows(c.timestamp));
        if self.marker.map_or(false, |m| effective.shadows(m.timestamp)) {
            self.marker = None;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.marker.is_none() && self.deletion.is_none() && self.cells.is_empty()
    }

    /// A row exists if its marker or any cell is live.
    pub fn is_live(&self, now_secs: i64) -> bool {
        self.marker.map_or(false, |m| m.is_live(now_secs))
            || self.cells.values().any(|c| c.is_live(now_secs))
    }

    /// Stricter than [`Row::is_live`]: only the marker counts. View rows use
    /// this, since a view row can keep cells newer than the delete that
    /// removed it from its key.
    pub fn has_live_marker(&self, now_secs: i64) -> bool {
        self.marker.map_or(false, |m| m.is_live(now_secs))
    }

    pub fn live_value(&self, column: &str, now_secs: i64) -> Option<&[u8]> {
        self.cells.get(column).and_then(|c| c.live_value(now_secs))
    }

    /// Tombstones a reader has to step over in this row.
    pub fn tombstone_count(&self, now_secs: i64) -> usize {
        let row_deletion = usize::from(self.deletion.is_some());
        let dead_marker = usize::from(self.marker.map_or(false, |m| !m.is_live(now_secs)));
        let dead_cells = self.cells.values().filter(|c| c.is_dead(now_secs)).count();
        row_deletion + dead_marker + dead_cells
    }

    fn timestamps(&self) -> impl Iterator<Item = Timestamp> + '_ {
        self.marker
            .map(|m| m.timestamp)
            .into_iter()
            .chain(self.deletion.map(|d| d.timestamp))
            .chain(self.cells.values().map(|c| c.timestamp))
    }

    fn project(&self, columns: Option<&BTreeSet<String>>) -> Row {
        match columns {
            None => self.clone(),
            Some(cols) => Row {
                marker: self.marker,
                deletion: self.deletion,
                cells: self
                    .cells
                    .iter()
                    .filter(|(name, _)| cols.contains(*name))
                    .map(|(name, cell)| (name.clone(), cell.clone()))
                    .collect(),
            },
        }
    }

    /// What this row lacks compared to `resolved`.
    fn diff(&self, resolved: &Row) -> Option<Row> {
        let mut out = Row::new();
        if resolved.marker != self.marker {
            out.marker = resolved.marker;
        }
        if resolved.deletion != self.deletion {
            out.deletion = resolved.deletion;
        }
        for (column, cell) in &resolved.cells {
            if self.cells.get(column) != Some(cell) {
                out.cells.insert(column.clone(), cell.clone());
            }
        }
        (!out.is_empty()).then_some(out)
    }
}

/// Rows keyed by clustering key plus an optional partition deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion: Option<Deletion>,
    #[serde(default, with = "rows_as_pairs")]
    pub rows: BTreeMap<ClusteringKey, Row>,
}

impl PartitionData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deleted(timestamp: Timestamp) -> Self {
        Self {
            deletion: Some(Deletion::new(timestamp)),
            rows: BTreeMap::new(),
        }
    }

    pub fn row_mut(&mut self, key: ClusteringKey) -> &mut Row {
        self.rows.entry(key).or_default()
    }

    pub fn row(&self, key: &ClusteringKey) -> Option<&Row> {
        self.rows.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.deletion.is_none() && self.rows.is_empty()
    }

    /// Merge `other` into `self`, then drop anything shadowed.
    pub fn merge(&mut self, other: PartitionData) {
        self.deletion = Deletion::supersede(self.deletion, other.deletion);
        for (key, row) in other.rows {
            match self.rows.entry(key) {
                Entry::Vacant(e) => {
                    e.insert(row);
                }
                Entry::Occupied(mut e) => e.get_mut().merge(row),
            }
        }
        self.purge_shadowed();
    }

    fn purge_shadowed(&mut self) {
        let deletion = self.deletion;
        self.rows.retain(|_, row| {
            row.purge_shadowed(deletion);
            !row.is_empty()
        });
    }

    /// Restrict to the rows and columns a filter selects.
    pub fn slice(&self, filter: &ReadFilter) -> PartitionData {
        let mut rows = BTreeMap::new();
        if !filter.range.is_inverted() {
            for (key, row) in self.rows.range::<ClusteringKey, _>(filter.range.bounds()) {
                let projected = row.project(filter.columns.as_ref());
                if !projected.is_empty() {
                    rows.insert(key.clone(), projected);
                }
            }
        }
        PartitionData {
            deletion: self.deletion,
            rows,
        }
    }

    pub fn live_rows(&self, now_secs: i64) -> impl Iterator<Item = (&ClusteringKey, &Row)> {
        self.rows.iter().filter(move |(_, row)| row.is_live(now_secs))
    }

    /// Rows whose marker is live.
    pub fn marked_rows(&self, now_secs: i64) -> impl Iterator<Item = (&ClusteringKey, &Row)> {
        self.rows
            .iter()
            .filter(move |(_, row)| row.has_live_marker(now_secs))
    }

    pub fn tombstone_count(&self, now_secs: i64) -> usize {
        usize::from(self.deletion.is_some())
            + self
                .rows
                .values()
                .map(|r| r.tombstone_count(now_secs))
                .sum::<usize>()
    }

    /// Cells, markers and deletions held; drives memtable flushing.
    pub fn cell_count(&self) -> usize {
        usize::from(self.deletion.is_some())
            + self
                .rows
                .values()
                .map(|r| r.cells.len() + usize::from(r.marker.is_some()) + usize::from(r.deletion.is_some()))
                .sum::<usize>()
    }

    fn timestamps(&self) -> impl Iterator<Item = Timestamp> + '_ {
        self.deletion
            .map(|d| d.timestamp)
            .into_iter()
            .chain(self.rows.values().flat_map(|r| r.timestamps()))
    }

    pub fn min_timestamp(&self) -> Option<Timestamp> {
        self.timestamps().min()
    }

    pub fn max_timestamp(&self) -> Option<Timestamp> {
        self.timestamps().max()
    }

    /// What this copy lacks compared to `resolved`, or `None` if up to date.
    ///
    /// `resolved` must be the merge of this copy with others.
    pub fn diff(&self, resolved: &PartitionData) -> Option<PartitionData> {
        let mut out = PartitionData::new();
        if resolved.deletion != self.deletion {
            out.deletion = resolved.deletion;
        }
        for (key, resolved_row) in &resolved.rows {
            let missing = match self.rows.get(key) {
                Some(row) => row.diff(resolved_row),
                None => Some(resolved_row.clone()),
            };
            if let Some(row) = missing {
                out.rows.insert(key.clone(), row);
            }
        }
        (!out.is_empty()).then_some(out)
    }
}

/// A write against one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub partition: PartitionKey,
    pub data: PartitionData,
}

impl Mutation {
    pub fn new(partition: PartitionKey, data: PartitionData) -> Self {
        Self { partition, data }
    }
}

/// JSON map keys must be strings, so rows travel as `[key, row]` pairs.
mod rows_as_pairs {
    use super::{ClusteringKey, Row};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        rows: &BTreeMap<ClusteringKey, Row>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(rows.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<ClusteringKey, Row>, D::Error> {
        let pairs: Vec<(ClusteringKey, Row)> = Vec::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

// ────── Tests ──────
