//! Resolved statement plans handed to the coordinator, and what it returns.

use crate::consistency::ConsistencyLevel;
use crate::error::CoordinatorError;
use crate::schema::TableKind;
use cirrus_common::Timestamp;
use cirrus_storage::{
    Cell, ClusteringKey, ClusteringRange, Deletion, PartitionData, PartitionKey, ReadFilter, Row,
    RowMarker,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One column assignment. `None` writes an explicit null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnWrite {
    pub column: String,
    pub value: Option<Vec<u8>>,
}

impl ColumnWrite {
    pub fn set(column: &str, value: impl Into<Vec<u8>>) -> Self {
        Self {
            column: column.to_string(),
            value: Some(value.into()),
        }
    }

    pub fn null(column: &str) -> Self {
        Self {
            column: column.to_string(),
            value: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Read,
    /// Insert semantics: the row marker is written along with the columns.
    Write { mutations: Vec<ColumnWrite> },
    /// Without columns and clustering, deletes the whole partition.
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub keyspace: String,
    pub table: String,
    pub partition_key: Vec<u8>,
    /// Rows addressed; writes need a single row. `None` is the whole
    /// partition for reads and deletes, the empty clustering key for writes.
    #[serde(default)]
    pub clustering: Option<ClusteringRange>,
    #[serde(default)]
    pub columns: Option<BTreeSet<String>>,
    pub consistency: ConsistencyLevel,
    pub operation: Operation,
    /// Time to live in seconds.
    #[serde(default)]
    pub ttl: Option<u32>,
    /// Explicit write timestamp in microseconds.
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

impl QueryPlan {
    fn new(keyspace: &str, table: &str, partition_key: &[u8], operation: Operation) -> Self {
        Self {
            keyspace: keyspace.to_string(),
            table: table.to_string(),
            partition_key: partition_key.to_vec(),
            clustering: None,
            columns: None,
            consistency: ConsistencyLevel::One,
            operation,
            ttl: None,
            timestamp: None,
        }
    }

    pub fn read(keyspace: &str, table: &str, partition_key: &[u8]) -> Self {
        Self::new(keyspace, table, partition_key, Operation::Read)
    }

    pub fn write(
        keyspace: &str,
        table: &str,
        partition_key: &[u8],
        mutations: Vec<ColumnWrite>,
    ) -> Self {
        Self::new(keyspace, table, partition_key, Operation::Write { mutations })
    }

    pub fn delete(keyspace: &str, table: &str, partition_key: &[u8]) -> Self {
        Self::new(keyspace, table, partition_key, Operation::Delete)
    }

    pub fn with_consistency(mut self, level: ConsistencyLevel) -> Self {
        self.consistency = level;
        self
    }

    pub fn with_row(mut self, clustering: impl Into<ClusteringKey>) -> Self {
        self.clustering = Some(ClusteringRange::single(clustering.into()));
        self
    }

    pub fn with_range(mut self, range: ClusteringRange) -> Self {
        self.clustering = Some(range);
        self
    }

    pub fn with_columns(mut self, columns: &[&str]) -> Self {
        self.columns = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn is_read(&self) -> bool {
        matches!(self.operation, Operation::Read)
    }

    pub fn partition(&self) -> PartitionKey {
        PartitionKey::new(&self.keyspace, &self.table, self.partition_key.clone())
    }

    pub fn read_filter(&self) -> ReadFilter {
        ReadFilter {
            range: self.clustering.clone().unwrap_or_default(),
            columns: self.columns.clone(),
        }
    }

    fn single_row(&self) -> Result<ClusteringKey, CoordinatorError> {
        match &self.clustering {
            None => Ok(ClusteringKey::EMPTY),
            Some(ClusteringRange {
                start: Some(start),
                end: Some(end),
            }) if start == end => Ok(start.clone()),
            Some(_) => Err(CoordinatorError::InvalidRequest(
                "writes and column deletes address exactly one row".into(),
            )),
        }
    }

    /// The partition update this plan writes at `timestamp`.
    pub fn build_update(
        &self,
        timestamp: Timestamp,
        now_secs: i64,
    ) -> Result<PartitionData, CoordinatorError> {
        let expires_at = self.ttl.map(|ttl| now_secs + i64::from(ttl));
        let mut update = PartitionData::new();
        match &self.operation {
            Operation::Read => {
                return Err(CoordinatorError::InvalidRequest(
                    "a read plan carries no update".into(),
                ))
            }
            Operation::Write { mutations } => {
                let row = update.row_mut(self.single_row()?);
                row.marker = Some(RowMarker::new(timestamp, expires_at));
                for write in mutations {
                    let cell = match (&write.value, expires_at) {
                        (Some(v), Some(exp)) => Cell::expiring(v.clone(), timestamp, exp),
                        (Some(v), None) => Cell::live(v.clone(), timestamp),
                        (None, _) => Cell::tombstone(timestamp),
                    };
                    row.set_cell(write.column.clone(), cell);
                }
            }
            Operation::Delete => match (&self.columns, &self.clustering) {
                (Some(columns), _) => {
                    let row = update.row_mut(self.single_row()?);
                    for column in columns {
                        row.set_cell(column.clone(), Cell::tombstone(timestamp));
                    }
                }
                (None, None) => update.deletion = Some(Deletion::new(timestamp)),
                (None, Some(_)) => {
                    update.row_mut(self.single_row()?).deletion = Some(Deletion::new(timestamp));
                }
            },
        }
        Ok(update)
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// A live row as returned to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRow {
    pub clustering: ClusteringKey,
    pub columns: BTreeMap<String, Vec<u8>>,
}

impl ResultRow {
    pub fn get(&self, column: &str) -> Option<&[u8]> {
        self.columns.get(column).map(Vec::as_slice)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub rows: Vec<ResultRow>,
    pub warnings: Vec<String>,
}

impl QueryResult {
    /// Live rows of `data`. A view row counts only while its marker is live.
    pub fn from_partition(data: &PartitionData, kind: TableKind, now_secs: i64) -> Self {
        let rows: Box<dyn Iterator<Item = (&ClusteringKey, &Row)> + '_> = match kind {
            TableKind::Base => Box::new(data.live_rows(now_secs)),
            TableKind::View => Box::new(data.marked_rows(now_secs)),
        };
        let rows = rows
            .map(|(key, row)| ResultRow {
                clustering: key.clone(),
                columns: row
                    .cells
                    .iter()
                    .filter_map(|(name, cell)| {
                        cell.live_value(now_secs).map(|v| (name.clone(), v.to_vec()))
                    })
                    .collect(),
            })
            .collect();
        Self {
            rows,
            warnings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub acks_received: usize,
    pub acks_required: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    Rows(QueryResult),
    Ack(Ack),
}

impl QueryOutcome {
    pub fn rows(&self) -> Option<&QueryResult> {
        match self {
            QueryOutcome::Rows(r) => Some(r),
            QueryOutcome::Ack(_) => None,
        }
    }

    pub fn ack(&self) -> Option<Ack> {
        match self {
            QueryOutcome::Ack(a) => Some(*a),
            QueryOutcome::Rows(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TS: Timestamp = 5_000_000;

    #[test]
    fn test_write_builds_marker_and_cells() {
        let plan = QueryPlan::write(
            "ks",
            "t",
            b"pk",
            vec![ColumnWrite::set("title", "leader"), ColumnWrite::null("bio")],
        )
        .with_row("r1")
        .with_ttl(60);
        let update = plan.build_update(TS, 100).unwrap();
        let row = update.row(&ClusteringKey::from("r1")).unwrap();
        assert_eq!(row.marker, Some(RowMarker::new(TS, Some(160))));
        assert_eq!(row.cells["title"], Cell::expiring("leader", TS, 160));
        assert!(row.cells["bio"].is_tombstone());
    }

    #[test]
    fn test_delete_shapes() {
        let partition = QueryPlan::delete("ks", "t", b"pk").build_update(TS, 0).unwrap();
        assert_eq!(partition, PartitionData::deleted(TS));

        let row = QueryPlan::delete("ks", "t", b"pk")
            .with_row("r1")
            .build_update(TS, 0)
            .unwrap();
        assert_eq!(
            row.row(&ClusteringKey::from("r1")).unwrap().deletion,
            Some(Deletion::new(TS))
        );

        let cells = QueryPlan::delete("ks", "t", b"pk")
            .with_columns(&["a"])
            .build_update(TS, 0)
            .unwrap();
        assert!(cells.row(&ClusteringKey::EMPTY).unwrap().cells["a"].is_tombstone());
    }

    #[test]
    fn test_write_rejects_ranges() {
        let plan = QueryPlan::write("ks", "t", b"pk", vec![]).with_range(ClusteringRange::all());
        assert!(matches!(
            plan.build_update(TS, 0),
            Err(CoordinatorError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_result_rows_skip_dead_cells() {
        let mut data = PartitionData::new();
        let row = data.row_mut(ClusteringKey::from("a"));
        row.set_cell("x", Cell::live("1", TS));
        row.set_cell("y", Cell::tombstone(TS));
        row.set_cell("z", Cell::expiring("2", TS, 10));
        data.row_mut(ClusteringKey::from("b"))
            .set_cell("x", Cell::tombstone(TS));

        let result = QueryResult::from_partition(&data, TableKind::Base, 20);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].get("x"), Some(&b"1"[..]));
        assert_eq!(result.rows[0].columns.len(), 1);
    }

    #[test]
    fn test_view_rows_need_a_live_marker() {
        let mut data = PartitionData::new();
        let kept = data.row_mut(ClusteringKey::from("a"));
        kept.marker = Some(RowMarker::new(TS, None));
        kept.set_cell("x", Cell::live("1", TS));
        // A cell that outlived the delete of its view row.
        data.row_mut(ClusteringKey::from("b"))
            .set_cell("x", Cell::live("2", TS + 10));

        assert_eq!(QueryResult::from_partition(&data, TableKind::Base, 20).rows.len(), 2);
        let view = QueryResult::from_partition(&data, TableKind::View, 20);
        assert_eq!(view.rows.len(), 1);
        assert_eq!(view.rows[0].clustering, ClusteringKey::from("a"));
    }
}
