//! Cells, deletions and row markers, with last-write-wins reconciliation.
//!
//! Every comparison here is total: two versions of the same cell always have
//! a single winner, no matter which replica or segment each came from.

use cirrus_common::{micros_to_secs, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// The payload of a cell: a value or a deletion marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellValue {
    Live(Vec<u8>),
    Tombstone,
}

/// A single column version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub value: CellValue,
    /// Write timestamp in microseconds.
    pub timestamp: Timestamp,
    /// Absolute expiration in seconds since the epoch (TTL writes only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl Cell {
    pub fn live(value: impl Into<Vec<u8>>, timestamp: Timestamp) -> Self {
        Self {
            value: CellValue::Live(value.into()),
            timestamp,
            expires_at: None,
        }
    }

    pub fn expiring(value: impl Into<Vec<u8>>, timestamp: Timestamp, expires_at: i64) -> Self {
        Self {
            value: CellValue::Live(value.into()),
            timestamp,
            expires_at: Some(expires_at),
        }
    }

    pub fn tombstone(timestamp: Timestamp) -> Self {
        Self {
            value: CellValue::Tombstone,
            timestamp,
            expires_at: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.value, CellValue::Tombstone)
    }

    /// The raw value regardless of expiry, `None` for tombstones.
    pub fn value(&self) -> Option<&[u8]> {
        match &self.value {
            CellValue::Live(v) => Some(v),
            CellValue::Tombstone => None,
        }
    }

    /// True when the cell carries a value that has not expired at `now_secs`.
    pub fn is_live(&self, now_secs: i64) -> bool {
        !self.is_tombstone() && self.expires_at.map_or(true, |e| e > now_secs)
    }

    /// A tombstone, or a TTL cell whose expiration has passed.
    pub fn is_dead(&self, now_secs: i64) -> bool {
        !self.is_live(now_secs)
    }

    /// Seconds at which this cell became a deletion.
    ///
    /// Tombstones use their write time; expiring cells use their expiration.
    /// Plain live cells never become deletions.
    pub fn deletion_time(&self) -> Option<i64> {
        if self.is_tombstone() {
            Some(micros_to_secs(self.timestamp))
        } else {
            self.expires_at
        }
    }

    /// The value if it is live at `now_secs`.
    pub fn live_value(&self, now_secs: i64) -> Option<&[u8]> {
        if self.is_live(now_secs) {
            self.value()
        } else {
            None
        }
    }
}

fn expiry_rank(expires_at: Option<i64>) -> i64 {
    expires_at.unwrap_or(i64::MAX)
}

/// Total order over versions of one cell; the greater version wins.
///
/// Higher timestamp wins. On equal timestamps a tombstone beats a value.
/// Between two values with equal timestamps the later expiration wins, then
/// the larger value bytes, so every replica picks the same winner.
pub fn compare_cells(a: &Cell, b: &Cell) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.is_tombstone().cmp(&b.is_tombstone()))
        .then_with(|| expiry_rank(a.expires_at).cmp(&expiry_rank(b.expires_at)))
        .then_with(|| a.value().cmp(&b.value()))
}

/// Pick the winning version of two cells.
pub fn reconcile<'a>(a: &'a Cell, b: &'a Cell) -> &'a Cell {
    if compare_cells(a, b) == Ordering::Less {
        b
    } else {
        a
    }
}

/// A partition- or row-level deletion.
///
/// Shadows every cell and marker whose timestamp is at or below its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deletion {
    pub timestamp: Timestamp,
    /// Seconds since the epoch at which the deletion was written.
    pub deleted_at: i64,
}

impl Deletion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            deleted_at: micros_to_secs(timestamp),
        }
    }

    pub fn shadows(&self, timestamp: Timestamp) -> bool {
        timestamp <= self.timestamp
    }

    /// Keep the stronger of two optional deletions.
    pub fn supersede(a: Option<Deletion>, b: Option<Deletion>) -> Option<Deletion> {
        match (a, b) {
            (Some(x), Some(y)) => {
                if (y.timestamp, y.deleted_at) > (x.timestamp, x.deleted_at) {
                    Some(y)
                } else {
                    Some(x)
                }
            }
            (x, None) => x,
            (None, y) => y,
        }
    }
}

/// Primary-key liveness written by inserts.
///
/// A row with a live marker exists even when all of its regular columns are
/// null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowMarker {
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl RowMarker {
    pub fn new(timestamp: Timestamp, expires_at: Option<i64>) -> Self {
        Self {
            timestamp,
            expires_at,
        }
    }

    pub fn is_live(&self, now_secs: i64) -> bool {
        self.expires_at.map_or(true, |e| e > now_secs)
    }

    pub fn supersede(a: Option<RowMarker>, b: Option<RowMarker>) -> Option<RowMarker> {
        match (a, b) {
            (Some(x), Some(y)) => {
                let kx = (x.timestamp, expiry_rank(x.expires_at));
                let ky = (y.timestamp, expiry_rank(y.expires_at));
                if ky > kx {
                    Some(y)
                } else {
                    Some(x)
                }
            }
            (x, None) => x,
            (None, y) => y,
        }
    }
}

// ────── Tests ──────
