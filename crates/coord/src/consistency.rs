//! Consistency levels and the acknowledgement arithmetic behind them.
//!
//! [`required`] is the pure RF/CL function. [`Requirement`] is the same rule
//! resolved against a concrete replica set, so that datacenter-scoped levels
//! know which acknowledgements count.

use cirrus_ring::{NodeEntry, ReplicationStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsistencyLevel {
    Any,
    One,
    Two,
    Three,
    Quorum,
    All,
    LocalQuorum,
    EachQuorum,
}

impl ConsistencyLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsistencyLevel::Any => "ANY",
            ConsistencyLevel::One => "ONE",
            ConsistencyLevel::Two => "TWO",
            ConsistencyLevel::Three => "THREE",
            ConsistencyLevel::Quorum => "QUORUM",
            ConsistencyLevel::All => "ALL",
            ConsistencyLevel::LocalQuorum => "LOCAL_QUORUM",
            ConsistencyLevel::EachQuorum => "EACH_QUORUM",
        }
    }
}

impl fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown consistency level '{0}'")]
pub struct ParseConsistencyError(String);

impl FromStr for ConsistencyLevel {
    type Err = ParseConsistencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let level = match s.to_ascii_uppercase().as_str() {
            "ANY" => ConsistencyLevel::Any,
            "ONE" => ConsistencyLevel::One,
            "TWO" => ConsistencyLevel::Two,
            "THREE" => ConsistencyLevel::Three,
            "QUORUM" => ConsistencyLevel::Quorum,
            "ALL" => ConsistencyLevel::All,
            "LOCAL_QUORUM" => ConsistencyLevel::LocalQuorum,
            "EACH_QUORUM" => ConsistencyLevel::EachQuorum,
            _ => return Err(ParseConsistencyError(s.to_string())),
        };
        Ok(level)
    }
}

/// `floor(n / 2) + 1`.
pub fn quorum(n: usize) -> usize {
    n / 2 + 1
}

/// Acknowledgements a level needs against `rf` replicas.
///
/// Datacenter-scoped levels are computed over the whole factor here; use
/// [`Requirement::resolve`] to scope them to a replica set.
pub fn required(rf: usize, level: ConsistencyLevel) -> usize {
    match level {
        ConsistencyLevel::Any => 1,
        ConsistencyLevel::One => rf.min(1),
        ConsistencyLevel::Two => rf.min(2),
        ConsistencyLevel::Three => rf.min(3),
        ConsistencyLevel::Quorum | ConsistencyLevel::LocalQuorum | ConsistencyLevel::EachQuorum => {
            quorum(rf)
        }
        ConsistencyLevel::All => rf,
    }
}

/// `R + W > RF`: every read set overlaps every write set.
///
/// Diagnostic only; any combination is allowed.
pub fn is_strongly_consistent(read_acks: usize, write_acks: usize, rf: usize) -> bool {
    read_acks + write_acks > rf
}

// ---------------------------------------------------------------------------
// Requirement
// ---------------------------------------------------------------------------

/// Acknowledgements received so far, by datacenter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckTally {
    by_datacenter: BTreeMap<String, usize>,
}

impl AckTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tally of every replica in `nodes`.
    pub fn of<'a>(nodes: impl IntoIterator<Item = &'a NodeEntry>) -> Self {
        let mut tally = Self::new();
        for node in nodes {
            tally.record(&node.datacenter);
        }
        tally
    }

    pub fn record(&mut self, datacenter: &str) {
        *self.by_datacenter.entry(datacenter.to_string()).or_insert(0) += 1;
    }

    pub fn total(&self) -> usize {
        self.by_datacenter.values().sum()
    }

    pub fn in_datacenter(&self, datacenter: &str) -> usize {
        self.by_datacenter.get(datacenter).copied().unwrap_or(0)
    }
}

/// A consistency level resolved against one replica set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// Acknowledgements from any replicas.
    Count(usize),
    /// Acknowledgements from replicas in one datacenter.
    Datacenter { datacenter: String, count: usize },
    /// An independent count in every listed datacenter.
    EachDatacenter(BTreeMap<String, usize>),
}

impl Requirement {
    /// Under a `Simple` strategy the datacenter-scoped levels fall back to a
    /// plain quorum over all replicas.
    pub fn resolve(
        level: ConsistencyLevel,
        strategy: &ReplicationStrategy,
        replicas: &[NodeEntry],
        local_datacenter: &str,
    ) -> Self {
        let rf = replicas.len();
        match (level, strategy) {
            (ConsistencyLevel::LocalQuorum, ReplicationStrategy::NetworkAware { factors }) => {
                let local_rf = factors.get(local_datacenter).copied().unwrap_or(0);
                Requirement::Datacenter {
                    datacenter: local_datacenter.to_string(),
                    count: quorum(local_rf),
                }
            }
            (ConsistencyLevel::EachQuorum, ReplicationStrategy::NetworkAware { factors }) => {
                Requirement::EachDatacenter(
                    factors
                        .iter()
                        .map(|(dc, factor)| (dc.clone(), quorum(*factor)))
                        .collect(),
                )
            }
            _ => Requirement::Count(required(rf, level)),
        }
    }

    /// Total acknowledgements needed.
    pub fn total(&self) -> usize {
        match self {
            Requirement::Count(n) => *n,
            Requirement::Datacenter { count, .. } => *count,
            Requirement::EachDatacenter(counts) => counts.values().sum(),
        }
    }

    pub fn is_met(&self, tally: &AckTally) -> bool {
        match self {
            Requirement::Count(n) => tally.total() >= *n,
            Requirement::Datacenter { datacenter, count } => {
                tally.in_datacenter(datacenter) >= *count
            }
            Requirement::EachDatacenter(counts) => counts
                .iter()
                .all(|(dc, count)| tally.in_datacenter(dc) >= *count),
        }
    }

    /// Acknowledgements in `tally` that count toward this requirement.
    pub fn counted(&self, tally: &AckTally) -> usize {
        match self {
            Requirement::Count(_) => tally.total(),
            Requirement::Datacenter { datacenter, .. } => tally.in_datacenter(datacenter),
            Requirement::EachDatacenter(counts) => {
                counts.keys().map(|dc| tally.in_datacenter(dc)).sum()
            }
        }
    }

    /// Whether one more acknowledgement from `datacenter` would still help.
    pub fn wants(&self, tally: &AckTally, datacenter: &str) -> bool {
        match self {
            Requirement::Count(n) => tally.total() < *n,
            Requirement::Datacenter { datacenter: dc, count } => {
                dc == datacenter && tally.in_datacenter(dc) < *count
            }
            Requirement::EachDatacenter(counts) => counts
                .get(datacenter)
                .map_or(false, |count| tally.in_datacenter(datacenter) < *count),
        }
    }
}

// ────── Tests ──────
