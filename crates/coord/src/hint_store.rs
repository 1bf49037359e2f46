//! Durable store for hinted-handoff hints.
//!
//! Each hint is a mutation that could not be delivered to one of its
//! replicas. Hints are kept in memory, indexed by target node, and logged to
//! `hints.log` in the WAL format shared with the storage engine so they
//! survive a restart.

use crate::replica_client::WriteMode;
use cirrus_common::{now_micros, NodeId, Timestamp};
use cirrus_storage::{FsyncPolicy, Mutation, Wal, WalError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

const HINT_LOG: &str = "hints.log";

#[derive(Debug, thiserror::Error)]
pub enum HintStoreError {
    #[error("hint log error: {0}")]
    Wal(#[from] WalError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A write owed to `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hint {
    pub id: u64,
    pub target: NodeId,
    pub mutation: Mutation,
    /// Mode the original write used; a base write replays as a base write
    /// so the target derives its own view updates.
    #[serde(default)]
    pub mode: WriteMode,
    /// Write timestamp; hints replay in this order.
    pub timestamp: Timestamp,
    /// Unix seconds after which the hint is dropped undelivered.
    pub deadline_secs: i64,
}

#[derive(Debug, Serialize, Deserialize)]
enum HintLogEntry {
    Store(Hint),
    Remove { target: NodeId, id: u64 },
}

#[derive(Debug)]
pub struct HintStore {
    wal: Wal,
    /// Per target, hints keyed by (timestamp, id).
    hints: HashMap<NodeId, BTreeMap<(Timestamp, u64), Hint>>,
    next_id: u64,
}

impl HintStore {
    /// Open or create a hint store in `dir`, replaying its log.
    pub fn open(dir: &Path, fsync: FsyncPolicy) -> Result<Self, HintStoreError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(HINT_LOG);

        let mut store = Self {
            wal: Wal::open(&path, fsync)?,
            hints: HashMap::new(),
            next_id: 1,
        };
        for entry in Wal::replay::<HintLogEntry>(&path)? {
            match entry {
                HintLogEntry::Store(hint) => {
                    store.next_id = store.next_id.max(hint.id + 1);
                    store.insert(hint);
                }
                HintLogEntry::Remove { target, id } => {
                    store.take(&target, id);
                }
            }
        }
        if store.hint_count() > 0 {
            tracing::info!("recovered {} hint(s) from {}", store.hint_count(), path.display());
        }
        Ok(store)
    }

    /// Store a hint for `target`; returns its id.
    pub fn store(
        &mut self,
        target: NodeId,
        mutation: Mutation,
        mode: WriteMode,
        deadline_secs: i64,
    ) -> Result<u64, HintStoreError> {
        let hint = Hint {
            id: self.next_id,
            target,
            timestamp: mutation.data.max_timestamp().unwrap_or_else(now_micros),
            mutation,
            mode,
            deadline_secs,
        };
        self.wal.append(&HintLogEntry::Store(hint.clone()))?;
        self.next_id += 1;
        let id = hint.id;
        self.insert(hint);
        Ok(id)
    }

    /// Hints owed to `target`, oldest write first.
    pub fn hints_for(&self, target: &NodeId) -> Vec<Hint> {
        self.hints
            .get(target)
            .map(|hints| hints.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop a hint after delivery. Returns false if it was not stored.
    pub fn remove(&mut self, target: &NodeId, id: u64) -> Result<bool, HintStoreError> {
        if self.take(target, id).is_none() {
            return Ok(false);
        }
        self.wal.append(&HintLogEntry::Remove { target: *target, id })?;
        Ok(true)
    }

    /// Drop every hint whose deadline has passed; returns how many.
    pub fn expire(&mut self, now_secs: i64) -> Result<usize, HintStoreError> {
        let expired: Vec<(NodeId, u64)> = self
            .hints
            .values()
            .flat_map(|hints| hints.values())
            .filter(|h| h.deadline_secs <= now_secs)
            .map(|h| (h.target, h.id))
            .collect();
        for (target, id) in &expired {
            self.remove(target, *id)?;
        }
        Ok(expired.len())
    }

    /// Rewrite the log to hold only pending hints.
    pub fn compact(&mut self) -> Result<(), HintStoreError> {
        let entries: Vec<HintLogEntry> = self
            .hints
            .values()
            .flat_map(|hints| hints.values().cloned())
            .map(HintLogEntry::Store)
            .collect();
        self.wal.rewrite(&entries)?;
        Ok(())
    }

    /// Targets with pending hints.
    pub fn targets(&self) -> Vec<NodeId> {
        let mut targets: Vec<NodeId> = self.hints.keys().copied().collect();
        targets.sort();
        targets
    }

    pub fn hint_count(&self) -> usize {
        self.hints.values().map(BTreeMap::len).sum()
    }

    pub fn hint_count_for(&self, target: &NodeId) -> usize {
        self.hints.get(target).map_or(0, BTreeMap::len)
    }

    pub fn sync(&mut self) -> Result<(), HintStoreError> {
        self.wal.sync()?;
        Ok(())
    }

    fn insert(&mut self, hint: Hint) {
        self.hints
            .entry(hint.target)
            .or_default()
            .insert((hint.timestamp, hint.id), hint);
    }

    fn take(&mut self, target: &NodeId, id: u64) -> Option<Hint> {
        let hints = self.hints.get_mut(target)?;
        let key = hints.values().find(|h| h.id == id).map(|h| (h.timestamp, h.id))?;
        let hint = hints.remove(&key);
        if hints.is_empty() {
            self.hints.remove(target);
        }
        hint
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
