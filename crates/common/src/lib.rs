//! cirrus-common: shared types for the cirrus coordination core.
//!
//! Provides the 160-bit `NodeId` used to name cluster members and the
//! microsecond write clock that drives last-write-wins reconciliation.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of bytes in a node identifier.
pub const ID_BYTES: usize = 20;

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// A 160-bit identifier naming a physical node of the cluster.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; ID_BYTES]);

impl NodeId {
    /// The all-zeros identifier.
    pub const ZERO: Self = Self([0u8; ID_BYTES]);

    /// Create a `NodeId` from raw bytes.
    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// Generate a random `NodeId`.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        rand::thread_rng().fill(&mut bytes);
        Self(bytes)
    }

    /// Derive a stable `NodeId` from a node name (SHA-1 of the bytes).
    pub fn from_name(name: &str) -> Self {
        Self::from_sha1(name.as_bytes())
    }

    /// Create a `NodeId` by SHA-1 hashing arbitrary data.
    pub fn from_sha1(data: &[u8]) -> Self {
        let hash = Sha1::digest(data);
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&hash);
        Self(bytes)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Show first 4 bytes as hex for readability
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "…")
    }
}

// ---------------------------------------------------------------------------
// Clocks
// ---------------------------------------------------------------------------

/// Write timestamp in microseconds since the Unix epoch.
pub type Timestamp = i64;

/// Wall-clock time in microseconds since the Unix epoch.
pub fn now_micros() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}

/// Wall-clock time in whole seconds since the Unix epoch.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Convert a microsecond timestamp to whole seconds.
pub fn micros_to_secs(ts: Timestamp) -> i64 {
    ts.div_euclid(1_000_000)
}

/// Hands out strictly increasing write timestamps for a single writer.
///
/// Two calls never return the same value even when the wall clock stalls
/// or steps backwards, so writes issued by one coordinator are applied in
/// issue order under last-write-wins.
#[derive(Debug, Default)]
pub struct TimestampGenerator {
    last: AtomicI64,
}

impl TimestampGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp: `max(now, last + 1)`.
    pub fn next(&self) -> Timestamp {
        let now = now_micros();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev + 1);
            match self.last.compare_exchange_weak(
                prev,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Make sure subsequent timestamps are strictly greater than `seen`.
    pub fn observe(&self, seen: Timestamp) {
        self.last.fetch_max(seen, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
