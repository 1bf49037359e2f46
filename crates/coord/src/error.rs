use cirrus_ring::RingError;

/// Errors surfaced to the caller of a coordinated query.
///
/// Per-replica failures never appear here individually; only the aggregate
/// outcome does.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("insufficient replicas: {0}")]
    InsufficientReplicas(#[from] RingError),
    #[error("write timed out: {acks_received} of {acks_required} acks")]
    WriteTimeout {
        acks_received: usize,
        acks_required: usize,
    },
    #[error("read timed out: {responses_received} of {responses_required} responses")]
    ReadTimeout {
        responses_received: usize,
        responses_required: usize,
    },
    #[error("view update failed: {0}")]
    ViewUpdate(String),
    #[error("scanned {scanned} tombstones, over the limit of {threshold}")]
    TombstoneOverflow { scanned: usize, threshold: usize },
    #[error("unavailable: {alive} live replicas, {required} required")]
    Unavailable { alive: usize, required: usize },
    #[error("unknown keyspace '{0}'")]
    UnknownKeyspace(String),
    #[error("unknown table '{keyspace}.{table}'")]
    UnknownTable { keyspace: String, table: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl CoordinatorError {
    /// Deadline-driven failures; the caller may retry the whole operation.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            CoordinatorError::WriteTimeout { .. } | CoordinatorError::ReadTimeout { .. }
        )
    }
}
