//! Configuration schema and loader for cirrus nodes.
//!
//! Option names are snake_case; the camelCase spellings used by operators
//! (`replicationFactor`, `readRepairChance`, `tombstoneGracePeriodSeconds`,
//! ...) are accepted as aliases.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Key part selecting the base table's partition key in a view definition.
pub const BASE_PARTITION_KEY: &str = "$partition_key";
/// Key part selecting the base table's clustering key in a view definition.
pub const BASE_CLUSTERING_KEY: &str = "$clustering_key";

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's identity and placement.
    #[serde(default)]
    pub node: NodeSection,

    /// Other members of the cluster.
    #[serde(default)]
    pub cluster: Vec<PeerConfig>,

    #[serde(default)]
    pub keyspaces: Vec<KeyspaceConfig>,

    #[serde(default)]
    pub tables: Vec<TableConfig>,

    #[serde(default)]
    pub views: Vec<ViewConfig>,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub tombstones: TombstoneConfig,

    #[serde(default)]
    pub compaction: CompactionConfig,

    /// Storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default, alias = "metricsPort")]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_node_name")]
    pub name: String,

    #[serde(default = "default_datacenter")]
    pub datacenter: String,

    #[serde(default = "default_rack")]
    pub rack: String,

    /// Virtual nodes per physical node.
    #[serde(default = "default_num_tokens", alias = "numTokens")]
    pub num_tokens: usize,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            datacenter: default_datacenter(),
            rack: default_rack(),
            num_tokens: default_num_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub name: String,

    #[serde(default = "default_datacenter")]
    pub datacenter: String,

    #[serde(default = "default_rack")]
    pub rack: String,

    /// Defaults to this node's `num_tokens`.
    #[serde(default, alias = "numTokens")]
    pub num_tokens: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyspaceConfig {
    pub name: String,

    /// Simple strategy factor.
    #[serde(default, alias = "replicationFactor")]
    pub replication_factor: Option<usize>,

    /// Network-aware strategy factors, keyed by datacenter.
    #[serde(default, alias = "datacenterFactors")]
    pub datacenter_factors: Option<BTreeMap<String, usize>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    pub keyspace: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewConfig {
    pub keyspace: String,
    pub name: String,

    #[serde(alias = "baseTable")]
    pub base_table: String,

    /// Column names, or `$partition_key` / `$clustering_key`.
    #[serde(alias = "partitionKey")]
    pub partition_key: Vec<String>,

    #[serde(default)]
    pub clustering: Vec<String>,

    /// Extra columns that must be non-null for a row to appear in the view.
    #[serde(default, alias = "filterColumns")]
    pub filter_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Read timeout in milliseconds.
    #[serde(default = "default_timeout_ms", alias = "readTimeoutMs")]
    pub read_timeout_ms: u64,

    /// Write timeout in milliseconds.
    #[serde(default = "default_timeout_ms", alias = "writeTimeoutMs")]
    pub write_timeout_ms: u64,

    /// Probability that a read also fetches every replica in the background.
    #[serde(default = "default_read_repair_chance", alias = "readRepairChance")]
    pub read_repair_chance: f64,

    /// Whether hinted handoff is enabled.
    #[serde(default = "default_true", alias = "hintedHandoff")]
    pub hinted_handoff: bool,

    /// How long a hint stays deliverable.
    #[serde(default = "default_hint_deadline_seconds", alias = "hintDeadlineSeconds")]
    pub hint_deadline_seconds: u64,

    /// Hint delivery check interval in seconds.
    #[serde(default = "default_hint_delivery_interval_secs", alias = "hintDeliveryIntervalSecs")]
    pub hint_delivery_interval_secs: u64,

    /// Maximum hints to attempt delivery per cycle.
    #[serde(default = "default_max_hints_per_cycle", alias = "maxHintsPerCycle")]
    pub max_hints_per_cycle: usize,

    /// Interval of the view batchlog replay task.
    #[serde(default = "default_view_replay_interval_secs", alias = "viewReplayIntervalSecs")]
    pub view_replay_interval_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_timeout_ms(),
            write_timeout_ms: default_timeout_ms(),
            read_repair_chance: default_read_repair_chance(),
            hinted_handoff: true,
            hint_deadline_seconds: default_hint_deadline_seconds(),
            hint_delivery_interval_secs: default_hint_delivery_interval_secs(),
            max_hints_per_cycle: default_max_hints_per_cycle(),
            view_replay_interval_secs: default_view_replay_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TombstoneConfig {
    #[serde(
        default = "default_grace_period_seconds",
        alias = "tombstone_grace_period_seconds",
        alias = "tombstoneGracePeriodSeconds"
    )]
    pub grace_period_seconds: u64,

    #[serde(
        default = "default_warn_threshold",
        alias = "tombstone_warn_threshold",
        alias = "tombstoneWarnThreshold"
    )]
    pub warn_threshold: usize,

    #[serde(
        default = "default_fail_threshold",
        alias = "tombstone_fail_threshold",
        alias = "tombstoneFailThreshold"
    )]
    pub fail_threshold: usize,
}

impl Default for TombstoneConfig {
    fn default() -> Self {
        Self {
            grace_period_seconds: default_grace_period_seconds(),
            warn_threshold: default_warn_threshold(),
            fail_threshold: default_fail_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_compaction_interval_secs", alias = "intervalSecs")]
    pub interval_secs: u64,

    /// Cells a memtable may hold before it is sealed into a segment.
    #[serde(default = "default_memtable_flush_threshold", alias = "memtableFlushThreshold")]
    pub memtable_flush_threshold: usize,

    /// Unreleased view batches a replica accepts before rejecting writes.
    #[serde(default = "default_view_queue_capacity", alias = "viewQueueCapacity")]
    pub view_queue_capacity: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_compaction_interval_secs(),
            memtable_flush_threshold: default_memtable_flush_threshold(),
            view_queue_capacity: default_view_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for WAL and hint files; each node uses a subdirectory.
    #[serde(default = "default_data_dir", alias = "dataDir")]
    pub data_dir: PathBuf,

    /// Fsync policy: "always", "batch", "none".
    #[serde(default = "default_fsync")]
    pub fsync: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            fsync: default_fsync(),
        }
    }
}

// --- Defaults ---

fn default_node_name() -> String {
    "node1".to_string()
}
fn default_datacenter() -> String {
    "dc1".to_string()
}
fn default_rack() -> String {
    "rack1".to_string()
}
fn default_num_tokens() -> usize {
    16
}
fn default_timeout_ms() -> u64 {
    2000
}
fn default_read_repair_chance() -> f64 {
    0.1
}
fn default_true() -> bool {
    true
}
fn default_hint_deadline_seconds() -> u64 {
    3 * 3600
}
fn default_hint_delivery_interval_secs() -> u64 {
    10
}
fn default_max_hints_per_cycle() -> usize {
    100
}
fn default_view_replay_interval_secs() -> u64 {
    30
}
fn default_grace_period_seconds() -> u64 {
    10 * 24 * 3600
}
fn default_warn_threshold() -> usize {
    1_000
}
fn default_fail_threshold() -> usize {
    100_000
}
fn default_compaction_interval_secs() -> u64 {
    60
}
fn default_memtable_flush_threshold() -> usize {
    10_000
}
fn default_view_queue_capacity() -> usize {
    1024
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_fsync() -> String {
    "batch".to_string()
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

impl NodeConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.num_tokens == 0 {
            return Err(invalid("node.num_tokens must be > 0"));
        }

        let mut names = BTreeSet::new();
        names.insert(self.node.name.as_str());
        for peer in &self.cluster {
            if peer.name != self.node.name && !names.insert(peer.name.as_str()) {
                return Err(invalid(format!("cluster: duplicate node name '{}'", peer.name)));
            }
            if peer.num_tokens == Some(0) {
                return Err(invalid(format!("cluster.{}.num_tokens must be > 0", peer.name)));
            }
        }

        let mut keyspaces = BTreeSet::new();
        for ks in &self.keyspaces {
            if !keyspaces.insert(ks.name.as_str()) {
                return Err(invalid(format!("keyspaces: duplicate keyspace '{}'", ks.name)));
            }
            match (&ks.replication_factor, &ks.datacenter_factors) {
                (Some(0), None) => {
                    return Err(invalid(format!(
                        "keyspaces.{}.replication_factor must be > 0",
                        ks.name
                    )))
                }
                (Some(_), None) => {}
                (None, Some(factors)) => {
                    if factors.is_empty() || factors.values().any(|f| *f == 0) {
                        return Err(invalid(format!(
                            "keyspaces.{}.datacenter_factors must be non-empty and > 0",
                            ks.name
                        )));
                    }
                }
                _ => {
                    return Err(invalid(format!(
                        "keyspaces.{}: set exactly one of replication_factor or datacenter_factors",
                        ks.name
                    )))
                }
            }
        }

        let mut tables = BTreeSet::new();
        for table in &self.tables {
            if !keyspaces.contains(table.keyspace.as_str()) {
                return Err(invalid(format!(
                    "tables.{}: unknown keyspace '{}'",
                    table.name, table.keyspace
                )));
            }
            if !tables.insert((table.keyspace.as_str(), table.name.as_str())) {
                return Err(invalid(format!(
                    "tables: duplicate table '{}.{}'",
                    table.keyspace, table.name
                )));
            }
        }

        for view in &self.views {
            if !tables.contains(&(view.keyspace.as_str(), view.base_table.as_str())) {
                return Err(invalid(format!(
                    "views.{}: unknown base table '{}.{}'",
                    view.name, view.keyspace, view.base_table
                )));
            }
            if tables.contains(&(view.keyspace.as_str(), view.name.as_str())) {
                return Err(invalid(format!(
                    "views.{}: name collides with a table",
                    view.name
                )));
            }
            if view.partition_key.is_empty() {
                return Err(invalid(format!("views.{}.partition_key must not be empty", view.name)));
            }
            let columns: BTreeSet<&str> = view
                .partition_key
                .iter()
                .chain(&view.clustering)
                .chain(&view.filter_columns)
                .map(String::as_str)
                .filter(|part| *part != BASE_PARTITION_KEY && *part != BASE_CLUSTERING_KEY)
                .collect();
            // View row liveness follows a single base cell.
            if columns.len() > 1 {
                return Err(invalid(format!(
                    "views.{}: key and filter may reference at most one non-key column, got {:?}",
                    view.name, columns
                )));
            }
        }

        let chance = self.coordinator.read_repair_chance;
        if !(0.0..=1.0).contains(&chance) {
            return Err(invalid(format!(
                "coordinator.read_repair_chance ({}) must be within 0.0..=1.0",
                chance
            )));
        }
        if self.tombstones.warn_threshold > self.tombstones.fail_threshold {
            return Err(invalid(format!(
                "tombstones.warn_threshold ({}) must be <= tombstones.fail_threshold ({})",
                self.tombstones.warn_threshold, self.tombstones.fail_threshold
            )));
        }
        if self.compaction.memtable_flush_threshold == 0 {
            return Err(invalid("compaction.memtable_flush_threshold must be > 0"));
        }
        Ok(())
    }
}

/// Load a `NodeConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `NodeConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}
