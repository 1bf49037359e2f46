//! Coordination core for cirrus.
//!
//! Provides: consistency-level fan-out over the replica set, read repair,
//! hinted handoff, materialized view maintenance and scheduled compaction.

pub mod chaos;
pub mod compaction;
pub mod consistency;
pub mod coordinator;
pub mod error;
pub mod hint_delivery;
pub mod hint_store;
pub mod local;
pub mod plan;
pub mod reconcile;
pub mod replica;
pub mod replica_client;
pub mod schema;
pub mod view_replay;
pub mod views;

pub use consistency::ConsistencyLevel;
pub use coordinator::{Coordinator, CoordinatorConfig, QueryState};
pub use error::CoordinatorError;
pub use hint_delivery::{spawn_hint_delivery_task, HintDeliveryConfig, HintHandle};
pub use hint_store::HintStore;
pub use local::InProcessReplicaClient;
pub use plan::{Ack, ColumnWrite, QueryOutcome, QueryPlan, QueryResult, ResultRow};
pub use replica::{LocalReplica, TombstoneThresholds};
pub use replica_client::{ReplicaClient, ReplicaError, WriteMode};
pub use schema::{KeyPart, Schema, ViewDef};
