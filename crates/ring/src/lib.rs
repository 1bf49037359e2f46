//! cirrus-ring: token ring and replica placement.
//!
//! Partition keys hash to Murmur3 tokens on a signed 64-bit ring. Each
//! physical node owns several virtual-node tokens; replica sets come from a
//! clockwise walk that collects distinct physical nodes according to the
//! keyspace's replication strategy. Membership publishes immutable ring
//! snapshots and liveness transitions.

pub mod membership;
pub mod node;
pub mod snapshot;
pub mod strategy;
pub mod token;

pub use membership::{LivenessChange, Membership};
pub use node::{Liveness, NodeEntry};
pub use snapshot::RingSnapshot;
pub use strategy::{replicas_for, Keyspace, ReplicationStrategy, RingError};
pub use token::{token_for, vnode_token, Token};
