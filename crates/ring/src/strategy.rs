//! Replication strategies and replica set resolution.

use crate::node::NodeEntry;
use crate::snapshot::RingSnapshot;
use crate::token::Token;
use cirrus_common::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    #[error("insufficient replicas: need {required} distinct nodes, ring has {available}")]
    InsufficientReplicas { required: usize, available: usize },
    #[error("insufficient replicas in {datacenter}: need {required} distinct nodes, ring has {available}")]
    InsufficientDatacenterReplicas {
        datacenter: String,
        required: usize,
        available: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationStrategy {
    /// The first `factor` distinct nodes clockwise from the token.
    Simple { factor: usize },
    /// Distinct nodes per datacenter until each datacenter's factor is met.
    NetworkAware { factors: BTreeMap<String, usize> },
}

impl ReplicationStrategy {
    /// Total replicas across all datacenters.
    pub fn replication_factor(&self) -> usize {
        match self {
            Self::Simple { factor } => *factor,
            Self::NetworkAware { factors } => factors.values().sum(),
        }
    }

    /// Configured factor for one datacenter; `None` for `Simple`.
    pub fn datacenter_factor(&self, datacenter: &str) -> Option<usize> {
        match self {
            Self::Simple { .. } => None,
            Self::NetworkAware { factors } => Some(factors.get(datacenter).copied().unwrap_or(0)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyspace {
    pub name: String,
    pub strategy: ReplicationStrategy,
}

impl Keyspace {
    pub fn simple(name: &str, factor: usize) -> Self {
        Self {
            name: name.to_string(),
            strategy: ReplicationStrategy::Simple { factor },
        }
    }

    pub fn network_aware(name: &str, factors: &[(&str, usize)]) -> Self {
        Self {
            name: name.to_string(),
            strategy: ReplicationStrategy::NetworkAware {
                factors: factors.iter().map(|(dc, f)| (dc.to_string(), *f)).collect(),
            },
        }
    }
}

/// Resolve the ordered replica set for a token.
///
/// Liveness is not consulted: down nodes stay in the set so the coordinator
/// can hint them. Fails only when the ring has too few distinct nodes.
pub fn replicas_for(
    ring: &RingSnapshot,
    token: Token,
    keyspace: &Keyspace,
) -> Result<Vec<NodeEntry>, RingError> {
    match &keyspace.strategy {
        ReplicationStrategy::Simple { factor } => simple_replicas(ring, token, *factor),
        ReplicationStrategy::NetworkAware { factors } => {
            network_aware_replicas(ring, token, factors)
        }
    }
}

fn simple_replicas(
    ring: &RingSnapshot,
    token: Token,
    factor: usize,
) -> Result<Vec<NodeEntry>, RingError> {
    if ring.len() < factor {
        return Err(RingError::InsufficientReplicas {
            required: factor,
            available: ring.len(),
        });
    }

    let mut seen: HashSet<NodeId> = HashSet::with_capacity(factor);
    let mut replicas = Vec::with_capacity(factor);
    for node in ring.walk_from(token) {
        if replicas.len() == factor {
            break;
        }
        if seen.insert(node.id) {
            replicas.push(node.clone());
        }
    }
    Ok(replicas)
}

fn network_aware_replicas(
    ring: &RingSnapshot,
    token: Token,
    factors: &BTreeMap<String, usize>,
) -> Result<Vec<NodeEntry>, RingError> {
    for (dc, factor) in factors {
        let available = ring.nodes_in(dc);
        if available < *factor {
            return Err(RingError::InsufficientDatacenterReplicas {
                datacenter: dc.clone(),
                required: *factor,
                available,
            });
        }
    }

    let total: usize = factors.values().sum();
    let mut per_dc: BTreeMap<&str, usize> = BTreeMap::new();
    let mut seen: HashSet<NodeId> = HashSet::with_capacity(total);
    let mut replicas = Vec::with_capacity(total);
    for node in ring.walk_from(token) {
        if replicas.len() == total {
            break;
        }
        let wanted = factors.get(&node.datacenter).copied().unwrap_or(0);
        let have = per_dc.entry(node.datacenter.as_str()).or_insert(0);
        if *have < wanted && seen.insert(node.id) {
            *have += 1;
            replicas.push(node.clone());
        }
    }
    Ok(replicas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Liveness;

    fn node(name: &str, dc: &str, tokens: &[i64]) -> NodeEntry {
        NodeEntry::with_tokens(name, dc, "r1", tokens.iter().map(|t| Token(*t)).collect())
    }

    fn names(replicas: &[NodeEntry]) -> Vec<&str> {
        replicas.iter().map(|n| n.name.as_str()).collect()
    }

    #[test]
    fn test_simple_skips_repeated_physical_nodes() {
        // a owns two adjacent vnodes; the walk must skip the second one.
        let ring = RingSnapshot::new(vec![
            node("a", "dc1", &[0, 10]),
            node("b", "dc1", &[20]),
            node("c", "dc1", &[30]),
        ]);
        let replicas = replicas_for(&ring, Token(-5), &Keyspace::simple("ks", 3)).unwrap();
        assert_eq!(names(&replicas), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_simple_wraps_around() {
        let ring = RingSnapshot::new(vec![
            node("a", "dc1", &[0]),
            node("b", "dc1", &[100]),
            node("c", "dc1", &[200]),
        ]);
        let replicas = replicas_for(&ring, Token(150), &Keyspace::simple("ks", 2)).unwrap();
        assert_eq!(names(&replicas), vec!["c", "a"]);
    }

    #[test]
    fn test_simple_insufficient_nodes() {
        let ring = RingSnapshot::new(vec![node("a", "dc1", &[0, 5, 9]), node("b", "dc1", &[3])]);
        let err = replicas_for(&ring, Token(0), &Keyspace::simple("ks", 3)).unwrap_err();
        assert_eq!(
            err,
            RingError::InsufficientReplicas {
                required: 3,
                available: 2
            }
        );
    }

    #[test]
    fn test_down_nodes_stay_in_replica_set() {
        let ring = RingSnapshot::new(vec![node("a", "dc1", &[0]), node("b", "dc1", &[10])]);
        let ring = ring
            .with_status(&NodeId::from_name("a"), Liveness::Down)
            .unwrap();
        let replicas = replicas_for(&ring, Token(0), &Keyspace::simple("ks", 2)).unwrap();
        assert_eq!(names(&replicas), vec!["a", "b"]);
        assert!(!replicas[0].is_alive());
    }

    #[test]
    fn test_network_aware_per_datacenter() {
        let ring = RingSnapshot::new(vec![
            node("e1", "east", &[0]),
            node("e2", "east", &[10]),
            node("w1", "west", &[20]),
            node("e3", "east", &[30]),
            node("w2", "west", &[40]),
        ]);
        let ks = Keyspace::network_aware("ks", &[("east", 2), ("west", 1)]);
        let replicas = replicas_for(&ring, Token(5), &ks).unwrap();
        assert_eq!(names(&replicas), vec!["e2", "w1", "e3"]);
        assert_eq!(ks.strategy.replication_factor(), 3);
        assert_eq!(ks.strategy.datacenter_factor("west"), Some(1));
        assert_eq!(ks.strategy.datacenter_factor("north"), Some(0));
    }

    #[test]
    fn test_network_aware_insufficient_datacenter() {
        let ring = RingSnapshot::new(vec![node("e1", "east", &[0]), node("w1", "west", &[10])]);
        let ks = Keyspace::network_aware("ks", &[("east", 2), ("west", 1)]);
        let err = replicas_for(&ring, Token(0), &ks).unwrap_err();
        assert!(matches!(
            err,
            RingError::InsufficientDatacenterReplicas { ref datacenter, required: 2, available: 1 }
                if datacenter == "east"
        ));
    }

    #[test]
    fn test_replica_sets_are_distinct_with_vnodes() {
        let nodes = (0..6)
            .map(|i| NodeEntry::new(&format!("n{}", i), "dc1", "r1", 16))
            .collect();
        let ring = RingSnapshot::new(nodes);
        let ks = Keyspace::simple("ks", 3);
        for i in 0..500 {
            let token = crate::token::token_for(format!("k{}", i).as_bytes());
            let replicas = replicas_for(&ring, token, &ks).unwrap();
            let ids: HashSet<_> = replicas.iter().map(|n| n.id).collect();
            assert_eq!(ids.len(), 3);
        }
    }
}
