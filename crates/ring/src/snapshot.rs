//! Immutable view of ring membership.

use crate::node::{Liveness, NodeEntry};
use crate::token::Token;
use cirrus_common::NodeId;
use std::collections::{BTreeMap, BTreeSet};

/// Nodes and token ownership at one point in time.
///
/// Never mutated after construction; membership changes build a new
/// snapshot with a higher version.
#[derive(Debug, Clone, Default)]
pub struct RingSnapshot {
    version: u64,
    nodes: BTreeMap<NodeId, NodeEntry>,
    tokens: BTreeMap<Token, NodeId>,
}

impl RingSnapshot {
    pub fn new(nodes: Vec<NodeEntry>) -> Self {
        Self::build(0, nodes.into_iter().map(|n| (n.id, n)).collect())
    }

    fn build(version: u64, nodes: BTreeMap<NodeId, NodeEntry>) -> Self {
        let mut tokens = BTreeMap::new();
        for node in nodes.values() {
            for token in &node.tokens {
                if let Some(owner) = tokens.insert(*token, node.id) {
                    if owner != node.id {
                        tracing::warn!(
                            "token {} claimed by both {} and {}; keeping {}",
                            token,
                            owner,
                            node.id,
                            owner
                        );
                        tokens.insert(*token, owner);
                    }
                }
            }
        }
        Self {
            version,
            nodes,
            tokens,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn node(&self, id: &NodeId) -> Option<&NodeEntry> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.values()
    }

    /// Number of physical nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn datacenters(&self) -> BTreeSet<&str> {
        self.nodes.values().map(|n| n.datacenter.as_str()).collect()
    }

    /// Physical nodes in a datacenter.
    pub fn nodes_in(&self, datacenter: &str) -> usize {
        self.nodes
            .values()
            .filter(|n| n.datacenter == datacenter)
            .count()
    }

    /// Ring positions clockwise from the first token `>= token`, wrapping
    /// once. A physical node appears once per virtual node.
    pub fn walk_from(&self, token: Token) -> impl Iterator<Item = &NodeEntry> {
        self.tokens
            .range(token..)
            .chain(self.tokens.range(..token))
            .filter_map(|(_, id)| self.nodes.get(id))
    }

    /// A copy with one node's liveness changed, or `None` if the node is
    /// unknown.
    pub fn with_status(&self, id: &NodeId, status: Liveness) -> Option<RingSnapshot> {
        if !self.nodes.contains_key(id) {
            return None;
        }
        let mut next = self.clone();
        next.version += 1;
        if let Some(node) = next.nodes.get_mut(id) {
            node.status = status;
        }
        Some(next)
    }
}
