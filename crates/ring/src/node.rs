//! Physical node descriptors as seen by the ring.

use crate::token::{vnode_token, Token};
use cirrus_common::NodeId;
use serde::{Deserialize, Serialize};

/// Liveness as reported by membership. The core only reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Liveness {
    Up,
    Down,
    Unknown,
}

impl Liveness {
    /// Only nodes known `Down` are skipped; `Unknown` is still attempted.
    pub fn is_alive(self) -> bool {
        !matches!(self, Liveness::Down)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: NodeId,
    pub name: String,
    pub datacenter: String,
    pub rack: String,
    /// Virtual-node tokens owned by this node.
    pub tokens: Vec<Token>,
    pub status: Liveness,
}

impl NodeEntry {
    /// A node with `num_tokens` virtual nodes derived from its name.
    pub fn new(name: &str, datacenter: &str, rack: &str, num_tokens: usize) -> Self {
        let tokens = (0..num_tokens).map(|i| vnode_token(name, i)).collect();
        Self::with_tokens(name, datacenter, rack, tokens)
    }

    /// A node with explicitly assigned tokens.
    pub fn with_tokens(name: &str, datacenter: &str, rack: &str, tokens: Vec<Token>) -> Self {
        Self {
            id: NodeId::from_name(name),
            name: name.to_string(),
            datacenter: datacenter.to_string(),
            rack: rack.to_string(),
            tokens,
            status: Liveness::Up,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.status.is_alive()
    }
}
