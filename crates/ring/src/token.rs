//! Tokens and the Murmur3 partitioner (x64/128; a token is the first 64
//! bits of the hash).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;

/// A position on the ring. Ordered as a signed integer; the successor of
/// `i64::MAX` is `i64::MIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Token(pub i64);

impl Token {
    pub const MIN: Token = Token(i64::MIN);
    pub const MAX: Token = Token(i64::MAX);
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hash a partition key onto the ring.
///
/// `i64::MIN` is reserved as the ring's minimum and never returned; a hash
/// landing there maps to `i64::MAX`.
pub fn token_for(key: &[u8]) -> Token {
    // Reading from an in-memory cursor cannot fail.
    let hash = murmur3::murmur3_x64_128(&mut Cursor::new(key), 0).unwrap_or(0);
    let h1 = hash as u64 as i64;
    if h1 == i64::MIN {
        Token::MAX
    } else {
        Token(h1)
    }
}

/// Token of virtual node `index` for the physical node `name`.
pub fn vnode_token(name: &str, index: usize) -> Token {
    token_for(format!("{}:{}", name, index).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_deterministic() {
        assert_eq!(token_for(b"user:42"), token_for(b"user:42"));
        assert_ne!(token_for(b"user:42"), token_for(b"user:43"));
    }

    #[test]
    fn test_token_never_min() {
        for i in 0..10_000u32 {
            assert_ne!(token_for(&i.to_le_bytes()), Token::MIN);
        }
    }

    #[test]
    fn test_token_spread_over_ring() {
        // Four equal arcs of the signed ring should each get roughly a quarter.
        let mut quarters = [0usize; 4];
        let n = 20_000;
        for i in 0..n {
            let t = token_for(format!("key-{}", i).as_bytes()).0;
            let q = ((t as i128 - i64::MIN as i128) >> 62) as usize;
            quarters[q] += 1;
        }
        for count in quarters {
            let share = count as f64 / n as f64;
            assert!((0.2..0.3).contains(&share), "uneven share {}", share);
        }
    }

    #[test]
    fn test_vnode_tokens_distinct() {
        let tokens: std::collections::BTreeSet<_> = (0..64).map(|i| vnode_token("n1", i)).collect();
        assert_eq!(tokens.len(), 64);
    }
}
