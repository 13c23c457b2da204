//! Partition and clustering keys.
//!
//! A partition key hashes to a `Token`; the token determines both the global
//! sort order of partitions and the shard that owns them. A `DecoratedKey`
//! pairs the key with its token so ordering and shard routing never re-hash.

use std::fmt;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

/// Position of a partition on the token ring. Ordered; signed so the ring
/// has a natural least/greatest element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Token(pub i64);

impl Token {
    pub const MIN: Token = Token(i64::MIN);
    pub const MAX: Token = Token(i64::MAX);

    /// Token of a partition key: a stable 64-bit hash of its bytes.
    pub fn from_key(key: &[u8]) -> Token {
        Token(xxh3_64(key) as i64)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raw partition key bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey(pub Vec<u8>);

impl PartitionKey {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> PartitionKey {
        PartitionKey(bytes.into())
    }
}

/// A partition key together with its token.
///
/// Ordered by `(token, key)`: the token defines the global partition order,
/// the raw key breaks hash collisions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DecoratedKey {
    pub token: Token,
    pub key: PartitionKey,
}

impl DecoratedKey {
    pub fn new(key: PartitionKey) -> DecoratedKey {
        let token = Token::from_key(&key.0);
        DecoratedKey { token, key }
    }

    pub fn memory_usage(&self) -> u64 {
        (std::mem::size_of::<Token>() + self.key.0.len()) as u64
    }
}

impl fmt::Display for DecoratedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{key {:02x?} token {}}}", &self.key.0, self.token)
    }
}

/// Clustering key bytes, ordered bytewise within a partition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusteringKey(pub Vec<u8>);

impl ClusteringKey {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> ClusteringKey {
        ClusteringKey(bytes.into())
    }

    pub fn memory_usage(&self) -> u64 {
        self.0.len() as u64
    }
}
