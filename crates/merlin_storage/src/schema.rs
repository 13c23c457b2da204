//! Table schema metadata and token-to-shard routing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use merlin_common::types::{SchemaVersion, ShardId, TableId};

use crate::keys::Token;

/// Pure token → shard mapping for one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sharder {
    shard_count: u64,
}

impl Sharder {
    pub fn new(shard_count: u64) -> Sharder {
        assert!(shard_count > 0, "shard_count must be positive");
        Sharder { shard_count }
    }

    pub fn shard_count(&self) -> u64 {
        self.shard_count
    }

    /// Owning shard of a token.
    pub fn shard_of(&self, token: Token) -> ShardId {
        ShardId((token.0 as u64) % self.shard_count)
    }
}

/// Table schema, as much of it as the read path needs: identity, version,
/// shard layout, and whether clustering order is reversed for this query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub table_id: TableId,
    pub table: String,
    pub version: SchemaVersion,
    pub shard_count: u64,
    pub reversed: bool,
}

impl Schema {
    pub fn new(table_id: TableId, table: impl Into<String>, shard_count: u64) -> Arc<Schema> {
        Arc::new(Schema {
            table_id,
            table: table.into(),
            version: SchemaVersion(1),
            shard_count,
            reversed: false,
        })
    }

    pub fn get_sharder(&self) -> Sharder {
        Sharder::new(self.shard_count)
    }

    /// The same schema with clustering order flipped. Version is preserved:
    /// a reversed read is not a schema change.
    pub fn make_reversed(&self) -> Arc<Schema> {
        Arc::new(Schema {
            reversed: !self.reversed,
            ..self.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sharder_covers_all_shards() {
        let sharder = Sharder::new(4);
        for t in [-3i64, -2, -1, 0, 1, 2, 3, i64::MIN, i64::MAX] {
            let shard = sharder.shard_of(Token(t));
            assert!(shard.0 < 4);
        }
    }

    #[test]
    fn test_sharder_deterministic() {
        let sharder = Sharder::new(8);
        let t = Token::from_key(b"some-key");
        assert_eq!(sharder.shard_of(t), sharder.shard_of(t));
    }

    #[test]
    fn test_make_reversed_keeps_version() {
        let schema = Schema::new(TableId(1), "events", 4);
        let reversed = schema.make_reversed();
        assert!(reversed.reversed);
        assert_eq!(reversed.version, schema.version);
        assert!(!reversed.make_reversed().reversed);
    }
}
