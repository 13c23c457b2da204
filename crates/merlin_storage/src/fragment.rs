//! Mutation fragments: the typed elements of a partition's mutation stream.
//!
//! A well-formed stream is `partition_start (static_row)? body* partition_end`
//! repeated, where body fragments are clustering rows and range-tombstone
//! changes in clustering order. Every fragment has a memory footprint used
//! for permit accounting.

use serde::{Deserialize, Serialize};

use crate::keys::{ClusteringKey, DecoratedKey};

/// A deletion marker: everything written at or before `timestamp` is dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub timestamp: i64,
}

impl Tombstone {
    pub fn new(timestamp: i64) -> Tombstone {
        Tombstone { timestamp }
    }

    /// Whether a write at `timestamp` is shadowed by this tombstone.
    pub fn covers(&self, timestamp: i64) -> bool {
        timestamp <= self.timestamp
    }

    /// The stronger of two optional tombstones.
    pub fn merge(a: Option<Tombstone>, b: Option<Tombstone>) -> Option<Tombstone> {
        match (a, b) {
            (Some(a), Some(b)) => Some(if a.timestamp >= b.timestamp { a } else { b }),
            (t, None) | (None, t) => t,
        }
    }
}

/// One column value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub column: u32,
    pub timestamp: i64,
    pub value: Vec<u8>,
}

impl Cell {
    pub fn new(column: u32, timestamp: i64, value: impl Into<Vec<u8>>) -> Cell {
        Cell {
            column,
            timestamp,
            value: value.into(),
        }
    }

    pub fn memory_usage(&self) -> u64 {
        (std::mem::size_of::<Cell>() + self.value.len()) as u64
    }

    /// Visible at `query_ts` and not shadowed by `tombstone`.
    fn is_live(&self, tombstone: Option<Tombstone>, query_ts: i64) -> bool {
        if self.timestamp > query_ts {
            return false;
        }
        match tombstone {
            Some(t) => !t.covers(self.timestamp),
            None => true,
        }
    }
}

/// The partition's static columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRow {
    pub cells: Vec<Cell>,
}

impl StaticRow {
    pub fn memory_usage(&self) -> u64 {
        self.cells.iter().map(Cell::memory_usage).sum::<u64>() + 16
    }

    pub fn is_live(&self, tombstone: Option<Tombstone>, query_ts: i64) -> bool {
        self.cells.iter().any(|c| c.is_live(tombstone, query_ts))
    }
}

/// One clustering row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusteringRow {
    pub key: ClusteringKey,
    pub tombstone: Option<Tombstone>,
    pub cells: Vec<Cell>,
}

impl ClusteringRow {
    pub fn memory_usage(&self) -> u64 {
        self.key.memory_usage() + self.cells.iter().map(Cell::memory_usage).sum::<u64>() + 32
    }

    /// Live under `active` (partition/range tombstones) at `query_ts`.
    pub fn is_live_at(&self, active: Option<Tombstone>, query_ts: i64) -> bool {
        let effective = Tombstone::merge(active, self.tombstone);
        self.cells.iter().any(|c| c.is_live(effective, query_ts))
    }
}

/// A change of the active range tombstone at a clustering position.
/// `tombstone: None` closes the currently open range deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeTombstoneChange {
    pub position: ClusteringKey,
    pub tombstone: Option<Tombstone>,
}

impl RangeTombstoneChange {
    pub fn memory_usage(&self) -> u64 {
        self.position.memory_usage() + 24
    }
}

/// A typed element of a partition's mutation stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationFragment {
    PartitionStart {
        key: DecoratedKey,
        tombstone: Option<Tombstone>,
    },
    StaticRow(StaticRow),
    ClusteringRow(ClusteringRow),
    RangeTombstoneChange(RangeTombstoneChange),
    PartitionEnd,
}

impl MutationFragment {
    pub fn is_partition_start(&self) -> bool {
        matches!(self, MutationFragment::PartitionStart { .. })
    }

    pub fn memory_usage(&self) -> u64 {
        match self {
            MutationFragment::PartitionStart { key, .. } => key.memory_usage() + 24,
            MutationFragment::StaticRow(sr) => sr.memory_usage(),
            MutationFragment::ClusteringRow(cr) => cr.memory_usage(),
            MutationFragment::RangeTombstoneChange(rtc) => rtc.memory_usage(),
            MutationFragment::PartitionEnd => 8,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            MutationFragment::PartitionStart { .. } => "partition_start",
            MutationFragment::StaticRow(_) => "static_row",
            MutationFragment::ClusteringRow(_) => "clustering_row",
            MutationFragment::RangeTombstoneChange(_) => "range_tombstone_change",
            MutationFragment::PartitionEnd => "partition_end",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PartitionKey;

    fn row(ck: u8, ts: i64) -> ClusteringRow {
        ClusteringRow {
            key: ClusteringKey::from_bytes(vec![ck]),
            tombstone: None,
            cells: vec![Cell::new(0, ts, b"v".to_vec())],
        }
    }

    #[test]
    fn test_tombstone_covers() {
        let t = Tombstone::new(10);
        assert!(t.covers(10));
        assert!(t.covers(9));
        assert!(!t.covers(11));
    }

    #[test]
    fn test_tombstone_merge_takes_newest() {
        let merged = Tombstone::merge(Some(Tombstone::new(5)), Some(Tombstone::new(9)));
        assert_eq!(merged, Some(Tombstone::new(9)));
        assert_eq!(Tombstone::merge(None, Some(Tombstone::new(1))), Some(Tombstone::new(1)));
        assert_eq!(Tombstone::merge(None, None), None);
    }

    #[test]
    fn test_row_liveness_under_tombstone() {
        let r = row(1, 5);
        assert!(r.is_live_at(None, 100));
        assert!(!r.is_live_at(Some(Tombstone::new(5)), 100));
        assert!(r.is_live_at(Some(Tombstone::new(4)), 100));
    }

    #[test]
    fn test_row_invisible_past_query_ts() {
        let r = row(1, 50);
        assert!(!r.is_live_at(None, 49));
        assert!(r.is_live_at(None, 50));
    }

    #[test]
    fn test_fragment_memory_usage_positive() {
        let key = DecoratedKey::new(PartitionKey::from_bytes(b"pk".to_vec()));
        let frags = [
            MutationFragment::PartitionStart {
                key,
                tombstone: None,
            },
            MutationFragment::ClusteringRow(row(1, 1)),
            MutationFragment::PartitionEnd,
        ];
        for f in &frags {
            assert!(f.memory_usage() > 0, "{} has zero footprint", f.kind_name());
        }
    }
}
