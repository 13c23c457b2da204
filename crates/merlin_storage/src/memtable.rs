//! In-memory per-shard partition store.
//!
//! The only mutation source on the read path. Partitions are kept in token
//! order; each partition holds its tombstone, optional static row, range
//! tombstones and clustering rows. Readers materialize one partition at a
//! time into a well-formed fragment run.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::fragment::{
    ClusteringRow, MutationFragment, RangeTombstoneChange, StaticRow, Tombstone,
};
use crate::keys::{DecoratedKey, PartitionKey};
use crate::range::TokenRange;
use crate::slice::QuerySlice;

/// Stored state of one partition.
#[derive(Debug, Default, Clone)]
pub struct Partition {
    pub tombstone: Option<Tombstone>,
    pub static_row: Option<StaticRow>,
    /// Sorted by position.
    pub range_tombstones: Vec<RangeTombstoneChange>,
    pub rows: BTreeMap<crate::keys::ClusteringKey, ClusteringRow>,
}

/// The partitions owned by one shard, in token order.
pub struct ShardMemtable {
    partitions: RwLock<BTreeMap<DecoratedKey, Partition>>,
}

impl ShardMemtable {
    pub fn new() -> ShardMemtable {
        ShardMemtable {
            partitions: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn upsert_row(&self, key: PartitionKey, row: ClusteringRow) {
        let dk = DecoratedKey::new(key);
        let mut parts = self.partitions.write();
        let partition = parts.entry(dk).or_default();
        partition.rows.insert(row.key.clone(), row);
    }

    pub fn set_partition_tombstone(&self, key: PartitionKey, tombstone: Tombstone) {
        let dk = DecoratedKey::new(key);
        let mut parts = self.partitions.write();
        let partition = parts.entry(dk).or_default();
        partition.tombstone = Tombstone::merge(partition.tombstone, Some(tombstone));
    }

    pub fn set_static_row(&self, key: PartitionKey, static_row: StaticRow) {
        let dk = DecoratedKey::new(key);
        let mut parts = self.partitions.write();
        parts.entry(dk).or_default().static_row = Some(static_row);
    }

    pub fn add_range_tombstone(&self, key: PartitionKey, rtc: RangeTombstoneChange) {
        let dk = DecoratedKey::new(key);
        let mut parts = self.partitions.write();
        let partition = parts.entry(dk).or_default();
        let at = partition
            .range_tombstones
            .partition_point(|existing| existing.position <= rtc.position);
        partition.range_tombstones.insert(at, rtc);
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.read().len()
    }

    /// The next partition in `range` strictly after `after`, rendered as a
    /// fragment run: start, static row, body in clustering order (reversed
    /// when the slice is), end.
    pub fn next_partition_fragments(
        &self,
        range: &TokenRange,
        slice: &QuerySlice,
        after: Option<&DecoratedKey>,
    ) -> Option<(DecoratedKey, Vec<MutationFragment>)> {
        let parts = self.partitions.read();
        let mut found: Option<(&DecoratedKey, &Partition)> = None;
        for (key, partition) in parts.iter() {
            if let Some(after) = after {
                if key <= after {
                    continue;
                }
            }
            if range.contains(key.token) {
                found = Some((key, partition));
                break;
            }
        }
        let (key, partition) = found?;

        let mut frags = Vec::with_capacity(partition.rows.len() + 4);
        frags.push(MutationFragment::PartitionStart {
            key: key.clone(),
            tombstone: partition.tombstone,
        });
        if let Some(sr) = &partition.static_row {
            frags.push(MutationFragment::StaticRow(sr.clone()));
        }

        let mut body = Vec::with_capacity(partition.rows.len() + partition.range_tombstones.len());
        let mut rtcs = partition.range_tombstones.iter().peekable();
        for (ck, row) in &partition.rows {
            if !slice.contains(ck) {
                continue;
            }
            while let Some(rtc) = rtcs.peek() {
                if rtc.position <= *ck {
                    body.push(MutationFragment::RangeTombstoneChange((*rtc).clone()));
                    rtcs.next();
                } else {
                    break;
                }
            }
            body.push(MutationFragment::ClusteringRow(row.clone()));
        }
        for rtc in rtcs {
            body.push(MutationFragment::RangeTombstoneChange(rtc.clone()));
        }
        if slice.reversed {
            body.reverse();
        }
        frags.extend(body);
        frags.push(MutationFragment::PartitionEnd);

        Some((key.clone(), frags))
    }
}

impl Default for ShardMemtable {
    fn default() -> Self {
        Self::new()
    }
}
