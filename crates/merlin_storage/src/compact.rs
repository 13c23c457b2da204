//! Query-time compaction.
//!
//! Fragments stream through a `PageCompactor` before reaching the result
//! builder. The compactor applies partition, range and row tombstones at the
//! query timestamp, decides row liveness, enforces the row, partition and
//! per-partition limits, and remembers enough of the in-progress partition
//! (`detach_state`) for the page's leftovers to be put back onto shards.

use std::sync::Arc;

use merlin_common::error::MerlinResult;

use crate::fragment::{
    MutationFragment, RangeTombstoneChange, StaticRow, Tombstone,
};
use crate::keys::{ClusteringKey, DecoratedKey};
use crate::result::{BuildStatus, ResultBuilder};
use crate::schema::Schema;

/// What to do with the stream after consuming (or refusing) a fragment.
#[derive(Debug)]
pub enum Step {
    Continue,
    /// Page complete; the fragment was consumed.
    StopAfter,
    /// Page complete; the fragment was not consumed and must go back to the
    /// front of the reader.
    StopBefore(MutationFragment),
}

/// Per-page compaction counters.
#[derive(Debug, Default, Clone)]
pub struct CompactionStats {
    pub partitions: u64,
    pub live_rows: u64,
    pub dead_rows: u64,
    pub static_rows: u64,
    pub range_tombstones: u64,
}

impl std::fmt::Display for CompactionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} partition(s), {} static row(s), {} clustering row(s) ({} live, {} dead), {} range tombstone change(s)",
            self.partitions,
            self.static_rows,
            self.live_rows + self.dead_rows,
            self.live_rows,
            self.dead_rows,
            self.range_tombstones
        )
    }
}

/// The in-progress partition at the moment a page ended, detached for
/// dismantling. `partition_start` is present only while a partition is open;
/// `last_pkey` is the last partition started on this page either way.
#[derive(Debug)]
pub struct DetachedCompactionState {
    pub last_pkey: Option<DecoratedKey>,
    pub partition_start: Option<(DecoratedKey, Option<Tombstone>)>,
    pub static_row: Option<StaticRow>,
    pub current_tombstone: Option<RangeTombstoneChange>,
}

/// Tombstone application and limit enforcement for one page.
pub struct PageCompactor {
    #[allow(dead_code)]
    schema: Arc<Schema>,
    query_ts: i64,
    row_limit: u64,
    partition_limit: u64,
    per_partition_row_limit: u64,

    partitions: u64,
    live_rows: u64,
    rows_in_partition: u64,
    partition_tombstone: Option<Tombstone>,
    active_range_tombstone: Option<Tombstone>,
    /// Rows past the per-partition limit are dropped until partition end.
    skipping_partition: bool,

    last_pkey: Option<DecoratedKey>,
    last_ckey: Option<ClusteringKey>,
    open_partition_start: Option<(DecoratedKey, Option<Tombstone>)>,
    open_static_row: Option<StaticRow>,
    open_range_tombstone: Option<RangeTombstoneChange>,

    stats: CompactionStats,
}

impl PageCompactor {
    pub fn new(
        schema: Arc<Schema>,
        query_ts: i64,
        row_limit: u64,
        partition_limit: u64,
        per_partition_row_limit: u64,
    ) -> PageCompactor {
        PageCompactor {
            schema,
            query_ts,
            row_limit,
            partition_limit,
            per_partition_row_limit,
            partitions: 0,
            live_rows: 0,
            rows_in_partition: 0,
            partition_tombstone: None,
            active_range_tombstone: None,
            skipping_partition: false,
            last_pkey: None,
            last_ckey: None,
            open_partition_start: None,
            open_static_row: None,
            open_range_tombstone: None,
            stats: CompactionStats::default(),
        }
    }

    pub fn stats(&self) -> &CompactionStats {
        &self.stats
    }

    pub fn last_ckey(&self) -> Option<ClusteringKey> {
        self.last_ckey.clone()
    }

    /// Whether the page ended because a row or partition limit fired.
    /// A page that merely ran out of fragments did not.
    pub fn are_limits_reached(&self) -> bool {
        self.live_rows >= self.row_limit || self.partitions >= self.partition_limit
    }

    /// Run one fragment through compaction and into the builder.
    pub fn consume<B: ResultBuilder>(
        &mut self,
        frag: MutationFragment,
        builder: &mut B,
    ) -> MerlinResult<Step> {
        match frag {
            MutationFragment::PartitionStart { key, tombstone } => {
                if self.live_rows >= self.row_limit || self.partitions >= self.partition_limit {
                    return Ok(Step::StopBefore(MutationFragment::PartitionStart {
                        key,
                        tombstone,
                    }));
                }
                self.partitions += 1;
                self.stats.partitions += 1;
                self.rows_in_partition = 0;
                self.skipping_partition = false;
                let effective = tombstone.filter(|t| t.timestamp <= self.query_ts);
                self.partition_tombstone = effective;
                self.active_range_tombstone = None;
                self.last_pkey = Some(key.clone());
                self.open_partition_start = Some((key.clone(), effective));
                self.open_static_row = None;
                self.open_range_tombstone = None;
                builder.consume_new_partition(&key, effective);
                Ok(Step::Continue)
            }
            MutationFragment::StaticRow(sr) => {
                self.stats.static_rows += 1;
                let live = sr.is_live(self.partition_tombstone, self.query_ts);
                self.open_static_row = Some(sr.clone());
                if B::ONLY_LIVE && !live {
                    return Ok(Step::Continue);
                }
                match builder.consume_static_row(sr, live)? {
                    BuildStatus::Continue => Ok(Step::Continue),
                    BuildStatus::Stop => Ok(Step::StopAfter),
                }
            }
            MutationFragment::RangeTombstoneChange(rtc) => {
                self.stats.range_tombstones += 1;
                self.active_range_tombstone =
                    rtc.tombstone.filter(|t| t.timestamp <= self.query_ts);
                self.open_range_tombstone = Some(rtc.clone());
                if B::ONLY_LIVE {
                    return Ok(Step::Continue);
                }
                match builder.consume_range_tombstone_change(rtc)? {
                    BuildStatus::Continue => Ok(Step::Continue),
                    BuildStatus::Stop => Ok(Step::StopAfter),
                }
            }
            MutationFragment::ClusteringRow(row) => {
                if self.skipping_partition {
                    return Ok(Step::Continue);
                }
                let active =
                    Tombstone::merge(self.partition_tombstone, self.active_range_tombstone);
                let live = row.is_live_at(active, self.query_ts);
                if live {
                    self.live_rows += 1;
                    self.rows_in_partition += 1;
                    self.stats.live_rows += 1;
                } else {
                    self.stats.dead_rows += 1;
                }
                let mut status = BuildStatus::Continue;
                if !(B::ONLY_LIVE && !live) {
                    self.last_ckey = Some(row.key.clone());
                    status = builder.consume_row(row, live)?;
                }
                if matches!(status, BuildStatus::Stop) {
                    return Ok(Step::StopAfter);
                }
                if self.live_rows >= self.row_limit {
                    return Ok(Step::StopAfter);
                }
                if self.rows_in_partition >= self.per_partition_row_limit {
                    self.skipping_partition = true;
                }
                Ok(Step::Continue)
            }
            MutationFragment::PartitionEnd => {
                builder.consume_end_of_partition();
                self.partition_tombstone = None;
                self.active_range_tombstone = None;
                self.skipping_partition = false;
                self.open_partition_start = None;
                self.open_static_row = None;
                self.open_range_tombstone = None;
                if self.are_limits_reached() {
                    return Ok(Step::StopAfter);
                }
                Ok(Step::Continue)
            }
        }
    }

    /// Detach the in-progress partition state for dismantling.
    pub fn detach_state(&mut self) -> DetachedCompactionState {
        DetachedCompactionState {
            last_pkey: self.last_pkey.clone(),
            partition_start: self.open_partition_start.take(),
            static_row: self.open_static_row.take(),
            current_tombstone: self.open_range_tombstone.take(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{Cell, ClusteringRow};
    use crate::keys::PartitionKey;
    use crate::result::{MutationResultBuilder, ResultMemoryAccounter};
    use merlin_common::types::TableId;

    fn schema() -> Arc<Schema> {
        Schema::new(TableId(1), "t", 1)
    }

    fn builder() -> MutationResultBuilder {
        MutationResultBuilder::new(ResultMemoryAccounter::new(1 << 20, true))
    }

    fn start(pk: &str, tombstone: Option<Tombstone>) -> MutationFragment {
        MutationFragment::PartitionStart {
            key: DecoratedKey::new(PartitionKey::from_bytes(pk.as_bytes().to_vec())),
            tombstone,
        }
    }

    fn row(ck: u8, ts: i64) -> MutationFragment {
        MutationFragment::ClusteringRow(ClusteringRow {
            key: ClusteringKey::from_bytes(vec![ck]),
            tombstone: None,
            cells: vec![Cell::new(0, ts, b"v".to_vec())],
        })
    }

    #[test]
    fn test_row_limit_stops_page() {
        let mut compactor = PageCompactor::new(schema(), 100, 2, u64::MAX, u64::MAX);
        let mut b = builder();
        assert!(matches!(
            compactor.consume(start("p", None), &mut b).unwrap(),
            Step::Continue
        ));
        assert!(matches!(
            compactor.consume(row(1, 1), &mut b).unwrap(),
            Step::Continue
        ));
        assert!(matches!(
            compactor.consume(row(2, 1), &mut b).unwrap(),
            Step::StopAfter
        ));
        assert!(compactor.are_limits_reached());
    }

    #[test]
    fn test_partition_limit_refuses_next_partition() {
        let mut compactor = PageCompactor::new(schema(), 100, u64::MAX, 1, u64::MAX);
        let mut b = builder();
        compactor.consume(start("p1", None), &mut b).unwrap();
        compactor.consume(row(1, 1), &mut b).unwrap();
        assert!(matches!(
            compactor
                .consume(MutationFragment::PartitionEnd, &mut b)
                .unwrap(),
            Step::StopAfter
        ));
        // A second page driving the same compactor would refuse the next
        // partition outright.
        let step = compactor.consume(start("p2", None), &mut b).unwrap();
        assert!(matches!(step, Step::StopBefore(_)));
    }

    #[test]
    fn test_partition_tombstone_kills_older_rows() {
        let mut compactor = PageCompactor::new(schema(), 100, u64::MAX, u64::MAX, u64::MAX);
        let mut b = builder();
        compactor
            .consume(start("p", Some(Tombstone::new(10))), &mut b)
            .unwrap();
        compactor.consume(row(1, 5), &mut b).unwrap(); // dead
        compactor.consume(row(2, 11), &mut b).unwrap(); // live
        compactor
            .consume(MutationFragment::PartitionEnd, &mut b)
            .unwrap();
        assert_eq!(compactor.stats().dead_rows, 1);
        assert_eq!(compactor.stats().live_rows, 1);
    }

    #[test]
    fn test_range_tombstone_applies_until_closed() {
        let mut compactor = PageCompactor::new(schema(), 100, u64::MAX, u64::MAX, u64::MAX);
        let mut b = builder();
        compactor.consume(start("p", None), &mut b).unwrap();
        compactor
            .consume(
                MutationFragment::RangeTombstoneChange(RangeTombstoneChange {
                    position: ClusteringKey::from_bytes(vec![0]),
                    tombstone: Some(Tombstone::new(10)),
                }),
                &mut b,
            )
            .unwrap();
        compactor.consume(row(1, 5), &mut b).unwrap(); // covered
        compactor
            .consume(
                MutationFragment::RangeTombstoneChange(RangeTombstoneChange {
                    position: ClusteringKey::from_bytes(vec![2]),
                    tombstone: None,
                }),
                &mut b,
            )
            .unwrap();
        compactor.consume(row(3, 5), &mut b).unwrap(); // clear again
        assert_eq!(compactor.stats().dead_rows, 1);
        assert_eq!(compactor.stats().live_rows, 1);
    }

    #[test]
    fn test_future_tombstone_ignored_at_query_ts() {
        let mut compactor = PageCompactor::new(schema(), 100, u64::MAX, u64::MAX, u64::MAX);
        let mut b = builder();
        compactor
            .consume(start("p", Some(Tombstone::new(500))), &mut b)
            .unwrap();
        compactor.consume(row(1, 50), &mut b).unwrap();
        assert_eq!(compactor.stats().live_rows, 1);
    }

    #[test]
    fn test_per_partition_limit_skips_rest_of_partition() {
        let mut compactor = PageCompactor::new(schema(), 100, u64::MAX, u64::MAX, 1);
        let mut b = builder();
        compactor.consume(start("p", None), &mut b).unwrap();
        compactor.consume(row(1, 1), &mut b).unwrap();
        compactor.consume(row(2, 1), &mut b).unwrap(); // skipped
        compactor.consume(row(3, 1), &mut b).unwrap(); // skipped
        assert_eq!(compactor.stats().live_rows, 1);
    }

    #[test]
    fn test_detach_state_mid_partition() {
        let mut compactor = PageCompactor::new(schema(), 100, 1, u64::MAX, u64::MAX);
        let mut b = builder();
        compactor.consume(start("p", None), &mut b).unwrap();
        compactor.consume(row(1, 1), &mut b).unwrap();
        let detached = compactor.detach_state();
        assert!(detached.partition_start.is_some());
        assert_eq!(
            detached.last_pkey.as_ref().unwrap().key.0,
            b"p".to_vec()
        );
    }

    #[test]
    fn test_detach_state_after_partition_end_keeps_last_pkey_only() {
        let mut compactor = PageCompactor::new(schema(), 100, u64::MAX, u64::MAX, u64::MAX);
        let mut b = builder();
        compactor.consume(start("p", None), &mut b).unwrap();
        compactor.consume(row(1, 1), &mut b).unwrap();
        compactor
            .consume(MutationFragment::PartitionEnd, &mut b)
            .unwrap();
        let detached = compactor.detach_state();
        assert!(detached.partition_start.is_none());
        assert!(detached.last_pkey.is_some());
    }
}
