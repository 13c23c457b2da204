//! Page results and result builders.
//!
//! Builders consume post-compaction fragments in stream order. The
//! mutation-reconciliation flavor keeps deletions and dead rows (read
//! repair needs them); the data flavor emits live rows only. Both bill a
//! memory accounter; crossing the cap ends the page as a short read when
//! the slice allows it.

use merlin_common::error::{MerlinResult, QueryError};

use crate::fragment::{ClusteringRow, RangeTombstoneChange, StaticRow, Tombstone};
use crate::keys::DecoratedKey;

/// Builder feedback after consuming a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Continue,
    /// The result is full; terminate the page.
    Stop,
}

/// Tracks result bytes against the max-result-size cap.
#[derive(Debug)]
pub struct ResultMemoryAccounter {
    max_size: u64,
    used: u64,
    short_read_allowed: bool,
    short_read: bool,
}

impl ResultMemoryAccounter {
    pub fn new(max_size: u64, short_read_allowed: bool) -> ResultMemoryAccounter {
        ResultMemoryAccounter {
            max_size,
            used: 0,
            short_read_allowed,
            short_read: false,
        }
    }

    /// Bill `bytes` of result data. Crossing the cap turns the page into a
    /// short read, or fails it when short reads are not allowed.
    pub fn account(&mut self, bytes: u64) -> MerlinResult<BuildStatus> {
        self.used += bytes;
        if self.used > self.max_size {
            if self.short_read_allowed {
                self.short_read = true;
                return Ok(BuildStatus::Stop);
            }
            return Err(QueryError::ResultTooLarge(self.used - self.max_size).into());
        }
        Ok(BuildStatus::Continue)
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn is_short_read(&self) -> bool {
        self.short_read
    }
}

/// Common surface of page results.
pub trait PagedResult {
    /// The page ended on the size cap rather than a row/partition limit.
    fn is_short_read(&self) -> bool;
    fn row_count(&self) -> u64;
}

/// One partition of a reconcilable result. Rows carry their liveness verdict
/// so replicas can reconcile deletions.
#[derive(Debug, Clone)]
pub struct PartitionMutation {
    pub key: DecoratedKey,
    pub tombstone: Option<Tombstone>,
    pub static_row: Option<StaticRow>,
    pub rows: Vec<(ClusteringRow, bool)>,
    pub range_tombstones: Vec<RangeTombstoneChange>,
}

/// Result of a mutation-level read: everything needed for reconciliation,
/// deletions included.
#[derive(Debug, Default)]
pub struct ReconcilableResult {
    pub partitions: Vec<PartitionMutation>,
    pub live_row_count: u64,
    pub short_read: bool,
    pub memory: u64,
}

impl ReconcilableResult {
    pub fn empty() -> ReconcilableResult {
        ReconcilableResult::default()
    }
}

impl PagedResult for ReconcilableResult {
    fn is_short_read(&self) -> bool {
        self.short_read
    }

    fn row_count(&self) -> u64 {
        self.live_row_count
    }
}

/// One partition of a client-facing result: live data only.
#[derive(Debug, Clone)]
pub struct DataPartition {
    pub key: DecoratedKey,
    pub static_row: Option<StaticRow>,
    pub rows: Vec<ClusteringRow>,
}

/// Result of a data-level read.
#[derive(Debug, Default)]
pub struct DataResult {
    pub partitions: Vec<DataPartition>,
    pub row_count: u64,
    pub short_read: bool,
    pub memory: u64,
}

impl DataResult {
    pub fn empty() -> DataResult {
        DataResult::default()
    }
}

impl PagedResult for DataResult {
    fn is_short_read(&self) -> bool {
        self.short_read
    }

    fn row_count(&self) -> u64 {
        self.row_count
    }
}

/// Consumes post-compaction fragments in stream order and produces a page
/// result. `ONLY_LIVE` builders are never fed dead rows or tombstones.
pub trait ResultBuilder {
    type Output: PagedResult;
    const ONLY_LIVE: bool;

    fn consume_new_partition(&mut self, key: &DecoratedKey, tombstone: Option<Tombstone>);
    fn consume_static_row(&mut self, sr: StaticRow, is_live: bool) -> MerlinResult<BuildStatus>;
    fn consume_row(&mut self, row: ClusteringRow, is_live: bool) -> MerlinResult<BuildStatus>;
    fn consume_range_tombstone_change(
        &mut self,
        rtc: RangeTombstoneChange,
    ) -> MerlinResult<BuildStatus>;
    fn consume_end_of_partition(&mut self);
    fn consume_end_of_stream(self) -> Self::Output;
}

/// Builds a `ReconcilableResult`.
pub struct MutationResultBuilder {
    accounter: ResultMemoryAccounter,
    partitions: Vec<PartitionMutation>,
    current: Option<PartitionMutation>,
    live_row_count: u64,
}

impl MutationResultBuilder {
    pub fn new(accounter: ResultMemoryAccounter) -> MutationResultBuilder {
        MutationResultBuilder {
            accounter,
            partitions: Vec::new(),
            current: None,
            live_row_count: 0,
        }
    }

    fn flush_current(&mut self) {
        if let Some(p) = self.current.take() {
            self.partitions.push(p);
        }
    }
}

impl ResultBuilder for MutationResultBuilder {
    type Output = ReconcilableResult;
    const ONLY_LIVE: bool = false;

    fn consume_new_partition(&mut self, key: &DecoratedKey, tombstone: Option<Tombstone>) {
        self.flush_current();
        self.current = Some(PartitionMutation {
            key: key.clone(),
            tombstone,
            static_row: None,
            rows: Vec::new(),
            range_tombstones: Vec::new(),
        });
    }

    fn consume_static_row(&mut self, sr: StaticRow, _is_live: bool) -> MerlinResult<BuildStatus> {
        let status = self.accounter.account(sr.memory_usage())?;
        if let Some(p) = self.current.as_mut() {
            p.static_row = Some(sr);
        }
        Ok(status)
    }

    fn consume_row(&mut self, row: ClusteringRow, is_live: bool) -> MerlinResult<BuildStatus> {
        let status = self.accounter.account(row.memory_usage())?;
        if is_live {
            self.live_row_count += 1;
        }
        if let Some(p) = self.current.as_mut() {
            p.rows.push((row, is_live));
        }
        Ok(status)
    }

    fn consume_range_tombstone_change(
        &mut self,
        rtc: RangeTombstoneChange,
    ) -> MerlinResult<BuildStatus> {
        let status = self.accounter.account(rtc.memory_usage())?;
        if let Some(p) = self.current.as_mut() {
            p.range_tombstones.push(rtc);
        }
        Ok(status)
    }

    fn consume_end_of_partition(&mut self) {
        self.flush_current();
    }

    fn consume_end_of_stream(mut self) -> ReconcilableResult {
        self.flush_current();
        ReconcilableResult {
            partitions: self.partitions,
            live_row_count: self.live_row_count,
            short_read: self.accounter.is_short_read(),
            memory: self.accounter.used(),
        }
    }
}

/// Builds a `DataResult`. Only live rows reach it.
pub struct DataResultBuilder {
    accounter: ResultMemoryAccounter,
    partitions: Vec<DataPartition>,
    current: Option<DataPartition>,
    row_count: u64,
}

impl DataResultBuilder {
    pub fn new(accounter: ResultMemoryAccounter) -> DataResultBuilder {
        DataResultBuilder {
            accounter,
            partitions: Vec::new(),
            current: None,
            row_count: 0,
        }
    }

    fn flush_current(&mut self) {
        // Partitions with no live data are dropped from client results.
        if let Some(p) = self.current.take() {
            if p.static_row.is_some() || !p.rows.is_empty() {
                self.partitions.push(p);
            }
        }
    }
}

impl ResultBuilder for DataResultBuilder {
    type Output = DataResult;
    const ONLY_LIVE: bool = true;

    fn consume_new_partition(&mut self, key: &DecoratedKey, _tombstone: Option<Tombstone>) {
        self.flush_current();
        self.current = Some(DataPartition {
            key: key.clone(),
            static_row: None,
            rows: Vec::new(),
        });
    }

    fn consume_static_row(&mut self, sr: StaticRow, _is_live: bool) -> MerlinResult<BuildStatus> {
        let status = self.accounter.account(sr.memory_usage())?;
        if let Some(p) = self.current.as_mut() {
            p.static_row = Some(sr);
        }
        Ok(status)
    }

    fn consume_row(&mut self, row: ClusteringRow, _is_live: bool) -> MerlinResult<BuildStatus> {
        let status = self.accounter.account(row.memory_usage())?;
        self.row_count += 1;
        if let Some(p) = self.current.as_mut() {
            p.rows.push(row);
        }
        Ok(status)
    }

    fn consume_range_tombstone_change(
        &mut self,
        _rtc: RangeTombstoneChange,
    ) -> MerlinResult<BuildStatus> {
        // Never called: ONLY_LIVE builders are not fed tombstones.
        Ok(BuildStatus::Continue)
    }

    fn consume_end_of_partition(&mut self) {
        self.flush_current();
    }

    fn consume_end_of_stream(mut self) -> DataResult {
        self.flush_current();
        DataResult {
            partitions: self.partitions,
            row_count: self.row_count,
            short_read: self.accounter.is_short_read(),
            memory: self.accounter.used(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::Cell;
    use crate::keys::{ClusteringKey, PartitionKey};

    fn dk(pk: &str) -> DecoratedKey {
        DecoratedKey::new(PartitionKey::from_bytes(pk.as_bytes().to_vec()))
    }

    fn row(ck: u8, value_len: usize) -> ClusteringRow {
        ClusteringRow {
            key: ClusteringKey::from_bytes(vec![ck]),
            tombstone: None,
            cells: vec![Cell::new(0, 1, vec![0u8; value_len])],
        }
    }

    #[test]
    fn test_mutation_builder_keeps_dead_rows() {
        let mut b = MutationResultBuilder::new(ResultMemoryAccounter::new(1 << 20, true));
        b.consume_new_partition(&dk("p"), Some(Tombstone::new(10)));
        b.consume_row(row(1, 4), false).unwrap();
        b.consume_row(row(2, 4), true).unwrap();
        b.consume_end_of_partition();
        let result = b.consume_end_of_stream();
        assert_eq!(result.partitions.len(), 1);
        assert_eq!(result.partitions[0].rows.len(), 2);
        assert_eq!(result.live_row_count, 1);
        assert!(!result.is_short_read());
    }

    #[test]
    fn test_data_builder_drops_empty_partitions() {
        let mut b = DataResultBuilder::new(ResultMemoryAccounter::new(1 << 20, true));
        b.consume_new_partition(&dk("p1"), None);
        b.consume_end_of_partition();
        b.consume_new_partition(&dk("p2"), None);
        b.consume_row(row(1, 4), true).unwrap();
        b.consume_end_of_partition();
        let result = b.consume_end_of_stream();
        assert_eq!(result.partitions.len(), 1);
        assert_eq!(result.row_count, 1);
    }

    #[test]
    fn test_accounter_short_read() {
        let mut b = MutationResultBuilder::new(ResultMemoryAccounter::new(64, true));
        b.consume_new_partition(&dk("p"), None);
        let mut stopped = false;
        for ck in 0..8u8 {
            if b.consume_row(row(ck, 64), true).unwrap() == BuildStatus::Stop {
                stopped = true;
                break;
            }
        }
        assert!(stopped);
        let result = b.consume_end_of_stream();
        assert!(result.is_short_read());
    }

    #[test]
    fn test_accounter_errors_without_short_read() {
        let mut acc = ResultMemoryAccounter::new(16, false);
        assert!(acc.account(8).is_ok());
        let err = acc.account(64).unwrap_err();
        assert!(matches!(
            err,
            merlin_common::error::MerlinError::Query(QueryError::ResultTooLarge(_))
        ));
    }
}
