#[cfg(test)]
mod page_pipeline_tests {
    use std::sync::Arc;

    use merlin_common::deadline::Deadline;
    use merlin_common::types::TableId;

    use crate::compact::{PageCompactor, Step};
    use crate::fragment::{Cell, ClusteringRow, Tombstone};
    use crate::keys::{ClusteringKey, PartitionKey};
    use crate::memtable::ShardMemtable;
    use crate::range::TokenRange;
    use crate::reader::ShardReader;
    use crate::result::{
        DataResultBuilder, MutationResultBuilder, PagedResult, ResultBuilder,
        ResultMemoryAccounter,
    };
    use crate::schema::Schema;
    use crate::semaphore::ReaderSemaphore;
    use crate::slice::QuerySlice;

    fn row(ck: u8, ts: i64) -> ClusteringRow {
        ClusteringRow {
            key: ClusteringKey::from_bytes(vec![ck]),
            tombstone: None,
            cells: vec![Cell::new(0, ts, b"value".to_vec())],
        }
    }

    fn memtable_with(partitions: u8, rows: u8) -> Arc<ShardMemtable> {
        let mt = Arc::new(ShardMemtable::new());
        for p in 0..partitions {
            let pk = PartitionKey::from_bytes(format!("pk-{p}"));
            for r in 0..rows {
                mt.upsert_row(pk.clone(), row(r, 10));
            }
        }
        mt
    }

    fn reader_over(mt: Arc<ShardMemtable>) -> ShardReader {
        let sem = ReaderSemaphore::new("test", 8, 1 << 20);
        let permit = sem.make_permit("pipeline", Deadline::never()).unwrap();
        ShardReader::new(
            Schema::new(TableId(1), "t", 1),
            permit,
            mt,
            TokenRange::full(),
            Arc::new(QuerySlice::full()),
            4096,
        )
    }

    fn run_page<B: ResultBuilder>(
        reader: &mut ShardReader,
        compactor: &mut PageCompactor,
        mut builder: B,
    ) -> B::Output {
        loop {
            if reader.is_buffer_empty() {
                if reader.is_end_of_stream() {
                    break;
                }
                reader.fill(Deadline::never()).unwrap();
                if reader.is_buffer_empty() && reader.is_end_of_stream() {
                    break;
                }
            }
            let frag = reader.pop_fragment().unwrap();
            match compactor.consume(frag, &mut builder).unwrap() {
                Step::Continue => {}
                Step::StopAfter => break,
                Step::StopBefore(frag) => {
                    reader.unpop_fragment(frag);
                    break;
                }
            }
        }
        builder.consume_end_of_stream()
    }

    #[test]
    fn test_full_scan_through_compaction() {
        let mut reader = reader_over(memtable_with(3, 4));
        let mut compactor = PageCompactor::new(
            Schema::new(TableId(1), "t", 1),
            100,
            u64::MAX,
            u64::MAX,
            u64::MAX,
        );
        let builder = MutationResultBuilder::new(ResultMemoryAccounter::new(1 << 20, true));
        let result = run_page(&mut reader, &mut compactor, builder);
        assert_eq!(result.partitions.len(), 3);
        assert_eq!(result.row_count(), 12);
        assert!(!compactor.are_limits_reached());
    }

    #[test]
    fn test_row_limit_leaves_reader_resumable() {
        let mut reader = reader_over(memtable_with(2, 4));
        let mut compactor = PageCompactor::new(
            Schema::new(TableId(1), "t", 1),
            100,
            5,
            u64::MAX,
            u64::MAX,
        );
        let builder = MutationResultBuilder::new(ResultMemoryAccounter::new(1 << 20, true));
        let first = run_page(&mut reader, &mut compactor, builder);
        assert_eq!(first.row_count(), 5);
        assert!(compactor.are_limits_reached());

        // A fresh compactor over the same reader picks up the rest.
        let mut compactor2 = PageCompactor::new(
            Schema::new(TableId(1), "t", 1),
            100,
            u64::MAX,
            u64::MAX,
            u64::MAX,
        );
        let builder2 = MutationResultBuilder::new(ResultMemoryAccounter::new(1 << 20, true));
        let rest = run_page(&mut reader, &mut compactor2, builder2);
        assert_eq!(rest.row_count(), 3);
    }

    #[test]
    fn test_data_builder_hides_deleted_partition() {
        let mt = memtable_with(2, 2);
        // Delete everything in one partition with a partition tombstone
        // newer than the rows.
        let doomed = PartitionKey::from_bytes(b"pk-0".to_vec());
        mt.set_partition_tombstone(doomed, Tombstone::new(50));

        let mut reader = reader_over(mt);
        let mut compactor = PageCompactor::new(
            Schema::new(TableId(1), "t", 1),
            100,
            u64::MAX,
            u64::MAX,
            u64::MAX,
        );
        let builder = DataResultBuilder::new(ResultMemoryAccounter::new(1 << 20, true));
        let result = run_page(&mut reader, &mut compactor, builder);
        assert_eq!(result.partitions.len(), 1);
        assert_eq!(result.row_count, 2);

        // The reconciling flavor keeps the dead rows.
        let mt = memtable_with(2, 2);
        mt.set_partition_tombstone(PartitionKey::from_bytes(b"pk-0".to_vec()), Tombstone::new(50));
        let mut reader = reader_over(mt);
        let mut compactor = PageCompactor::new(
            Schema::new(TableId(1), "t", 1),
            100,
            u64::MAX,
            u64::MAX,
            u64::MAX,
        );
        let builder = MutationResultBuilder::new(ResultMemoryAccounter::new(1 << 20, true));
        let result = run_page(&mut reader, &mut compactor, builder);
        assert_eq!(result.partitions.len(), 2);
        assert_eq!(result.live_row_count, 2);
    }
}
