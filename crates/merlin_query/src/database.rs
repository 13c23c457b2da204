//! Database facade: tables, per-shard read infrastructure, background reap.
//!
//! Each shard owns a reader-concurrency semaphore and a querier cache; the
//! shard runtime owns the worker threads. A single background reaper closes
//! expired queriers across all shards, the same channel-and-thread shape as
//! the other background loops in this codebase.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use merlin_common::barrier::{OpBarrier, Operation};
use merlin_common::config::QueryConfig;
use merlin_common::error::{MerlinResult, StorageError};
use merlin_common::types::{ShardId, TableId};
use merlin_storage::fragment::{ClusteringRow, RangeTombstoneChange, StaticRow, Tombstone};
use merlin_storage::keys::{PartitionKey, Token};
use merlin_storage::memtable::ShardMemtable;
use merlin_storage::reader::MutationSource;
use merlin_storage::schema::Schema;
use merlin_storage::semaphore::ReaderSemaphore;

use crate::querier_cache::QuerierCache;
use crate::shard::ShardRuntime;
use crate::stats::QueryStats;

/// Fraction of recent lookups served from saved reader state, reported
/// alongside query results.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheHitRate(pub f32);

/// One table: schema plus per-shard memtables.
pub struct Table {
    schema: Arc<Schema>,
    shards: Vec<Arc<ShardMemtable>>,
    barrier: OpBarrier,
    querier_lookups: AtomicU64,
    querier_hits: AtomicU64,
}

impl Table {
    fn new(schema: Arc<Schema>) -> Table {
        let shards = (0..schema.shard_count)
            .map(|_| Arc::new(ShardMemtable::new()))
            .collect();
        Table {
            schema,
            shards,
            barrier: OpBarrier::new(),
            querier_lookups: AtomicU64::new(0),
            querier_hits: AtomicU64::new(0),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn as_mutation_source(&self, shard: ShardId) -> MutationSource {
        MutationSource::new(Arc::clone(&self.shards[shard.index()]))
    }

    pub fn memtable(&self, shard: ShardId) -> &Arc<ShardMemtable> {
        &self.shards[shard.index()]
    }

    /// Ticket marking a read in progress, so schema changes can wait out
    /// the current phase of readers.
    pub fn read_in_progress(&self) -> Operation {
        self.barrier.start_op()
    }

    pub fn reads_in_progress(&self) -> usize {
        self.barrier.in_flight()
    }

    pub fn record_querier_lookup(&self, hit: bool) {
        self.querier_lookups.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.querier_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn global_cache_hit_rate(&self) -> CacheHitRate {
        let lookups = self.querier_lookups.load(Ordering::Relaxed);
        if lookups == 0 {
            return CacheHitRate(0.0);
        }
        CacheHitRate(self.querier_hits.load(Ordering::Relaxed) as f32 / lookups as f32)
    }

    fn shard_of(&self, key: &PartitionKey) -> ShardId {
        self.schema.get_sharder().shard_of(Token::from_key(&key.0))
    }

    // Write path, routed to the owning shard's memtable.

    pub fn apply_row(&self, key: PartitionKey, row: ClusteringRow) {
        let shard = self.shard_of(&key);
        self.shards[shard.index()].upsert_row(key, row);
    }

    pub fn apply_partition_tombstone(&self, key: PartitionKey, tombstone: Tombstone) {
        let shard = self.shard_of(&key);
        self.shards[shard.index()].set_partition_tombstone(key, tombstone);
    }

    pub fn apply_static_row(&self, key: PartitionKey, static_row: StaticRow) {
        let shard = self.shard_of(&key);
        self.shards[shard.index()].set_static_row(key, static_row);
    }

    pub fn apply_range_tombstone(&self, key: PartitionKey, rtc: RangeTombstoneChange) {
        let shard = self.shard_of(&key);
        self.shards[shard.index()].add_range_tombstone(key, rtc);
    }
}

/// Per-shard read infrastructure.
pub struct ShardHandle {
    pub semaphore: Arc<ReaderSemaphore>,
    pub querier_cache: Arc<QuerierCache>,
}

struct ReaperControl {
    stop: Mutex<bool>,
    wakeup: Condvar,
}

/// The node-local database handle.
pub struct Database {
    config: QueryConfig,
    runtime: Arc<ShardRuntime>,
    shards: Vec<ShardHandle>,
    tables: DashMap<TableId, Arc<Table>>,
    next_table_id: AtomicU64,
    stats: Arc<QueryStats>,
    reaper_control: Arc<ReaperControl>,
    reaper: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Database {
    pub fn new(shard_count: u64, config: QueryConfig) -> Arc<Database> {
        let runtime = ShardRuntime::new(shard_count);
        let stats = Arc::new(QueryStats::default());
        let shards: Vec<ShardHandle> = (0..shard_count)
            .map(|shard| {
                let semaphore = ReaderSemaphore::new(
                    format!("user-reads-{shard}"),
                    config.max_concurrent_reads,
                    config.max_inactive_read_memory,
                );
                let querier_cache = Arc::new(QuerierCache::new(
                    ShardId(shard),
                    Arc::clone(&semaphore),
                    Duration::from_millis(config.querier_cache_ttl_ms),
                    config.querier_cache_max_entries,
                    Arc::clone(&stats),
                ));
                ShardHandle {
                    semaphore,
                    querier_cache,
                }
            })
            .collect();

        let reaper_control = Arc::new(ReaperControl {
            stop: Mutex::new(false),
            wakeup: Condvar::new(),
        });
        let reaper = {
            let control = Arc::clone(&reaper_control);
            let caches: Vec<Arc<QuerierCache>> = shards
                .iter()
                .map(|s| Arc::clone(&s.querier_cache))
                .collect();
            let interval = Duration::from_millis(config.cache_reap_interval_ms.max(1));
            std::thread::Builder::new()
                .name("merlin-querier-reaper".into())
                .spawn(move || loop {
                    {
                        let mut stop = control.stop.lock();
                        if *stop {
                            return;
                        }
                        control.wakeup.wait_for(&mut stop, interval);
                        if *stop {
                            return;
                        }
                    }
                    for cache in &caches {
                        cache.reap_expired();
                    }
                })
                .expect("failed to spawn querier reaper")
        };

        Arc::new(Database {
            config,
            runtime,
            shards,
            tables: DashMap::new(),
            next_table_id: AtomicU64::new(1),
            stats,
            reaper_control,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<ShardRuntime> {
        &self.runtime
    }

    pub fn shard_count(&self) -> u64 {
        self.runtime.shard_count()
    }

    pub fn stats(&self) -> &Arc<QueryStats> {
        &self.stats
    }

    pub fn semaphore(&self, shard: ShardId) -> &Arc<ReaderSemaphore> {
        &self.shards[shard.index()].semaphore
    }

    pub fn querier_cache(&self, shard: ShardId) -> &Arc<QuerierCache> {
        &self.shards[shard.index()].querier_cache
    }

    pub fn create_table(&self, name: impl Into<String>) -> Arc<Table> {
        let id = TableId(self.next_table_id.fetch_add(1, Ordering::Relaxed));
        let schema = Schema::new(id, name, self.shard_count());
        let table = Arc::new(Table::new(schema));
        self.tables.insert(id, Arc::clone(&table));
        table
    }

    /// The table a schema refers to. Version skew within a table is fine
    /// here; per-query version checks happen against saved reader state.
    pub fn find_table(&self, schema: &Schema) -> MerlinResult<Arc<Table>> {
        self.tables
            .get(&schema.table_id)
            .map(|t| Arc::clone(t.value()))
            .ok_or_else(|| StorageError::UnknownTable(schema.table_id).into())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        *self.reaper_control.stop.lock() = true;
        self.reaper_control.wakeup.notify_all();
        if let Some(handle) = self.reaper.lock().take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("shards", &self.shards.len())
            .field("tables", &self.tables.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use merlin_storage::fragment::Cell;
    use merlin_storage::keys::ClusteringKey;

    fn row(ck: u8) -> ClusteringRow {
        ClusteringRow {
            key: ClusteringKey::from_bytes(vec![ck]),
            tombstone: None,
            cells: vec![Cell::new(0, 1, b"v".to_vec())],
        }
    }

    #[test]
    fn test_writes_route_to_owning_shard() {
        use merlin_storage::range::TokenRange;
        use merlin_storage::slice::QuerySlice;

        let db = Database::new(4, QueryConfig::default());
        let table = db.create_table("events");
        let sharder = table.schema().get_sharder();
        for i in 0..32u32 {
            let pk = PartitionKey::from_bytes(format!("pk-{i}"));
            table.apply_row(pk, row(0));
        }
        let mut total = 0;
        for shard in db.runtime().shards() {
            let mt = table.memtable(shard);
            let mut cursor = None;
            while let Some((key, _)) = mt.next_partition_fragments(
                &TokenRange::full(),
                &QuerySlice::full(),
                cursor.as_ref(),
            ) {
                assert_eq!(sharder.shard_of(key.token), shard);
                total += 1;
                cursor = Some(key);
            }
        }
        assert_eq!(total, 32);
    }

    #[test]
    fn test_find_table_unknown_errors() {
        let db = Database::new(2, QueryConfig::default());
        let schema = Schema::new(TableId(999), "ghost", 2);
        assert!(db.find_table(&schema).is_err());
    }

    #[test]
    fn test_read_barrier_counts_reads() {
        let db = Database::new(2, QueryConfig::default());
        let table = db.create_table("t");
        assert_eq!(table.reads_in_progress(), 0);
        let op = table.read_in_progress();
        assert_eq!(table.reads_in_progress(), 1);
        drop(op);
        assert_eq!(table.reads_in_progress(), 0);
    }

    #[test]
    fn test_cache_hit_rate_zero_without_lookups() {
        let db = Database::new(2, QueryConfig::default());
        let table = db.create_table("t");
        assert_eq!(table.global_cache_hit_rate(), CacheHitRate(0.0));
        table.record_querier_lookup(true);
        table.record_querier_lookup(false);
        assert_eq!(table.global_cache_hit_rate(), CacheHitRate(0.5));
    }

    #[test]
    fn test_reaper_thread_stops_on_drop() {
        let db = Database::new(1, QueryConfig::default());
        drop(db);
        // Dropping must not hang on the reaper join.
    }
}
