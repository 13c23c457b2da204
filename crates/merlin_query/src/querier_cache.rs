//! Per-shard cache of suspended readers from previous pages.
//!
//! A saved querier is the reader's resume state: positions, ranges, slice
//! and permit. The reader itself is parked in the shard's semaphore, so
//! memory-pressure eviction applies to cached readers like to any other
//! inactive read; a dead handle at lookup time is a miss.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use merlin_common::error::{MerlinResult, QueryError};
use merlin_common::types::{QueryId, SchemaVersion, ShardId};
use merlin_storage::keys::{ClusteringKey, DecoratedKey};
use merlin_storage::range::{is_range_suffix, RangeVector, TokenRange};
use merlin_storage::reader::ShardReader;
use merlin_storage::schema::Schema;
use merlin_storage::semaphore::{InactiveHandle, Permit, ReaderSemaphore};
use merlin_storage::slice::QuerySlice;

use crate::stats::QueryStats;
use crate::trace::TraceState;

/// A suspended reader plus everything needed to resume it.
pub struct Querier {
    pub schema_version: SchemaVersion,
    /// The full range vector the query was started with.
    pub ranges: RangeVector,
    /// The range the reader is currently positioned in.
    pub range: TokenRange,
    pub slice: Arc<QuerySlice>,
    pub permit: Permit,
    pub reader: ShardReader,
    pub last_pkey: Option<DecoratedKey>,
    pub last_ckey: Option<ClusteringKey>,
}

struct CacheEntry {
    schema_version: SchemaVersion,
    ranges: RangeVector,
    range: TokenRange,
    slice: Arc<QuerySlice>,
    permit: Permit,
    handle: InactiveHandle,
    last_pkey: Option<DecoratedKey>,
    last_ckey: Option<ClusteringKey>,
    inserted_at: Instant,
}

/// Keyed store of suspended readers for one shard.
pub struct QuerierCache {
    shard: ShardId,
    semaphore: Arc<ReaderSemaphore>,
    entries: Mutex<HashMap<QueryId, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
    stats: Arc<QueryStats>,
}

impl QuerierCache {
    pub fn new(
        shard: ShardId,
        semaphore: Arc<ReaderSemaphore>,
        ttl: Duration,
        max_entries: usize,
        stats: Arc<QueryStats>,
    ) -> QuerierCache {
        QuerierCache {
            shard,
            semaphore,
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries,
            stats,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, query_id: QueryId) -> bool {
        self.entries.lock().contains_key(&query_id)
    }

    /// Store a querier under `query_id`. An existing entry under the key is
    /// closed first. Fails when the cache is full; save paths swallow that.
    pub fn insert(
        &self,
        query_id: QueryId,
        querier: Querier,
        trace: &TraceState,
    ) -> MerlinResult<()> {
        let mut entries = self.entries.lock();
        if let Some(previous) = entries.remove(&query_id) {
            self.close_entry(previous);
        }
        if entries.len() >= self.max_entries {
            return Err(QueryError::AdmissionRejected(format!(
                "querier cache on {} is full ({} entries)",
                self.shard, self.max_entries
            ))
            .into());
        }
        let handle = self.semaphore.register_inactive(querier.reader);
        entries.insert(
            query_id,
            CacheEntry {
                schema_version: querier.schema_version,
                ranges: querier.ranges,
                range: querier.range,
                slice: querier.slice,
                permit: querier.permit,
                handle,
                last_pkey: querier.last_pkey,
                last_ckey: querier.last_ckey,
                inserted_at: Instant::now(),
            },
        );
        trace.trace(|| format!("Saved querier for {} on {}", query_id, self.shard));
        Ok(())
    }

    /// Return the saved querier for `query_id` if it is still live and
    /// compatible with the request; drop it otherwise.
    pub fn lookup(
        &self,
        query_id: QueryId,
        schema: &Schema,
        ranges: &[TokenRange],
        slice: &QuerySlice,
        trace: &TraceState,
    ) -> Option<Querier> {
        QueryStats::bump(&self.stats.querier_cache_lookups);
        let entry = {
            let mut entries = self.entries.lock();
            match entries.remove(&query_id) {
                Some(entry) => entry,
                None => {
                    QueryStats::bump(&self.stats.querier_cache_misses);
                    return None;
                }
            }
        };

        if entry.schema_version != schema.version
            || !is_range_suffix(&entry.ranges, ranges)
            || !entry.slice.compatible_with(slice)
        {
            trace.trace(|| {
                format!(
                    "Dropping incompatible querier for {} on {}",
                    query_id, self.shard
                )
            });
            QueryStats::bump(&self.stats.querier_cache_drops);
            self.close_entry(entry);
            return None;
        }

        match self.semaphore.unregister_inactive(entry.handle) {
            Some(reader) => Some(Querier {
                schema_version: entry.schema_version,
                ranges: entry.ranges,
                range: entry.range,
                slice: entry.slice,
                permit: entry.permit,
                reader,
                last_pkey: entry.last_pkey,
                last_ckey: entry.last_ckey,
            }),
            None => {
                // Evicted under memory pressure since it was saved.
                trace.trace(|| {
                    format!("Saved reader for {} on {} was evicted", query_id, self.shard)
                });
                QueryStats::bump(&self.stats.querier_cache_misses);
                None
            }
        }
    }

    /// Drop the entry for `query_id`, closing its reader. Returns whether an
    /// entry existed.
    pub fn evict(&self, query_id: QueryId) -> bool {
        let entry = self.entries.lock().remove(&query_id);
        match entry {
            Some(entry) => {
                self.close_entry(entry);
                true
            }
            None => false,
        }
    }

    /// Close entries older than the TTL. Runs from the background reaper.
    pub fn reap_expired(&self) {
        let now = Instant::now();
        let expired: Vec<CacheEntry> = {
            let mut entries = self.entries.lock();
            let dead: Vec<QueryId> = entries
                .iter()
                .filter(|(_, e)| now.duration_since(e.inserted_at) >= self.ttl)
                .map(|(id, _)| *id)
                .collect();
            dead.into_iter()
                .filter_map(|id| entries.remove(&id))
                .collect()
        };
        for entry in expired {
            QueryStats::bump(&self.stats.querier_cache_time_based_evictions);
            tracing::debug!("querier cache on {}: reaping expired entry", self.shard);
            self.close_entry(entry);
        }
    }

    fn close_entry(&self, entry: CacheEntry) {
        if let Some(reader) = self.semaphore.unregister_inactive(entry.handle) {
            drop(reader);
        }
        drop(entry.permit);
    }
}

impl std::fmt::Debug for QuerierCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuerierCache")
            .field("shard", &self.shard)
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use merlin_common::deadline::Deadline;
    use merlin_common::types::TableId;
    use merlin_storage::memtable::ShardMemtable;

    fn fixture() -> (Arc<ReaderSemaphore>, Arc<Schema>, QuerierCache) {
        let sem = ReaderSemaphore::new("cache-test", 8, 1 << 20);
        let schema = Schema::new(TableId(1), "t", 1);
        let cache = QuerierCache::new(
            ShardId(0),
            Arc::clone(&sem),
            Duration::from_secs(60),
            4,
            Arc::new(QueryStats::default()),
        );
        (sem, schema, cache)
    }

    fn querier_for(sem: &Arc<ReaderSemaphore>, schema: &Arc<Schema>) -> Querier {
        let permit = sem.make_permit("q", Deadline::never()).unwrap();
        let reader = ShardReader::new(
            Arc::clone(schema),
            permit.clone(),
            Arc::new(ShardMemtable::new()),
            TokenRange::full(),
            Arc::new(QuerySlice::full()),
            1024,
        );
        Querier {
            schema_version: schema.version,
            ranges: vec![TokenRange::full()],
            range: TokenRange::full(),
            slice: Arc::new(QuerySlice::full()),
            permit,
            reader,
            last_pkey: None,
            last_ckey: None,
        }
    }

    #[test]
    fn test_insert_then_lookup_round_trip() {
        let (sem, schema, cache) = fixture();
        let id = QueryId::next();
        cache
            .insert(id, querier_for(&sem, &schema), &TraceState::disabled())
            .unwrap();
        assert_eq!(cache.len(), 1);
        let found = cache.lookup(
            id,
            &schema,
            &[TokenRange::full()],
            &QuerySlice::full(),
            &TraceState::disabled(),
        );
        assert!(found.is_some());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lookup_miss_on_unknown_id() {
        let (_sem, schema, cache) = fixture();
        assert!(cache
            .lookup(
                QueryId::next(),
                &schema,
                &[TokenRange::full()],
                &QuerySlice::full(),
                &TraceState::disabled(),
            )
            .is_none());
    }

    #[test]
    fn test_schema_version_mismatch_drops_entry() {
        let (sem, schema, cache) = fixture();
        let id = QueryId::next();
        cache
            .insert(id, querier_for(&sem, &schema), &TraceState::disabled())
            .unwrap();
        let mut newer = (*schema).clone();
        newer.version = SchemaVersion(2);
        assert!(cache
            .lookup(
                id,
                &newer,
                &[TokenRange::full()],
                &QuerySlice::full(),
                &TraceState::disabled(),
            )
            .is_none());
        assert!(cache.is_empty(), "incompatible entry must be dropped");
    }

    #[test]
    fn test_incompatible_slice_drops_entry() {
        let (sem, schema, cache) = fixture();
        let id = QueryId::next();
        cache
            .insert(id, querier_for(&sem, &schema), &TraceState::disabled())
            .unwrap();
        let reversed = QuerySlice::full().reversed();
        assert!(cache
            .lookup(
                id,
                &schema,
                &[TokenRange::full()],
                &reversed,
                &TraceState::disabled(),
            )
            .is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evicted_reader_is_a_miss() {
        let (sem, schema, cache) = fixture();
        let id = QueryId::next();
        cache
            .insert(id, querier_for(&sem, &schema), &TraceState::disabled())
            .unwrap();
        assert!(sem.evict_oldest_inactive());
        assert!(cache
            .lookup(
                id,
                &schema,
                &[TokenRange::full()],
                &QuerySlice::full(),
                &TraceState::disabled(),
            )
            .is_none());
    }

    #[test]
    fn test_insert_replaces_existing_entry() {
        let (sem, schema, cache) = fixture();
        let id = QueryId::next();
        cache
            .insert(id, querier_for(&sem, &schema), &TraceState::disabled())
            .unwrap();
        cache
            .insert(id, querier_for(&sem, &schema), &TraceState::disabled())
            .unwrap();
        assert_eq!(cache.len(), 1);
        // The replaced reader was closed, not leaked into the registry.
        assert_eq!(sem.inactive_count(), 1);
    }

    #[test]
    fn test_full_cache_rejects_insert() {
        let (sem, schema, cache) = fixture();
        for _ in 0..4 {
            cache
                .insert(QueryId::next(), querier_for(&sem, &schema), &TraceState::disabled())
                .unwrap();
        }
        let err = cache
            .insert(QueryId::next(), querier_for(&sem, &schema), &TraceState::disabled())
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_reap_expired_closes_old_entries() {
        let sem = ReaderSemaphore::new("cache-test", 8, 1 << 20);
        let schema = Schema::new(TableId(1), "t", 1);
        let stats = Arc::new(QueryStats::default());
        let cache = QuerierCache::new(
            ShardId(0),
            Arc::clone(&sem),
            Duration::ZERO,
            4,
            Arc::clone(&stats),
        );
        cache
            .insert(QueryId::next(), querier_for(&sem, &schema), &TraceState::disabled())
            .unwrap();
        cache.reap_expired();
        assert!(cache.is_empty());
        assert_eq!(sem.inactive_count(), 0);
        assert_eq!(
            QueryStats::get(&stats.querier_cache_time_based_evictions),
            1
        );
    }
}
