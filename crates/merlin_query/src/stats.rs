//! Read-path counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Node-wide counters bumped by the multishard read path.
#[derive(Debug, Default)]
pub struct QueryStats {
    /// Completed multishard reads.
    pub total_reads: AtomicU64,
    /// Multishard reads that surfaced an error.
    pub total_reads_failed: AtomicU64,
    /// Mutation reads terminated by the size cap.
    pub short_mutation_queries: AtomicU64,
    /// Fragments pushed back into saved readers.
    pub multishard_query_unpopped_fragments: AtomicU64,
    /// Bytes pushed back into saved readers.
    pub multishard_query_unpopped_bytes: AtomicU64,
    /// Reader saves that failed; the read still succeeded.
    pub multishard_query_failed_reader_saves: AtomicU64,
    /// Querier-cache lookups.
    pub querier_cache_lookups: AtomicU64,
    /// Lookups that found nothing usable.
    pub querier_cache_misses: AtomicU64,
    /// Cached entries dropped because they no longer matched the request.
    pub querier_cache_drops: AtomicU64,
    /// Cached entries closed by the TTL reaper.
    pub querier_cache_time_based_evictions: AtomicU64,
}

impl QueryStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> QueryStatsSnapshot {
        QueryStatsSnapshot {
            total_reads: Self::get(&self.total_reads),
            total_reads_failed: Self::get(&self.total_reads_failed),
            short_mutation_queries: Self::get(&self.short_mutation_queries),
            multishard_query_unpopped_fragments: Self::get(
                &self.multishard_query_unpopped_fragments,
            ),
            multishard_query_unpopped_bytes: Self::get(&self.multishard_query_unpopped_bytes),
            multishard_query_failed_reader_saves: Self::get(
                &self.multishard_query_failed_reader_saves,
            ),
            querier_cache_lookups: Self::get(&self.querier_cache_lookups),
            querier_cache_misses: Self::get(&self.querier_cache_misses),
            querier_cache_drops: Self::get(&self.querier_cache_drops),
            querier_cache_time_based_evictions: Self::get(
                &self.querier_cache_time_based_evictions,
            ),
        }
    }
}

/// Point-in-time copy of `QueryStats` for observability endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryStatsSnapshot {
    pub total_reads: u64,
    pub total_reads_failed: u64,
    pub short_mutation_queries: u64,
    pub multishard_query_unpopped_fragments: u64,
    pub multishard_query_unpopped_bytes: u64,
    pub multishard_query_failed_reader_saves: u64,
    pub querier_cache_lookups: u64,
    pub querier_cache_misses: u64,
    pub querier_cache_drops: u64,
    pub querier_cache_time_based_evictions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = QueryStats::default();
        QueryStats::bump(&stats.total_reads);
        QueryStats::add(&stats.multishard_query_unpopped_bytes, 128);
        let snap = stats.snapshot();
        assert_eq!(snap.total_reads, 1);
        assert_eq!(snap.multishard_query_unpopped_bytes, 128);
        assert_eq!(snap.total_reads_failed, 0);
    }
}
