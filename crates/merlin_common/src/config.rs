use serde::{Deserialize, Serialize};

/// Tuning knobs for the multishard read path.
///
/// All limits are per shard unless noted otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Maximum concurrent admitted reads per shard.
    pub max_concurrent_reads: usize,
    /// Memory watermark for readers parked in the inactive registry.
    /// Exceeding it evicts the oldest inactive readers.
    pub max_inactive_read_memory: u64,
    /// Result-size cap applied when a command does not carry its own.
    pub default_max_result_size: u64,
    /// Fill target for reader buffers, in bytes. Fills stop once the buffer
    /// holds at least this much (never mid-fragment).
    pub reader_buffer_bytes: u64,
    /// How long a saved querier stays resumable.
    pub querier_cache_ttl_ms: u64,
    /// Hard cap on saved queriers per shard. Inserting past the cap is
    /// rejected and the save is dropped.
    pub querier_cache_max_entries: usize,
    /// Period of the background sweep that closes expired queriers.
    pub cache_reap_interval_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reads: 100,
            max_inactive_read_memory: 16 * 1024 * 1024, // 16MB
            default_max_result_size: 1024 * 1024,       // 1MB
            reader_buffer_bytes: 8 * 1024,              // 8KB
            querier_cache_ttl_ms: 10_000,
            querier_cache_max_entries: 128,
            cache_reap_interval_ms: 1_000,
        }
    }
}
