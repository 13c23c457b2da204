//! Read commands.

use std::sync::Arc;

use merlin_common::types::{QueryId, SchemaVersion};
use merlin_storage::schema::Schema;
use merlin_storage::slice::QuerySlice;

/// Immutable description of one read, shared by all of its pages.
#[derive(Debug, Clone)]
pub struct ReadCommand {
    /// Absent for stateless (one-shot) reads: no reader state is looked up
    /// or saved.
    pub query_id: Option<QueryId>,
    pub schema_version: SchemaVersion,
    pub slice: Arc<QuerySlice>,
    pub row_limit: u64,
    pub partition_limit: u64,
    /// Falls back to the configured default when absent.
    pub max_result_size: Option<u64>,
    /// The first page of a stateful read skips the cache lookup.
    pub is_first_page: bool,
    /// Snapshot timestamp the read compacts at.
    pub timestamp: i64,
}

impl ReadCommand {
    pub fn new(schema: &Schema, timestamp: i64) -> ReadCommand {
        ReadCommand {
            query_id: None,
            schema_version: schema.version,
            slice: Arc::new(QuerySlice::full()),
            row_limit: u64::MAX,
            partition_limit: u64::MAX,
            max_result_size: None,
            is_first_page: true,
            timestamp,
        }
    }

    pub fn with_query_id(mut self, query_id: QueryId) -> ReadCommand {
        self.query_id = Some(query_id);
        self
    }

    pub fn with_slice(mut self, slice: QuerySlice) -> ReadCommand {
        self.slice = Arc::new(slice);
        self
    }

    pub fn with_row_limit(mut self, row_limit: u64) -> ReadCommand {
        self.row_limit = row_limit;
        self
    }

    pub fn with_partition_limit(mut self, partition_limit: u64) -> ReadCommand {
        self.partition_limit = partition_limit;
        self
    }

    pub fn with_max_result_size(mut self, bytes: u64) -> ReadCommand {
        self.max_result_size = Some(bytes);
        self
    }

    /// The same command for a continuation page.
    pub fn next_page(mut self) -> ReadCommand {
        self.is_first_page = false;
        self
    }

    pub fn is_stateless(&self) -> bool {
        self.query_id.is_none()
    }

    /// A zero limit anywhere means the result is empty by construction.
    pub fn has_zero_limit(&self) -> bool {
        self.row_limit == 0 || self.partition_limit == 0 || self.slice.per_partition_row_limit == 0
    }
}
