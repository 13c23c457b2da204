//! Multishard mutation-query coordination.
//!
//! A client read may span many partitions and therefore many shards. The
//! coordinator merges the shards' fragment streams into one bounded page
//! and, when the client will page on, saves per-shard reader state so the
//! next page resumes in O(1) instead of re-scanning.
//!
//! Page lifecycle (`do_query`):
//! * build a `ReadContext`
//! * `lookup_readers()` finds saved readers from the previous page
//! * the combining reader fills the page through the compactor and builder
//! * closing the reader hands every shard reader back for saving
//! * `save_readers()` if the read is not finished
//! * `stop()` cleans up whatever was not saved, on error paths too

pub mod combining;
pub mod command;
pub mod database;
pub mod page;
pub mod querier_cache;
pub mod read_context;
pub mod shard;
pub mod stats;
pub mod trace;

pub use combining::{MultiRangeReader, MultishardCombiningReader, PageReader, ReaderLifecyclePolicy};
pub use command::ReadCommand;
pub use database::{CacheHitRate, Database, ShardHandle, Table};
pub use querier_cache::{Querier, QuerierCache};
pub use read_context::ReadContext;
pub use shard::{this_shard_id, ShardOwned, ShardRuntime};
pub use stats::{QueryStats, QueryStatsSnapshot};
pub use trace::{TraceEvent, TraceLog, TraceState};

use std::sync::Arc;

use merlin_common::deadline::Deadline;
use merlin_common::error::MerlinResult;
use merlin_storage::compact::PageCompactor;
use merlin_storage::range::RangeVector;
use merlin_storage::result::{
    DataResult, DataResultBuilder, MutationResultBuilder, PagedResult, ReconcilableResult,
    ResultBuilder, ResultMemoryAccounter,
};
use merlin_storage::schema::Schema;

use crate::page::consume_page;

/// Run one page of a mutation-level read across all shards. Returns the
/// reconcilable result and the table's saved-reader hit rate.
pub fn query_mutations_on_all_shards(
    db: &Arc<Database>,
    table_schema: &Arc<Schema>,
    cmd: ReadCommand,
    ranges: RangeVector,
    trace: TraceState,
    deadline: Deadline,
) -> MerlinResult<(ReconcilableResult, CacheHitRate)> {
    do_query_on_all_shards(
        db,
        table_schema,
        cmd,
        ranges,
        trace,
        deadline,
        MutationResultBuilder::new,
    )
}

/// Run one page of a data-level (client result) read across all shards.
pub fn query_data_on_all_shards(
    db: &Arc<Database>,
    table_schema: &Arc<Schema>,
    cmd: ReadCommand,
    ranges: RangeVector,
    trace: TraceState,
    deadline: Deadline,
) -> MerlinResult<(DataResult, CacheHitRate)> {
    do_query_on_all_shards(
        db,
        table_schema,
        cmd,
        ranges,
        trace,
        deadline,
        DataResultBuilder::new,
    )
}

fn do_query_on_all_shards<B, F>(
    db: &Arc<Database>,
    table_schema: &Arc<Schema>,
    cmd: ReadCommand,
    ranges: RangeVector,
    trace: TraceState,
    deadline: Deadline,
    make_builder: F,
) -> MerlinResult<(B::Output, CacheHitRate)>
where
    B: ResultBuilder,
    B::Output: Default,
    F: FnOnce(ResultMemoryAccounter) -> B,
{
    let query_schema = if cmd.slice.reversed {
        table_schema.make_reversed()
    } else {
        Arc::clone(table_schema)
    };
    let table = db.find_table(&query_schema)?;

    // Zero limits mean an empty result by construction; don't touch readers.
    if cmd.has_zero_limit() || ranges.is_empty() {
        return Ok((B::Output::default(), table.global_cache_hit_rate()));
    }

    let stats = Arc::clone(db.stats());
    let max_result_size = cmd
        .max_result_size
        .unwrap_or(db.config().default_max_result_size);
    let accounter = ResultMemoryAccounter::new(max_result_size, cmd.slice.allow_short_read);
    let builder = make_builder(accounter);

    match do_query(db, &query_schema, &cmd, &ranges, &trace, deadline, builder) {
        Ok(result) => {
            QueryStats::bump(&stats.total_reads);
            if result.is_short_read() {
                QueryStats::bump(&stats.short_mutation_queries);
            }
            Ok((result, table.global_cache_hit_rate()))
        }
        Err(e) => {
            QueryStats::bump(&stats.total_reads_failed);
            Err(e)
        }
    }
}

fn do_query<B: ResultBuilder>(
    db: &Arc<Database>,
    schema: &Arc<Schema>,
    cmd: &ReadCommand,
    ranges: &RangeVector,
    trace: &TraceState,
    deadline: Deadline,
    builder: B,
) -> MerlinResult<B::Output> {
    let ctx = ReadContext::new(
        Arc::clone(db),
        Arc::clone(schema),
        cmd.clone(),
        ranges.clone(),
        trace.clone(),
    )?;
    let result = run_page(db, &ctx, schema, cmd, ranges, trace, deadline, builder);
    // Cleanup runs on the success and error paths alike.
    ctx.stop();
    result
}

#[allow(clippy::too_many_arguments)]
fn run_page<B: ResultBuilder>(
    db: &Arc<Database>,
    ctx: &Arc<ReadContext>,
    schema: &Arc<Schema>,
    cmd: &ReadCommand,
    ranges: &RangeVector,
    trace: &TraceState,
    deadline: Deadline,
    builder: B,
) -> MerlinResult<B::Output> {
    ctx.lookup_readers(deadline)?;

    let combining = MultishardCombiningReader::new(
        Arc::clone(schema),
        ctx.permit().clone(),
        Arc::clone(ctx) as Arc<dyn ReaderLifecyclePolicy>,
        Arc::clone(db.runtime()),
        ranges[0].clone(),
        Arc::clone(&cmd.slice),
        trace.clone(),
        db.config().reader_buffer_bytes,
    );
    let mut reader = if ranges.len() > 1 {
        PageReader::Multi(MultiRangeReader::new(combining, ranges.clone()))
    } else {
        PageReader::Single(combining)
    };

    let mut compactor = PageCompactor::new(
        Arc::clone(schema),
        cmd.timestamp,
        cmd.row_limit,
        cmd.partition_limit,
        cmd.slice.per_partition_row_limit,
    );

    let page = match consume_page(&mut reader, &mut compactor, builder, deadline) {
        Ok(page) => page,
        Err(e) => {
            reader.close();
            return Err(e);
        }
    };
    trace.trace(|| format!("Page stats: {}", compactor.stats()));

    // Closing hands every shard reader back through destroy_reader, moving
    // it into the saving state with its unconsumed buffer.
    reader.close();

    if page.limits_reached || page.result.is_short_read() {
        ctx.save_readers(page.unconsumed, page.compaction_state, page.last_ckey);
    }
    Ok(page.result)
}
