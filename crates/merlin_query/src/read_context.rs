//! Read context: the per-page coordinator of a multishard read.
//!
//! Owns one state machine per shard reader and drives the page lifecycle:
//! look up saved readers, feed the combining reader through the lifecycle
//! policy, dismantle leftovers back onto their shards, save queriers for
//! the next page, and clean up whatever remains. A context lives for one
//! page; a new one is built per page.
//!
//! Shard reader states:
//!
//! ```text
//!               ( )    (O)
//!                |      ^
//!                |      |
//!          +-- inexistent --+
//!          |                |
//!      (1) |            (3) |
//!          |                |
//!   successful_lookup       |
//!      |         |          |
//!      |         |   (3)    |
//!      |         +-------> used
//!  (2) |                    |
//!      |                (4) |
//!      |                    |
//!      +--------------> saving
//!                           |
//!                          (O)
//!
//!   1) lookup_readers()   2) save_readers()
//!   3) create_reader()    4) destroy_reader()
//! ```

use std::sync::Arc;

use parking_lot::Mutex;

use merlin_common::barrier::Operation;
use merlin_common::deadline::Deadline;
use merlin_common::error::{MerlinError, MerlinResult, QueryError};
use merlin_common::types::{QueryId, ShardId};
use merlin_storage::compact::DetachedCompactionState;
use merlin_storage::fragment::MutationFragment;
use merlin_storage::keys::{ClusteringKey, DecoratedKey};
use merlin_storage::range::{RangeVector, TokenRange};
use merlin_storage::reader::{ShardReader, TrackedBuffer};
use merlin_storage::schema::Schema;
use merlin_storage::semaphore::{InactiveHandle, Permit, ReaderSemaphore};
use merlin_storage::slice::QuerySlice;

use crate::combining::{ReaderLifecyclePolicy, StoppedReader};
use crate::command::ReadCommand;
use crate::database::{Database, Table};
use crate::querier_cache::Querier;
use crate::shard::ShardOwned;
use crate::stats::QueryStats;
use crate::trace::TraceState;

/// State of one shard's reader across the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ReaderState {
    #[default]
    Inexistent,
    SuccessfulLookup,
    Used,
    Saving,
}

impl ReaderState {
    fn name(self) -> &'static str {
        match self {
            ReaderState::Inexistent => "inexistent",
            ReaderState::SuccessfulLookup => "successful_lookup",
            ReaderState::Used => "used",
            ReaderState::Saving => "saving",
        }
    }
}

/// The shard-owned half of a reader's state: everything that must be
/// created and destroyed on the shard it names.
struct RemoteParts {
    permit: Permit,
    range: TokenRange,
    slice: Arc<QuerySlice>,
    /// Marks a read in progress against schema mutations.
    #[allow(dead_code)]
    read_op: Operation,
    handle: Option<InactiveHandle>,
    /// Unconsumed fragments from the stopped reader.
    buffer: Option<TrackedBuffer>,
}

#[derive(Default)]
struct ReaderMeta {
    state: ReaderState,
    rparts: Option<ShardOwned<RemoteParts>>,
    /// Fragments dismantled off the combined buffer for this shard.
    dismantled_buffer: Option<TrackedBuffer>,
}

/// Accounting for one dismantling pass.
#[derive(Debug, Default, Clone)]
struct DismantleStats {
    partitions: u64,
    fragments: u64,
    bytes: u64,
    discarded_partitions: u64,
    discarded_fragments: u64,
    discarded_bytes: u64,
}

impl DismantleStats {
    fn add(&mut self, frag: &MutationFragment) {
        self.partitions += u64::from(frag.is_partition_start());
        self.fragments += 1;
        self.bytes += frag.memory_usage();
    }

    fn add_discarded(&mut self, frag: &MutationFragment) {
        self.discarded_partitions += u64::from(frag.is_partition_start());
        self.discarded_fragments += 1;
        self.discarded_bytes += frag.memory_usage();
    }
}

impl std::fmt::Display for DismantleStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "kept {} partitions/{} fragments/{} bytes, discarded {} partitions/{} fragments/{} bytes",
            self.partitions,
            self.fragments,
            self.bytes,
            self.discarded_partitions,
            self.discarded_fragments,
            self.discarded_bytes
        )
    }
}

/// Coordinator state for one page of a multishard read.
pub struct ReadContext {
    db: Arc<Database>,
    table: Arc<Table>,
    schema: Arc<Schema>,
    cmd: ReadCommand,
    ranges: RangeVector,
    trace: TraceState,
    /// Tracking-only permit billing the combined and dismantled buffers.
    permit: Permit,
    readers: Vec<Mutex<ReaderMeta>>,
    /// For handing clones of this context to shard-side closures.
    self_weak: std::sync::Weak<ReadContext>,
}

impl ReadContext {
    pub fn new(
        db: Arc<Database>,
        schema: Arc<Schema>,
        cmd: ReadCommand,
        ranges: RangeVector,
        trace: TraceState,
    ) -> MerlinResult<Arc<ReadContext>> {
        let table = db.find_table(&schema)?;
        let permit = db
            .semaphore(ShardId(0))
            .make_tracking_only_permit("multishard-mutation-query");
        let max_result_size = cmd
            .max_result_size
            .unwrap_or(db.config().default_max_result_size);
        permit.set_max_result_size(max_result_size);
        let readers = (0..db.shard_count())
            .map(|_| Mutex::new(ReaderMeta::default()))
            .collect();
        Ok(Arc::new_cyclic(|weak| ReadContext {
            db,
            table,
            schema,
            cmd,
            ranges,
            trace,
            permit,
            readers,
            self_weak: weak.clone(),
        }))
    }

    /// A strong handle to this context, for shipping into shard tasks.
    fn strong(&self) -> Arc<ReadContext> {
        self.self_weak.upgrade().expect("read context still alive")
    }

    pub fn permit(&self) -> &Permit {
        &self.permit
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    fn max_result_size(&self) -> u64 {
        self.cmd
            .max_result_size
            .unwrap_or(self.db.config().default_max_result_size)
    }

    fn query_id(&self) -> Option<QueryId> {
        self.cmd.query_id
    }

    /// Find saved readers from the previous page on every shard. No-op for
    /// stateless reads and first pages.
    pub fn lookup_readers(&self, deadline: Deadline) -> MerlinResult<()> {
        if self.cmd.is_stateless() || self.cmd.is_first_page {
            return Ok(());
        }
        let results = {
            let ctx = self.strong();
            self.db
                .runtime()
                .invoke_on_all(move |shard| ctx.lookup_one(shard, deadline))
        };
        for result in results {
            result??;
        }
        Ok(())
    }

    /// Runs on `shard`.
    fn lookup_one(&self, shard: ShardId, deadline: Deadline) -> MerlinResult<()> {
        deadline.check("querier cache lookup")?;
        let query_id = self.query_id().expect("stateful command");
        let querier = self.db.querier_cache(shard).lookup(
            query_id,
            &self.schema,
            &self.ranges,
            &self.cmd.slice,
            &self.trace,
        );
        let Some(querier) = querier else {
            self.table.record_querier_lookup(false);
            return Ok(());
        };

        let semaphore = self.db.semaphore(shard);
        if querier.permit.semaphore_id() != semaphore.id() {
            return Err(MerlinError::internal(format!(
                "looked-up reader belongs to a different semaphore than the one appropriate \
                 for this query class: permit semaphore {} vs {} ({})",
                querier.permit.semaphore_id(),
                semaphore.id(),
                semaphore.name()
            )));
        }
        self.table.record_querier_lookup(true);

        let handle = semaphore.register_inactive(querier.reader);
        let rparts = RemoteParts {
            permit: querier.permit,
            range: querier.range,
            slice: querier.slice,
            read_op: self.table.read_in_progress(),
            handle: Some(handle),
            buffer: None,
        };
        let mut rm = self.readers[shard.index()].lock();
        rm.state = ReaderState::SuccessfulLookup;
        rm.rparts = Some(ShardOwned::new(
            shard,
            Arc::clone(self.db.runtime()),
            rparts,
        ));
        Ok(())
    }

    fn dismantled_buffer_for<'a>(
        permit: &Permit,
        rm: &'a mut ReaderMeta,
    ) -> &'a mut TrackedBuffer {
        rm.dismantled_buffer
            .get_or_insert_with(|| TrackedBuffer::new(permit.clone()))
    }

    /// Split the merged page buffer back onto the shards its partitions came
    /// from. Walks tail to head so front-insertion preserves stream order.
    fn dismantle_combined_buffer(
        &self,
        mut buffer: TrackedBuffer,
        last_pkey: &Option<DecoratedKey>,
    ) -> DismantleStats {
        let sharder = self.schema.get_sharder();
        let mut scratch: Vec<MutationFragment> = Vec::new();
        let mut stats = DismantleStats::default();

        while let Some(frag) = buffer.pop_back() {
            let start_shard = match &frag {
                MutationFragment::PartitionStart { key, .. } => {
                    Some(sharder.shard_of(key.token))
                }
                _ => None,
            };
            let Some(shard) = start_shard else {
                scratch.push(frag);
                continue;
            };

            let mut rm = self.readers[shard.index()].lock();
            // The reader these fragments came from may be gone: stop
            // failed, or it was evicted.
            if rm.state != ReaderState::Saving {
                for f in scratch.drain(..) {
                    stats.add_discarded(&f);
                }
                stats.add_discarded(&frag);
                continue;
            }
            let shard_buffer = Self::dismantled_buffer_for(&self.permit, &mut rm);
            for f in scratch.drain(..) {
                stats.add(&f);
                shard_buffer.push_front(f);
            }
            stats.add(&frag);
            shard_buffer.push_front(frag);
        }

        // Whatever is left belongs to a partition whose start the page
        // already consumed; it goes to the last delivered partition's shard.
        if !scratch.is_empty() {
            let owner = last_pkey.as_ref().map(|pkey| sharder.shard_of(pkey.token));
            match owner {
                Some(shard) => {
                    let mut rm = self.readers[shard.index()].lock();
                    if rm.state == ReaderState::Saving {
                        let shard_buffer = Self::dismantled_buffer_for(&self.permit, &mut rm);
                        for f in scratch.drain(..) {
                            stats.add(&f);
                            shard_buffer.push_front(f);
                        }
                    } else {
                        for f in scratch.drain(..) {
                            stats.add_discarded(&f);
                        }
                    }
                }
                None => {
                    for f in scratch.drain(..) {
                        stats.add_discarded(&f);
                    }
                }
            }
        }
        stats
    }

    /// Put the in-progress partition's start, static row and open range
    /// tombstone back in front of its shard's buffer, so the resumed stream
    /// reads start, static row, tombstone, body.
    fn dismantle_compaction_state(&self, state: DetachedCompactionState) -> DismantleStats {
        let mut stats = DismantleStats::default();
        let Some((key, tombstone)) = state.partition_start else {
            return stats;
        };
        let shard = self.schema.get_sharder().shard_of(key.token);
        let partition_start = MutationFragment::PartitionStart { key, tombstone };

        let mut rm = self.readers[shard.index()].lock();
        if rm.state != ReaderState::Saving {
            if let Some(rtc) = state.current_tombstone {
                stats.add_discarded(&MutationFragment::RangeTombstoneChange(rtc));
            }
            if let Some(sr) = state.static_row {
                stats.add_discarded(&MutationFragment::StaticRow(sr));
            }
            stats.add_discarded(&partition_start);
            return stats;
        }

        let shard_buffer = Self::dismantled_buffer_for(&self.permit, &mut rm);
        if let Some(rtc) = state.current_tombstone {
            let frag = MutationFragment::RangeTombstoneChange(rtc);
            stats.add(&frag);
            shard_buffer.push_front(frag);
        }
        if let Some(sr) = state.static_row {
            let frag = MutationFragment::StaticRow(sr);
            stats.add(&frag);
            shard_buffer.push_front(frag);
        }
        stats.add(&partition_start);
        shard_buffer.push_front(partition_start);
        stats
    }

    /// Persist every shard's reader into its querier cache so the next page
    /// resumes where this one stopped. Failures never fail the read: they
    /// are logged and counted, and the next page sees a cache miss.
    pub fn save_readers(
        &self,
        unconsumed_buffer: TrackedBuffer,
        compaction_state: DetachedCompactionState,
        last_ckey: Option<ClusteringKey>,
    ) {
        if self.cmd.is_stateless() {
            return;
        }
        let last_pkey = compaction_state.last_pkey.clone();

        let cb_stats = self.dismantle_combined_buffer(unconsumed_buffer, &last_pkey);
        self.trace
            .trace(|| format!("Dismantled combined buffer: {}", cb_stats));

        let cs_stats = self.dismantle_compaction_state(compaction_state);
        self.trace
            .trace(|| format!("Dismantled compaction state: {}", cs_stats));

        let stats = Arc::clone(self.db.stats());
        let mut pending = Vec::new();
        for shard in self.db.runtime().shards() {
            let meta = {
                let mut rm = self.readers[shard.index()].lock();
                match rm.state {
                    ReaderState::SuccessfulLookup | ReaderState::Saving => {
                        std::mem::take(&mut *rm)
                    }
                    _ => continue,
                }
            };
            let ctx = self.strong();
            let last_pkey = last_pkey.clone();
            let last_ckey = last_ckey.clone();
            let submitted = self.db.runtime().submit_on(shard, move || {
                ctx.save_reader_on_shard(shard, meta, last_pkey, last_ckey)
            });
            match submitted {
                Ok(rx) => pending.push((shard, rx)),
                Err(e) => {
                    tracing::debug!("Failed to save reader on {}: {}", shard, e);
                    QueryStats::bump(&stats.multishard_query_failed_reader_saves);
                }
            }
        }
        for (shard, rx) in pending {
            let outcome = match rx.recv() {
                Ok(result) => result,
                Err(_) => Err(QueryError::ShardUnavailable(shard).into()),
            };
            if let Err(e) = outcome {
                // A lost save only costs the next page a rebuild.
                tracing::debug!("Failed to save reader on {}: {}", shard, e);
                QueryStats::bump(&stats.multishard_query_failed_reader_saves);
            }
        }
    }

    /// Runs on `shard`.
    fn save_reader_on_shard(
        &self,
        shard: ShardId,
        mut meta: ReaderMeta,
        last_pkey: Option<DecoratedKey>,
        last_ckey: Option<ClusteringKey>,
    ) -> MerlinResult<()> {
        let Some(mut owned) = meta.rparts.take() else {
            return Ok(());
        };
        let Some(mut rparts) = owned.take() else {
            return Ok(());
        };
        let Some(handle) = rparts.handle.take() else {
            return Ok(());
        };
        let semaphore = self.db.semaphore(shard);
        let Some(mut reader) = semaphore.unregister_inactive(handle) else {
            // Evicted since the page stopped; nothing to save.
            return Ok(());
        };

        let mut fragments: u64 = 0;
        let size_before = reader.buffer_bytes();
        if let Some(mut buf) = rparts.buffer.take() {
            fragments += buf.len() as u64;
            while let Some(frag) = buf.pop_back() {
                reader.unpop_fragment(frag);
            }
        }
        if let Some(mut dismantled) = meta.dismantled_buffer.take() {
            fragments += dismantled.len() as u64;
            while let Some(frag) = dismantled.pop_back() {
                reader.unpop_fragment(frag);
            }
        }
        let size_after = reader.buffer_bytes();

        let querier = Querier {
            schema_version: self.schema.version,
            ranges: self.ranges.clone(),
            range: rparts.range.clone(),
            slice: Arc::clone(&rparts.slice),
            permit: rparts.permit.clone(),
            reader,
            last_pkey,
            last_ckey,
        };
        self.db.querier_cache(shard).insert(
            self.query_id().expect("stateful command"),
            querier,
            &self.trace,
        )?;

        let stats = self.db.stats();
        QueryStats::add(&stats.multishard_query_unpopped_fragments, fragments);
        QueryStats::add(
            &stats.multishard_query_unpopped_bytes,
            size_after.saturating_sub(size_before),
        );
        Ok(())
    }

    /// Release everything the page still holds: remote parts, parked
    /// readers, dismantled buffers. Runs on the success and error paths and
    /// never fails.
    pub fn stop(&self) {
        let mut pending = Vec::new();
        for shard in self.db.runtime().shards() {
            let meta = {
                let mut rm = self.readers[shard.index()].lock();
                if rm.rparts.is_none() && rm.dismantled_buffer.is_none() {
                    *rm = ReaderMeta::default();
                    continue;
                }
                std::mem::take(&mut *rm)
            };
            let ctx = self.strong();
            match self
                .db
                .runtime()
                .submit_on(shard, move || ctx.stop_one(shard, meta))
            {
                Ok(rx) => pending.push((shard, rx)),
                Err(e) => tracing::warn!("failed to clean up readers on {}: {}", shard, e),
            }
        }
        for (shard, rx) in pending {
            if rx.recv().is_err() {
                tracing::warn!("shard {} did not confirm reader cleanup", shard);
            }
        }
    }

    /// Runs on `shard`.
    fn stop_one(&self, shard: ShardId, mut meta: ReaderMeta) {
        if let Some(mut dismantled) = meta.dismantled_buffer.take() {
            dismantled.clear();
        }
        let Some(mut owned) = meta.rparts.take() else {
            return;
        };
        let Some(mut rparts) = owned.take() else {
            return;
        };
        if let Some(handle) = rparts.handle.take() {
            if let Some(reader) = self.db.semaphore(shard).unregister_inactive(handle) {
                drop(reader);
            }
        }
        // Dropping the remote parts releases the permit, the read barrier
        // ticket and any leftover buffer.
    }

    #[cfg(test)]
    fn reader_state(&self, shard: ShardId) -> &'static str {
        self.readers[shard.index()].lock().state.name()
    }
}

impl ReaderLifecyclePolicy for ReadContext {
    fn create_reader(
        &self,
        shard: ShardId,
        permit: Permit,
        range: TokenRange,
        slice: Arc<QuerySlice>,
        _trace: &TraceState,
    ) -> MerlinResult<ShardReader> {
        let mut rm = self.readers[shard.index()].lock();

        if rm.state == ReaderState::Saving {
            let details = format!(
                "unexpected request to create reader for shard {}: expected `used`, \
                 `successful_lookup` or `inexistent` state, but found `{}`",
                shard,
                rm.state.name()
            );
            tracing::warn!("{}", details);
            return Err(QueryError::InvalidReaderState { shard, details }.into());
        }

        if rm.state == ReaderState::SuccessfulLookup {
            let handle = rm
                .rparts
                .as_mut()
                .expect("successful lookup has remote parts")
                .get_mut()
                .handle
                .take();
            if let Some(handle) = handle {
                if let Some(reader) = self.db.semaphore(shard).unregister_inactive(handle) {
                    rm.state = ReaderState::Used;
                    // The saved permit is the one obtain_reader_permit()
                    // returned for this shard; anything else is a bug.
                    if reader.permit() != &permit {
                        return Err(MerlinError::internal(
                            "create_reader: passed-in permit is different than saved \
                             reader's permit",
                        ));
                    }
                    return Ok(reader);
                }
            }
            // The saved reader was evicted mid-page; build a fresh one.
        }

        let new_parts = RemoteParts {
            permit: permit.clone(),
            range: range.clone(),
            slice: Arc::clone(&slice),
            read_op: self.table.read_in_progress(),
            handle: None,
            buffer: None,
        };
        match rm.rparts.as_mut() {
            Some(owned) => owned.replace(new_parts),
            None => {
                rm.rparts = Some(ShardOwned::new(
                    shard,
                    Arc::clone(self.db.runtime()),
                    new_parts,
                ))
            }
        }
        rm.state = ReaderState::Used;

        Ok(self.table.as_mutation_source(shard).make_reader(
            Arc::clone(&self.schema),
            permit,
            range,
            slice,
            self.db.config().reader_buffer_bytes,
        ))
    }

    fn update_read_range(&self, shard: ShardId, range: TokenRange) {
        let mut rm = self.readers[shard.index()].lock();
        match rm.rparts.as_mut() {
            Some(owned) => owned.get_mut().range = range,
            None => tracing::warn!(
                "update_read_range on {} without remote parts",
                shard
            ),
        }
    }

    fn obtain_reader_permit(
        &self,
        shard: ShardId,
        description: &'static str,
        deadline: Deadline,
    ) -> MerlinResult<Permit> {
        {
            let rm = self.readers[shard.index()].lock();
            if rm.state == ReaderState::SuccessfulLookup {
                let permit = rm
                    .rparts
                    .as_ref()
                    .expect("successful lookup has remote parts")
                    .get()
                    .permit
                    .clone();
                permit.set_max_result_size(self.max_result_size());
                return Ok(permit);
            }
        }
        let permit = self.db.semaphore(shard).make_permit(description, deadline)?;
        permit.set_max_result_size(self.max_result_size());
        Ok(permit)
    }

    fn destroy_reader(&self, shard: ShardId, stopped: StoppedReader) {
        let mut rm = self.readers[shard.index()].lock();
        if rm.state == ReaderState::Used {
            rm.state = ReaderState::Saving;
            let rparts = rm
                .rparts
                .as_mut()
                .expect("used state has remote parts")
                .get_mut();
            rparts.handle = stopped.handle;
            rparts.buffer = Some(stopped.unconsumed);
            return;
        }
        tracing::warn!(
            "unexpected request to dismantle reader in state `{}`: reader was not created \
             nor is in the process of being created",
            rm.state.name()
        );
        drop(rm);
        // Close the orphan rather than leak it in the inactive registry.
        if let Some(handle) = stopped.handle {
            if let Some(reader) = self.db.semaphore(shard).unregister_inactive(handle) {
                drop(reader);
            }
        }
    }

    fn semaphore(&self, shard: ShardId) -> Arc<ReaderSemaphore> {
        Arc::clone(self.db.semaphore(shard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use merlin_common::config::QueryConfig;

    fn context_for(db: &Arc<Database>) -> Arc<ReadContext> {
        let table = db.create_table("ctx-test");
        let cmd = ReadCommand::new(table.schema(), 100);
        ReadContext::new(
            Arc::clone(db),
            Arc::clone(table.schema()),
            cmd,
            vec![TokenRange::full()],
            TraceState::disabled(),
        )
        .unwrap()
    }

    #[test]
    fn test_states_start_inexistent() {
        let db = Database::new(3, QueryConfig::default());
        let table = db.create_table("t");
        let cmd = ReadCommand::new(table.schema(), 100);
        let ctx = ReadContext::new(
            Arc::clone(&db),
            Arc::clone(table.schema()),
            cmd,
            vec![TokenRange::full()],
            TraceState::disabled(),
        )
        .unwrap();
        for shard in db.runtime().shards() {
            assert_eq!(ctx.reader_state(shard), "inexistent");
        }
    }

    #[test]
    fn test_lookup_noop_for_stateless_and_first_page() {
        let db = Database::new(2, QueryConfig::default());
        let table = db.create_table("t");
        let stateless = ReadCommand::new(table.schema(), 100);
        let ctx = ReadContext::new(
            Arc::clone(&db),
            Arc::clone(table.schema()),
            stateless,
            vec![TokenRange::full()],
            TraceState::disabled(),
        )
        .unwrap();
        ctx.lookup_readers(Deadline::never()).unwrap();
        assert_eq!(QueryStats::get(&db.stats().querier_cache_lookups), 0);

        let first_page = ReadCommand::new(table.schema(), 100)
            .with_query_id(merlin_common::types::QueryId::next());
        let ctx = ReadContext::new(
            Arc::clone(&db),
            Arc::clone(table.schema()),
            first_page,
            vec![TokenRange::full()],
            TraceState::disabled(),
        )
        .unwrap();
        ctx.lookup_readers(Deadline::never()).unwrap();
        assert_eq!(QueryStats::get(&db.stats().querier_cache_lookups), 0);
    }

    #[test]
    fn test_stop_without_readers_is_noop() {
        let db = Database::new(2, QueryConfig::default());
        let ctx = context_for(&db);
        ctx.stop();
        ctx.stop(); // idempotent
    }

    #[test]
    fn test_destroy_in_wrong_state_closes_orphan() {
        let db = Database::new(1, QueryConfig::default());
        let table = db.create_table("t");
        let cmd = ReadCommand::new(table.schema(), 100);
        let ctx = ReadContext::new(
            Arc::clone(&db),
            Arc::clone(table.schema()),
            cmd,
            vec![TokenRange::full()],
            TraceState::disabled(),
        )
        .unwrap();

        // Fabricate a stopped reader while the slot is still inexistent.
        let shard = ShardId(0);
        let sem = Arc::clone(db.semaphore(shard));
        let ctx2 = Arc::clone(&ctx);
        db.runtime()
            .invoke_on(shard, move || {
                let permit = sem.make_permit("orphan", Deadline::never()).unwrap();
                let reader = ctx2
                    .table()
                    .as_mutation_source(shard)
                    .make_reader(
                        Arc::clone(ctx2.table().schema()),
                        permit.clone(),
                        TokenRange::full(),
                        Arc::new(QuerySlice::full()),
                        1024,
                    );
                let unconsumed = TrackedBuffer::new(permit);
                let handle = sem.register_inactive(reader);
                ctx2.destroy_reader(
                    shard,
                    StoppedReader {
                        handle: Some(handle),
                        unconsumed,
                    },
                );
            })
            .unwrap();

        assert_eq!(db.semaphore(shard).inactive_count(), 0);
        assert_eq!(db.semaphore(shard).active_reads(), 0);
        assert_eq!(ctx.reader_state(shard), "inexistent");
    }
}
