//! Multishard combining reader and the multi-range wrapper.
//!
//! The combining reader merges per-shard fragment streams into one stream
//! ordered by `(token, partition key)`. Shard readers are created lazily
//! through the reader-lifecycle policy, operated on their owning shard via
//! the shard runtime, and handed back through `destroy_reader` when the
//! page is over. Within a partition every fragment comes from the owning
//! shard, so merging only ever decides between `partition_start` heads.

use std::sync::Arc;

use merlin_common::deadline::Deadline;
use merlin_common::error::{MerlinError, MerlinResult};
use merlin_common::types::ShardId;
use merlin_storage::fragment::MutationFragment;
use merlin_storage::keys::DecoratedKey;
use merlin_storage::range::{RangeVector, TokenRange};
use merlin_storage::reader::{ShardReader, TrackedBuffer};
use merlin_storage::schema::Schema;
use merlin_storage::semaphore::{InactiveHandle, Permit, ReaderSemaphore};
use merlin_storage::slice::QuerySlice;

use crate::shard::ShardRuntime;
use crate::trace::TraceState;

/// A shard reader handed back to the coordinator after its page ended:
/// parked in the semaphore, with whatever the merge had not yet consumed.
pub struct StoppedReader {
    pub handle: Option<InactiveHandle>,
    pub unconsumed: TrackedBuffer,
}

/// Coordinator capabilities the combining reader needs. All methods run on
/// the shard they name.
pub trait ReaderLifecyclePolicy: Send + Sync + 'static {
    /// Build a reader covering `shard`'s partitions within `range`.
    fn create_reader(
        &self,
        shard: ShardId,
        permit: Permit,
        range: TokenRange,
        slice: Arc<QuerySlice>,
        trace: &TraceState,
    ) -> MerlinResult<ShardReader>;

    /// The shard's current read range advanced (multi-range iteration).
    fn update_read_range(&self, shard: ShardId, range: TokenRange);

    /// Permit for a new reader on `shard`; honors saved-reader permit reuse.
    fn obtain_reader_permit(
        &self,
        shard: ShardId,
        description: &'static str,
        deadline: Deadline,
    ) -> MerlinResult<Permit>;

    /// Take back a stopped reader; executes the used → saving transition.
    fn destroy_reader(&self, shard: ShardId, stopped: StoppedReader);

    fn semaphore(&self, shard: ShardId) -> Arc<ReaderSemaphore>;
}

struct ShardStream {
    reader: Option<ShardReader>,
    /// Fragments already pulled off the shard, waiting to be merged.
    buf: TrackedBuffer,
    eos: bool,
}

/// Merges the per-shard streams of one token range.
pub struct MultishardCombiningReader {
    schema: Arc<Schema>,
    permit: Permit,
    policy: Arc<dyn ReaderLifecyclePolicy>,
    runtime: Arc<ShardRuntime>,
    range: TokenRange,
    slice: Arc<QuerySlice>,
    trace: TraceState,
    fill_target: u64,
    slots: Vec<Option<ShardStream>>,
    buffer: TrackedBuffer,
    /// Shard currently being drained; locked until its `partition_end`.
    current_shard: Option<usize>,
    end_of_stream: bool,
    closed: bool,
}

impl MultishardCombiningReader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        schema: Arc<Schema>,
        permit: Permit,
        policy: Arc<dyn ReaderLifecyclePolicy>,
        runtime: Arc<ShardRuntime>,
        range: TokenRange,
        slice: Arc<QuerySlice>,
        trace: TraceState,
        fill_target: u64,
    ) -> MultishardCombiningReader {
        let slots = (0..runtime.shard_count()).map(|_| None).collect();
        let buffer = TrackedBuffer::new(permit.clone());
        MultishardCombiningReader {
            schema,
            permit,
            policy,
            runtime,
            range,
            slice,
            trace,
            fill_target,
            slots,
            buffer,
            current_shard: None,
            end_of_stream: false,
            closed: false,
        }
    }

    pub fn permit(&self) -> &Permit {
        &self.permit
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    pub fn is_buffer_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn pop_fragment(&mut self) -> Option<MutationFragment> {
        self.buffer.pop_front()
    }

    pub fn unpop_fragment(&mut self, frag: MutationFragment) {
        self.buffer.push_front(frag);
    }

    pub fn detach_buffer(&mut self) -> TrackedBuffer {
        std::mem::replace(&mut self.buffer, TrackedBuffer::new(self.permit.clone()))
    }

    /// Fill the merged buffer up to the fill target. Guarantees at least
    /// one fragment unless the stream is exhausted.
    pub fn fill(&mut self, deadline: Deadline) -> MerlinResult<()> {
        while !self.end_of_stream && self.buffer.bytes() < self.fill_target {
            deadline.check("multishard buffer fill")?;
            match self.current_shard {
                Some(i) => self.advance_current(i, deadline)?,
                None => self.pick_next_shard(deadline)?,
            }
        }
        Ok(())
    }

    /// Move one fragment of the partition being drained into the merged
    /// buffer; unlock the shard at `partition_end`.
    fn advance_current(&mut self, i: usize, deadline: Deadline) -> MerlinResult<()> {
        self.refill_stream(i, deadline)?;
        let stream = self.slots[i].as_mut().expect("current stream exists");
        let frag = match stream.buf.pop_front() {
            Some(frag) => frag,
            None => {
                return Err(MerlinError::internal(format!(
                    "shard {} stream ended mid-partition",
                    i
                )));
            }
        };
        if matches!(frag, MutationFragment::PartitionEnd) {
            self.current_shard = None;
        }
        self.buffer.push_back(frag);
        Ok(())
    }

    /// Choose the shard owning the smallest next partition, creating and
    /// filling shard readers as needed.
    fn pick_next_shard(&mut self, deadline: Deadline) -> MerlinResult<()> {
        let mut best: Option<(usize, DecoratedKey)> = None;
        for i in 0..self.slots.len() {
            self.ensure_stream(i, deadline)?;
            self.refill_stream(i, deadline)?;
            let stream = self.slots[i].as_ref().expect("stream just ensured");
            let head = match stream.buf.front() {
                Some(head) => head,
                None => continue, // exhausted
            };
            let key = match head {
                MutationFragment::PartitionStart { key, .. } => key.clone(),
                other => {
                    return Err(MerlinError::internal(format!(
                        "shard {} stream not aligned at partition boundary (head is {})",
                        i,
                        other.kind_name()
                    )));
                }
            };
            let better = match &best {
                Some((_, best_key)) => key < *best_key,
                None => true,
            };
            if better {
                best = Some((i, key));
            }
        }
        match best {
            Some((i, _)) => self.current_shard = Some(i),
            None => self.end_of_stream = true,
        }
        Ok(())
    }

    /// Create the shard's reader if this is the first time the merge needs
    /// it. Permit acquisition and reader construction both run on the shard.
    fn ensure_stream(&mut self, i: usize, deadline: Deadline) -> MerlinResult<()> {
        if self.slots[i].is_some() {
            return Ok(());
        }
        let shard = ShardId(i as u64);
        let policy = Arc::clone(&self.policy);
        let range = self.range.clone();
        let slice = Arc::clone(&self.slice);
        let trace = self.trace.clone();
        let runtime = Arc::clone(&self.runtime);
        let reader = runtime.invoke_on(shard, move || -> MerlinResult<ShardReader> {
            let permit = policy.obtain_reader_permit(shard, "multishard-mutation-read", deadline)?;
            policy.create_reader(shard, permit, range, slice, &trace)
        })??;
        let buf = TrackedBuffer::new(reader.permit().clone());
        self.slots[i] = Some(ShardStream {
            reader: Some(reader),
            buf,
            eos: false,
        });
        Ok(())
    }

    /// Top up the stream's merge queue from its reader, on the owning
    /// shard. The reader's whole buffer is drained into the queue.
    fn refill_stream(&mut self, i: usize, deadline: Deadline) -> MerlinResult<()> {
        let (shard, mut reader) = {
            let stream = self.slots[i].as_mut().expect("stream exists");
            if !stream.buf.is_empty() || stream.eos {
                return Ok(());
            }
            (
                ShardId(i as u64),
                stream.reader.take().expect("reader is home"),
            )
        };
        let runtime = Arc::clone(&self.runtime);
        let (reader, detached, fill_result) = runtime.invoke_on(shard, move || {
            let fill_result = reader.fill(deadline);
            let detached = reader.detach_buffer();
            (reader, detached, fill_result)
        })?;
        let stream = self.slots[i].as_mut().expect("stream exists");
        stream.reader = Some(reader);
        stream.buf.append(detached);
        fill_result?;
        if stream.buf.is_empty() && stream.reader.as_ref().expect("just restored").is_end_of_stream()
        {
            stream.eos = true;
        }
        Ok(())
    }

    /// Move every live shard reader to `range`. The merged buffer must be
    /// drained first; leftover fragments from the old range are dropped.
    pub fn fast_forward_to(&mut self, range: TokenRange) -> MerlinResult<()> {
        self.range = range.clone();
        self.current_shard = None;
        self.end_of_stream = false;
        self.buffer.clear();
        for i in 0..self.slots.len() {
            let (shard, mut reader) = {
                let stream = match self.slots[i].as_mut() {
                    Some(stream) => stream,
                    None => continue,
                };
                stream.buf.clear();
                stream.eos = false;
                (
                    ShardId(i as u64),
                    stream.reader.take().expect("reader is home"),
                )
            };
            let policy = Arc::clone(&self.policy);
            let target = range.clone();
            let runtime = Arc::clone(&self.runtime);
            let reader = runtime.invoke_on(shard, move || {
                reader.fast_forward_to(target.clone());
                policy.update_read_range(shard, target);
                reader
            })?;
            self.slots[i].as_mut().expect("stream exists").reader = Some(reader);
        }
        Ok(())
    }

    /// Stop every shard reader and hand it back through the lifecycle
    /// policy. Infallible: failures are logged, the rest still stop.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for i in 0..self.slots.len() {
            let Some(mut stream) = self.slots[i].take() else {
                continue;
            };
            let shard = ShardId(i as u64);
            let Some(reader) = stream.reader.take() else {
                continue;
            };
            let policy = Arc::clone(&self.policy);
            let mut queue = std::mem::replace(&mut stream.buf, TrackedBuffer::new(self.permit.clone()));
            let result = self.runtime.invoke_on(shard, move || {
                let mut reader = reader;
                // The merge queue precedes the reader's own buffer in
                // stream order; push it back tail to head.
                while let Some(frag) = queue.pop_back() {
                    reader.unpop_fragment(frag);
                }
                let unconsumed = reader.detach_buffer();
                let handle = policy.semaphore(shard).register_inactive(reader);
                policy.destroy_reader(
                    shard,
                    StoppedReader {
                        handle: Some(handle),
                        unconsumed,
                    },
                );
            });
            if let Err(e) = result {
                tracing::warn!("failed to stop shard reader on {}: {}", shard, e);
            }
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }
}

impl Drop for MultishardCombiningReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Iterates a range vector over a combining reader.
///
/// Two strict guarantees hold: a single fill never yields fragments of two
/// different ranges, and after a fill the wrapped reader's buffer has been
/// fully drained into this one.
pub struct MultiRangeReader {
    inner: MultishardCombiningReader,
    ranges: RangeVector,
    next_range: usize,
    buffer: TrackedBuffer,
    end_of_stream: bool,
}

impl MultiRangeReader {
    /// `inner` must already be positioned on `ranges[0]`.
    pub fn new(inner: MultishardCombiningReader, ranges: RangeVector) -> MultiRangeReader {
        assert!(!ranges.is_empty());
        let buffer = TrackedBuffer::new(inner.permit().clone());
        MultiRangeReader {
            inner,
            ranges,
            next_range: 1,
            buffer,
            end_of_stream: false,
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    pub fn is_buffer_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn pop_fragment(&mut self) -> Option<MutationFragment> {
        self.buffer.pop_front()
    }

    pub fn unpop_fragment(&mut self, frag: MutationFragment) {
        self.buffer.push_front(frag);
    }

    pub fn detach_buffer(&mut self) -> TrackedBuffer {
        std::mem::replace(
            &mut self.buffer,
            TrackedBuffer::new(self.inner.permit().clone()),
        )
    }

    pub fn fill(&mut self, deadline: Deadline) -> MerlinResult<()> {
        if self.end_of_stream {
            return Ok(());
        }
        while self.buffer.is_empty() {
            if self.inner.is_buffer_empty() && self.inner.is_end_of_stream() {
                if self.next_range >= self.ranges.len() {
                    self.end_of_stream = true;
                    return Ok(());
                }
                let range = self.ranges[self.next_range].clone();
                self.next_range += 1;
                self.inner.fast_forward_to(range)?;
            }
            if self.inner.is_buffer_empty() {
                self.inner.fill(deadline)?;
            }
            self.buffer.append(self.inner.detach_buffer());
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.inner.close();
    }
}

/// The reader a page is consumed from: combining, or combining wrapped for
/// multiple ranges.
pub enum PageReader {
    Single(MultishardCombiningReader),
    Multi(MultiRangeReader),
}

impl PageReader {
    pub fn fill(&mut self, deadline: Deadline) -> MerlinResult<()> {
        match self {
            PageReader::Single(r) => r.fill(deadline),
            PageReader::Multi(r) => r.fill(deadline),
        }
    }

    pub fn is_buffer_empty(&self) -> bool {
        match self {
            PageReader::Single(r) => r.is_buffer_empty(),
            PageReader::Multi(r) => r.is_buffer_empty(),
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        match self {
            PageReader::Single(r) => r.is_end_of_stream(),
            PageReader::Multi(r) => r.is_end_of_stream(),
        }
    }

    pub fn pop_fragment(&mut self) -> Option<MutationFragment> {
        match self {
            PageReader::Single(r) => r.pop_fragment(),
            PageReader::Multi(r) => r.pop_fragment(),
        }
    }

    pub fn unpop_fragment(&mut self, frag: MutationFragment) {
        match self {
            PageReader::Single(r) => r.unpop_fragment(frag),
            PageReader::Multi(r) => r.unpop_fragment(frag),
        }
    }

    pub fn detach_buffer(&mut self) -> TrackedBuffer {
        match self {
            PageReader::Single(r) => r.detach_buffer(),
            PageReader::Multi(r) => r.detach_buffer(),
        }
    }

    pub fn close(&mut self) {
        match self {
            PageReader::Single(r) => r.close(),
            PageReader::Multi(r) => r.close(),
        }
    }
}
