//! Shard readers and permit-tracked fragment buffers.
//!
//! A `ShardReader` produces the ordered fragment stream of one shard within
//! one token range. Fills are cooperative: they check the deadline and stop
//! at the buffer target. Fragments pushed back with `unpop_fragment` are
//! delivered again before anything new — this is how saved readers resume.

use std::collections::VecDeque;
use std::sync::Arc;

use merlin_common::deadline::Deadline;
use merlin_common::error::MerlinResult;

use crate::fragment::MutationFragment;
use crate::keys::DecoratedKey;
use crate::memtable::ShardMemtable;
use crate::range::TokenRange;
use crate::schema::Schema;
use crate::semaphore::Permit;
use crate::slice::QuerySlice;

/// A fragment queue whose memory footprint is billed to a permit.
///
/// Every push bills the fragment's footprint, every pop releases it; any
/// bytes still held at drop are released then. Moving fragments between
/// buffers re-bills, so accounting follows the fragments wherever they go.
pub struct TrackedBuffer {
    permit: Permit,
    buf: VecDeque<MutationFragment>,
    bytes: u64,
}

impl TrackedBuffer {
    pub fn new(permit: Permit) -> TrackedBuffer {
        TrackedBuffer {
            permit,
            buf: VecDeque::new(),
            bytes: 0,
        }
    }

    pub fn permit(&self) -> &Permit {
        &self.permit
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn push_back(&mut self, frag: MutationFragment) {
        let size = frag.memory_usage();
        self.permit.consume(size);
        self.bytes += size;
        self.buf.push_back(frag);
    }

    pub fn push_front(&mut self, frag: MutationFragment) {
        let size = frag.memory_usage();
        self.permit.consume(size);
        self.bytes += size;
        self.buf.push_front(frag);
    }

    pub fn pop_front(&mut self) -> Option<MutationFragment> {
        let frag = self.buf.pop_front()?;
        let size = frag.memory_usage();
        self.bytes -= size;
        self.permit.release(size);
        Some(frag)
    }

    pub fn pop_back(&mut self) -> Option<MutationFragment> {
        let frag = self.buf.pop_back()?;
        let size = frag.memory_usage();
        self.bytes -= size;
        self.permit.release(size);
        Some(frag)
    }

    pub fn front(&self) -> Option<&MutationFragment> {
        self.buf.front()
    }

    /// Move everything out of `other` onto the back of `self`, re-billing
    /// each fragment against this buffer's permit.
    pub fn append(&mut self, mut other: TrackedBuffer) {
        while let Some(frag) = other.pop_front() {
            self.push_back(frag);
        }
    }

    pub fn clear(&mut self) {
        while self.pop_front().is_some() {}
    }

    pub fn iter(&self) -> impl Iterator<Item = &MutationFragment> {
        self.buf.iter()
    }
}

impl Drop for TrackedBuffer {
    fn drop(&mut self) {
        self.permit.release(self.bytes);
        self.bytes = 0;
    }
}

impl std::fmt::Debug for TrackedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedBuffer")
            .field("fragments", &self.buf.len())
            .field("bytes", &self.bytes)
            .finish()
    }
}

/// Read access to one shard's slice of a table.
#[derive(Clone)]
pub struct MutationSource {
    memtable: Arc<ShardMemtable>,
}

impl MutationSource {
    pub fn new(memtable: Arc<ShardMemtable>) -> MutationSource {
        MutationSource { memtable }
    }

    pub fn make_reader(
        &self,
        schema: Arc<Schema>,
        permit: Permit,
        range: TokenRange,
        slice: Arc<QuerySlice>,
        fill_target: u64,
    ) -> ShardReader {
        ShardReader::new(
            schema,
            permit,
            Arc::clone(&self.memtable),
            range,
            slice,
            fill_target,
        )
    }
}

/// Ordered fragment stream of one shard within one token range.
pub struct ShardReader {
    schema: Arc<Schema>,
    permit: Permit,
    memtable: Arc<ShardMemtable>,
    range: TokenRange,
    slice: Arc<QuerySlice>,
    buffer: TrackedBuffer,
    /// Last partition fully materialized; the next fill continues after it.
    cursor: Option<DecoratedKey>,
    end_of_stream: bool,
    fill_target: u64,
}

impl ShardReader {
    pub fn new(
        schema: Arc<Schema>,
        permit: Permit,
        memtable: Arc<ShardMemtable>,
        range: TokenRange,
        slice: Arc<QuerySlice>,
        fill_target: u64,
    ) -> ShardReader {
        let buffer = TrackedBuffer::new(permit.clone());
        ShardReader {
            schema,
            permit,
            memtable,
            range,
            slice,
            buffer,
            cursor: None,
            end_of_stream: false,
            fill_target,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
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

    pub fn buffer_bytes(&self) -> u64 {
        self.buffer.bytes()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Pull fragments until the buffer holds at least the fill target or
    /// the shard has nothing more in range.
    pub fn fill(&mut self, deadline: Deadline) -> MerlinResult<()> {
        while !self.end_of_stream && self.buffer.bytes() < self.fill_target {
            deadline.check("reader buffer fill")?;
            match self
                .memtable
                .next_partition_fragments(&self.range, &self.slice, self.cursor.as_ref())
            {
                Some((key, frags)) => {
                    self.cursor = Some(key);
                    for frag in frags {
                        self.buffer.push_back(frag);
                    }
                }
                None => {
                    self.end_of_stream = true;
                }
            }
        }
        Ok(())
    }

    pub fn pop_fragment(&mut self) -> Option<MutationFragment> {
        self.buffer.pop_front()
    }

    /// Push a fragment back to the front of the buffer. Used tail-to-head
    /// when rebuilding a saved reader, so original order is preserved.
    pub fn unpop_fragment(&mut self, frag: MutationFragment) {
        self.buffer.push_front(frag);
    }

    /// Take the whole buffer, leaving the reader with an empty one.
    pub fn detach_buffer(&mut self) -> TrackedBuffer {
        std::mem::replace(&mut self.buffer, TrackedBuffer::new(self.permit.clone()))
    }

    /// Move this reader to a new range. Buffered fragments from the old
    /// range are discarded.
    pub fn fast_forward_to(&mut self, range: TokenRange) {
        self.range = range;
        self.cursor = None;
        self.end_of_stream = false;
        self.buffer.clear();
    }
}

impl std::fmt::Debug for ShardReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardReader")
            .field("table", &self.schema.table)
            .field("buffered", &self.buffer.len())
            .field("end_of_stream", &self.end_of_stream)
            .finish()
    }
}
