//! Page consumption: pull → compact → build until a limit fires.

use merlin_common::deadline::Deadline;
use merlin_common::error::MerlinResult;
use merlin_storage::compact::{DetachedCompactionState, PageCompactor, Step};
use merlin_storage::keys::ClusteringKey;
use merlin_storage::reader::TrackedBuffer;
use merlin_storage::result::ResultBuilder;

use crate::combining::PageReader;

/// Everything a finished page leaves behind.
pub struct PageConsumeResult<T> {
    pub last_ckey: Option<ClusteringKey>,
    pub result: T,
    /// Fragments the reader had produced but the page did not consume.
    pub unconsumed: TrackedBuffer,
    pub compaction_state: DetachedCompactionState,
    /// A row/partition limit fired; more pages are expected.
    pub limits_reached: bool,
}

/// Drive one page: feed fragments through the compactor into the builder
/// until a limit fires, the builder signals short read, or the stream ends.
pub fn consume_page<B: ResultBuilder>(
    reader: &mut PageReader,
    compactor: &mut PageCompactor,
    mut builder: B,
    deadline: Deadline,
) -> MerlinResult<PageConsumeResult<B::Output>> {
    loop {
        if reader.is_buffer_empty() {
            if reader.is_end_of_stream() {
                break;
            }
            reader.fill(deadline)?;
            if reader.is_buffer_empty() && reader.is_end_of_stream() {
                break;
            }
        }
        let frag = reader.pop_fragment().expect("buffer checked non-empty");
        match compactor.consume(frag, &mut builder)? {
            Step::Continue => {}
            Step::StopAfter => break,
            Step::StopBefore(frag) => {
                reader.unpop_fragment(frag);
                break;
            }
        }
    }
    Ok(PageConsumeResult {
        last_ckey: compactor.last_ckey(),
        result: builder.consume_end_of_stream(),
        unconsumed: reader.detach_buffer(),
        compaction_state: compactor.detach_state(),
        limits_reached: compactor.are_limits_reached(),
    })
}
