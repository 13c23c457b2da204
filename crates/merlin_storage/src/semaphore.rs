//! Reader concurrency semaphore: per-shard admission control for reads.
//!
//! Admits new readers subject to an in-flight count; tracks the bytes held
//! live in reader buffers via permits; parks suspended readers in an
//! inactive registry from which they may be evicted under memory pressure.
//! `unregister_inactive` returning `None` is the eviction signal.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use merlin_common::deadline::Deadline;
use merlin_common::error::{MerlinResult, QueryError};

use crate::reader::ShardReader;

static NEXT_SEMAPHORE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_PERMIT_ID: AtomicU64 = AtomicU64::new(1);

struct AdmissionState {
    active: usize,
}

struct InactiveEntry {
    reader: ShardReader,
    bytes: u64,
}

#[derive(Default)]
struct InactiveRegistry {
    next_id: u64,
    /// Insertion-ordered by id: the first entry is the oldest.
    entries: std::collections::BTreeMap<u64, InactiveEntry>,
    bytes: u64,
}

/// Counters exposed by a semaphore.
#[derive(Debug, Default)]
pub struct SemaphoreStats {
    pub permits_admitted: AtomicU64,
    pub admission_timeouts: AtomicU64,
    pub reader_evictions: AtomicU64,
}

/// Per-shard admission gate and inactive-read registry.
pub struct ReaderSemaphore {
    id: u64,
    name: String,
    max_count: usize,
    max_inactive_memory: u64,
    state: Mutex<AdmissionState>,
    admission: Condvar,
    /// Bytes billed by all permits of this semaphore.
    memory: AtomicU64,
    inactive: Mutex<InactiveRegistry>,
    stats: SemaphoreStats,
    /// Handed to permits so they can bill back without keeping the
    /// semaphore alive.
    self_weak: Weak<ReaderSemaphore>,
}

impl ReaderSemaphore {
    pub fn new(name: impl Into<String>, max_count: usize, max_inactive_memory: u64) -> Arc<Self> {
        Arc::new_cyclic(|weak| ReaderSemaphore {
            id: NEXT_SEMAPHORE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            max_count,
            max_inactive_memory,
            state: Mutex::new(AdmissionState { active: 0 }),
            admission: Condvar::new(),
            memory: AtomicU64::new(0),
            inactive: Mutex::new(InactiveRegistry::default()),
            stats: SemaphoreStats::default(),
            self_weak: weak.clone(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &SemaphoreStats {
        &self.stats
    }

    /// Reads currently admitted (not parked inactive).
    pub fn active_reads(&self) -> usize {
        self.state.lock().active
    }

    /// Bytes currently billed to permits of this semaphore.
    pub fn memory_in_use(&self) -> u64 {
        self.memory.load(Ordering::Relaxed)
    }

    pub fn inactive_count(&self) -> usize {
        self.inactive.lock().entries.len()
    }

    /// Admit a new read, waiting until a slot frees or the deadline expires.
    pub fn make_permit(&self, description: &str, deadline: Deadline) -> MerlinResult<Permit> {
        if self.max_count == 0 {
            return Err(QueryError::AdmissionRejected(format!(
                "semaphore {} admits no reads",
                self.name
            ))
            .into());
        }
        let mut state = self.state.lock();
        loop {
            if state.active < self.max_count {
                break;
            }
            match deadline.remaining() {
                None => {
                    self.admission.wait(&mut state);
                }
                Some(rem) if rem.is_zero() => {
                    self.stats.admission_timeouts.fetch_add(1, Ordering::Relaxed);
                    return Err(QueryError::Timeout(format!(
                        "admission to semaphore {} ({}/{} active)",
                        self.name, state.active, self.max_count
                    ))
                    .into());
                }
                Some(rem) => {
                    self.admission.wait_for(&mut state, rem);
                }
            }
        }
        state.active += 1;
        drop(state);
        self.stats.permits_admitted.fetch_add(1, Ordering::Relaxed);
        Ok(self.new_permit(description, true))
    }

    /// A permit that bills memory but never occupies an admission slot.
    /// Used by the coordinator for the combined page buffer.
    pub fn make_tracking_only_permit(&self, description: &str) -> Permit {
        self.new_permit(description, false)
    }

    fn new_permit(&self, description: &str, counting: bool) -> Permit {
        Permit {
            inner: Arc::new(PermitInner {
                semaphore: self.self_weak.clone(),
                semaphore_id: self.id,
                id: NEXT_PERMIT_ID.fetch_add(1, Ordering::Relaxed),
                description: description.to_string(),
                counting,
                parked: AtomicBool::new(false),
                consumed: AtomicU64::new(0),
                max_result_size: AtomicU64::new(u64::MAX),
            }),
        }
    }

    /// Park a suspended reader. Its admission slot is released; the reader
    /// may be evicted later under memory pressure.
    pub fn register_inactive(&self, reader: ShardReader) -> InactiveHandle {
        reader.permit().park();
        let bytes = reader.buffer_bytes();
        let mut registry = self.inactive.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.entries.insert(id, InactiveEntry { reader, bytes });
        registry.bytes += bytes;
        self.evict_while_pressured(&mut registry);
        InactiveHandle {
            semaphore_id: self.id,
            id,
        }
    }

    /// Reclaim a parked reader. `None` means it was evicted in the meantime.
    pub fn unregister_inactive(&self, handle: InactiveHandle) -> Option<ShardReader> {
        if handle.semaphore_id != self.id {
            tracing::warn!(
                "inactive handle for semaphore {} presented to semaphore {}",
                handle.semaphore_id,
                self.id
            );
            return None;
        }
        let mut registry = self.inactive.lock();
        let entry = registry.entries.remove(&handle.id)?;
        registry.bytes -= entry.bytes;
        drop(registry);
        entry.reader.permit().unpark();
        Some(entry.reader)
    }

    /// Evict the oldest parked reader, if any. Maintenance/test entry point.
    pub fn evict_oldest_inactive(&self) -> bool {
        let mut registry = self.inactive.lock();
        self.evict_one(&mut registry)
    }

    fn evict_while_pressured(&self, registry: &mut InactiveRegistry) {
        while registry.bytes > self.max_inactive_memory && !registry.entries.is_empty() {
            self.evict_one(registry);
        }
    }

    fn evict_one(&self, registry: &mut InactiveRegistry) -> bool {
        let oldest = match registry.entries.keys().next() {
            Some(id) => *id,
            None => return false,
        };
        let entry = registry.entries.remove(&oldest).expect("entry just seen");
        registry.bytes -= entry.bytes;
        self.stats.reader_evictions.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "semaphore {}: evicting inactive reader ({} buffered bytes)",
            self.name,
            entry.bytes
        );
        // Unpark before dropping: surviving permit clones (saved querier
        // state) go back to counting until their last clone drops, keeping
        // the slot ledger balanced even if the permit is reused for a
        // replacement reader.
        entry.reader.permit().unpark();
        drop(entry.reader);
        true
    }

    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.active -= 1;
        drop(state);
        self.admission.notify_one();
    }

    fn reacquire_slot(&self) {
        // Revival of a parked reader bypasses admission: the read was
        // already admitted once and holds no new resources yet.
        self.state.lock().active += 1;
    }
}

impl std::fmt::Debug for ReaderSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderSemaphore")
            .field("name", &self.name)
            .field("active", &self.active_reads())
            .field("inactive", &self.inactive_count())
            .field("memory", &self.memory_in_use())
            .finish()
    }
}

/// Opaque ticket for a parked reader. Not clonable; surrendering it is the
/// only way to get the reader back.
#[derive(Debug)]
pub struct InactiveHandle {
    semaphore_id: u64,
    id: u64,
}

struct PermitInner {
    semaphore: Weak<ReaderSemaphore>,
    semaphore_id: u64,
    id: u64,
    description: String,
    counting: bool,
    parked: AtomicBool,
    consumed: AtomicU64,
    max_result_size: AtomicU64,
}

impl Drop for PermitInner {
    fn drop(&mut self) {
        if let Some(sem) = self.semaphore.upgrade() {
            let leftover = self.consumed.load(Ordering::Relaxed);
            if leftover > 0 {
                sem.memory.fetch_sub(leftover, Ordering::Relaxed);
            }
            if self.counting && !self.parked.load(Ordering::Relaxed) {
                sem.release_slot();
            }
        }
    }
}

/// Handle held while a reader is live. Cheap to clone; all clones share one
/// admission slot and one memory account. Identity is
/// `(semaphore, permit id)` — reusing a saved reader under a different
/// permit is a coordinator bug.
#[derive(Clone)]
pub struct Permit {
    inner: Arc<PermitInner>,
}

impl Permit {
    pub fn semaphore_id(&self) -> u64 {
        self.inner.semaphore_id
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn description(&self) -> &str {
        &self.inner.description
    }

    /// Bill `bytes` of live fragment memory to this permit.
    pub fn consume(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.inner.consumed.fetch_add(bytes, Ordering::Relaxed);
        if let Some(sem) = self.inner.semaphore.upgrade() {
            sem.memory.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn release(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.inner.consumed.fetch_sub(bytes, Ordering::Relaxed);
        if let Some(sem) = self.inner.semaphore.upgrade() {
            sem.memory.fetch_sub(bytes, Ordering::Relaxed);
        }
    }

    pub fn consumed(&self) -> u64 {
        self.inner.consumed.load(Ordering::Relaxed)
    }

    pub fn set_max_result_size(&self, size: u64) {
        self.inner.max_result_size.store(size, Ordering::Relaxed);
    }

    pub fn max_result_size(&self) -> u64 {
        self.inner.max_result_size.load(Ordering::Relaxed)
    }

    fn park(&self) {
        if self.inner.counting && !self.inner.parked.swap(true, Ordering::Relaxed) {
            if let Some(sem) = self.inner.semaphore.upgrade() {
                sem.release_slot();
            }
        }
    }

    fn unpark(&self) {
        if self.inner.counting && self.inner.parked.swap(false, Ordering::Relaxed) {
            if let Some(sem) = self.inner.semaphore.upgrade() {
                sem.reacquire_slot();
            }
        }
    }
}

impl PartialEq for Permit {
    fn eq(&self, other: &Self) -> bool {
        self.inner.semaphore_id == other.inner.semaphore_id && self.inner.id == other.inner.id
    }
}

impl Eq for Permit {}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("semaphore", &self.inner.semaphore_id)
            .field("id", &self.inner.id)
            .field("description", &self.inner.description)
            .field("consumed", &self.consumed())
            .finish()
    }
}
