//! Shard runtime: one worker thread per shard, message-passed closures.
//!
//! The share-nothing model: every shard's semaphore, querier cache and
//! reader state belong to that shard's worker. "Invoke on shard N" sends a
//! boxed task over the worker's channel and blocks on a rendezvous reply.
//! Calls from a shard to itself run inline, like a local call would.

use std::cell::Cell;
use std::sync::mpsc;
use std::sync::Arc;

use merlin_common::error::{MerlinError, MerlinResult, QueryError};
use merlin_common::types::ShardId;

type ShardTask = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static CURRENT_SHARD: Cell<Option<u64>> = const { Cell::new(None) };
}

/// The shard whose worker thread is running the caller, if any.
pub fn this_shard_id() -> Option<ShardId> {
    CURRENT_SHARD.with(|c| c.get().map(ShardId))
}

struct Worker {
    tx: Option<mpsc::Sender<ShardTask>>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl Worker {
    fn sender(&self) -> &mpsc::Sender<ShardTask> {
        self.tx.as_ref().expect("worker channel already closed")
    }
}

/// Owns the per-shard worker threads.
pub struct ShardRuntime {
    workers: Vec<Worker>,
}

impl ShardRuntime {
    pub fn new(shard_count: u64) -> Arc<ShardRuntime> {
        assert!(shard_count > 0, "need at least one shard");
        let workers = (0..shard_count)
            .map(|shard| {
                let (tx, rx) = mpsc::channel::<ShardTask>();
                let join = std::thread::Builder::new()
                    .name(format!("merlin-shard-{shard}"))
                    .spawn(move || {
                        CURRENT_SHARD.with(|c| c.set(Some(shard)));
                        while let Ok(task) = rx.recv() {
                            task();
                        }
                    })
                    .expect("failed to spawn shard worker");
                Worker {
                    tx: Some(tx),
                    join: Some(join),
                }
            })
            .collect();
        Arc::new(ShardRuntime { workers })
    }

    pub fn shard_count(&self) -> u64 {
        self.workers.len() as u64
    }

    pub fn shards(&self) -> impl Iterator<Item = ShardId> {
        (0..self.workers.len() as u64).map(ShardId)
    }

    /// Run `f` on `shard` and wait for its result. Runs inline when the
    /// caller is already on that shard.
    pub fn invoke_on<R, F>(&self, shard: ShardId, f: F) -> MerlinResult<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if this_shard_id() == Some(shard) {
            return Ok(f());
        }
        let rx = self.submit_on(shard, f)?;
        rx.recv()
            .map_err(|_| MerlinError::from(QueryError::ShardUnavailable(shard)))
    }

    /// Queue `f` on `shard`, returning the channel its result will arrive
    /// on. Lets callers fan work out to many shards before joining any.
    pub fn submit_on<R, F>(&self, shard: ShardId, f: F) -> MerlinResult<mpsc::Receiver<R>>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let worker = self
            .workers
            .get(shard.index())
            .ok_or_else(|| MerlinError::internal(format!("no such shard: {shard}")))?;
        let (tx, rx) = mpsc::sync_channel::<R>(1);
        worker
            .sender()
            .send(Box::new(move || {
                let _ = tx.send(f());
            }))
            .map_err(|_| MerlinError::from(QueryError::ShardUnavailable(shard)))?;
        Ok(rx)
    }

    /// Queue `f` on `shard` without waiting for it. Used for fire-and-forget
    /// cleanup, so failures only log.
    pub fn spawn_on<F>(&self, shard: ShardId, f: F) -> MerlinResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let worker = self
            .workers
            .get(shard.index())
            .ok_or_else(|| MerlinError::internal(format!("no such shard: {shard}")))?;
        worker
            .sender()
            .send(Box::new(f))
            .map_err(|_| MerlinError::from(QueryError::ShardUnavailable(shard)))
    }

    /// Run `f(shard)` on every shard concurrently and collect the results
    /// in shard order.
    pub fn invoke_on_all<R, F>(&self, f: F) -> Vec<MerlinResult<R>>
    where
        R: Send + 'static,
        F: Fn(ShardId) -> R + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let receivers: Vec<_> = self
            .shards()
            .map(|shard| {
                let f = Arc::clone(&f);
                (shard, self.submit_on(shard, move || f(shard)))
            })
            .collect();
        receivers
            .into_iter()
            .map(|(shard, rx)| match rx {
                Ok(rx) => rx
                    .recv()
                    .map_err(|_| MerlinError::from(QueryError::ShardUnavailable(shard))),
                Err(e) => Err(e),
            })
            .collect()
    }
}

impl Drop for ShardRuntime {
    fn drop(&mut self) {
        // Closing the channels ends the worker loops.
        for worker in &mut self.workers {
            worker.tx.take();
        }
        let current = std::thread::current().id();
        for worker in &mut self.workers {
            if let Some(handle) = worker.join.take() {
                // A worker draining the last reference to the runtime must
                // not join itself; its queue is already closed.
                if handle.thread().id() == current {
                    continue;
                }
                let _ = handle.join();
            }
        }
    }
}

/// A value owned by one shard. Readable anywhere; destroyed only on its
/// owner. Dropping it elsewhere ships it home for destruction.
pub struct ShardOwned<T: Send + 'static> {
    owner: ShardId,
    runtime: Arc<ShardRuntime>,
    value: Option<Box<T>>,
}

impl<T: Send + 'static> ShardOwned<T> {
    pub fn new(owner: ShardId, runtime: Arc<ShardRuntime>, value: T) -> ShardOwned<T> {
        ShardOwned {
            owner,
            runtime,
            value: Some(Box::new(value)),
        }
    }

    pub fn owner(&self) -> ShardId {
        self.owner
    }

    /// Shared read access, allowed from any shard.
    pub fn get(&self) -> &T {
        self.value.as_ref().expect("ShardOwned already taken")
    }

    /// Mutable access; the caller must be on the owning shard.
    pub fn get_mut(&mut self) -> &mut T {
        debug_assert_eq!(
            this_shard_id(),
            Some(self.owner),
            "ShardOwned mutated off its owning shard"
        );
        self.value.as_mut().expect("ShardOwned already taken")
    }

    /// Replace the value in place on the owning shard, dropping the old one
    /// there.
    pub fn replace(&mut self, value: T) {
        debug_assert_eq!(
            this_shard_id(),
            Some(self.owner),
            "ShardOwned replaced off its owning shard"
        );
        self.value = Some(Box::new(value));
    }

    /// Take the value; the caller must be on the owning shard.
    pub fn take(&mut self) -> Option<T> {
        debug_assert_eq!(
            this_shard_id(),
            Some(self.owner),
            "ShardOwned taken off its owning shard"
        );
        self.value.take().map(|b| *b)
    }
}

impl<T: Send + 'static> Drop for ShardOwned<T> {
    fn drop(&mut self) {
        let Some(value) = self.value.take() else {
            return;
        };
        if this_shard_id() == Some(self.owner) {
            drop(value);
            return;
        }
        let owner = self.owner;
        if let Err(e) = self.runtime.spawn_on(owner, move || drop(value)) {
            tracing::warn!(
                "could not ship shard-owned value home to {} for destruction: {}",
                owner,
                e
            );
        }
    }
}
