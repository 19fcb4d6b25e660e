//! Prioritized chunk downloads.
//!
//! [`DownloadCoordinator::start_batch`] spawns one task per chunk. Tasks queue on a shared
//! priority gate that lets at most `max_concurrent_downloads` fetches run at once and hands free
//! slots to waiters in `(priority, sequence)` order. Fetched bytes are verified against the
//! expected hash and written through the cache strategy on the blocking pool.

mod transport;

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use bytes::Bytes;
use tokio::{sync::oneshot, task::JoinSet};

use crate::{
    error::DownloadError,
    journal::ChunkInfo,
    metrics::MetricsSink,
    resolver::{ChunkDescriptor, ResolvedChunk},
    strategy::CacheStrategy,
    ContentHash,
};

pub use transport::{ChunkTransport, FetchRequest, HttpTransport};

/// Scheduling priority. Lower values run first.
pub type Priority = i32;

/// A chunk that was fetched and verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadedChunk {
    pub descriptor: ChunkDescriptor,
    /// Whether the cache accepted the bytes.
    pub cached: bool,
}

pub type ChunkOutcome = Result<DownloadedChunk, DownloadError>;

pub struct DownloadCoordinator {
    transport: Arc<dyn ChunkTransport>,
    strategy: Arc<CacheStrategy>,
    metrics: Arc<dyn MetricsSink>,
    gate: Arc<PriorityGate>,
    next_batch: AtomicU64,
}

impl std::fmt::Debug for DownloadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadCoordinator")
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl DownloadCoordinator {
    pub fn new(
        transport: Arc<dyn ChunkTransport>,
        strategy: Arc<CacheStrategy>,
        metrics: Arc<dyn MetricsSink>,
        max_concurrent_downloads: usize,
    ) -> Self {
        Self {
            transport,
            strategy,
            metrics,
            gate: PriorityGate::new(max_concurrent_downloads),
            next_batch: AtomicU64::new(0),
        }
    }

    /// Spawns a download task for each of `chunks`. Must be called within a tokio runtime.
    pub fn start_batch(&self, chunks: Vec<ResolvedChunk>, priority: Priority) -> DownloadBatch {
        let id = self.next_batch.fetch_add(1, Ordering::Relaxed);
        let mut tasks = JoinSet::new();

        tracing::debug!(batch = id, chunks = chunks.len(), priority, "starting download batch");

        for chunk in chunks {
            let permit = self.gate.acquire(id, priority);
            let future = Self::download_chunk(
                self.transport.clone(),
                self.strategy.clone(),
                self.metrics.clone(),
                permit,
                chunk,
            );
            tasks.spawn(future);
        }

        DownloadBatch {
            id,
            tasks,
            gate: self.gate.clone(),
        }
    }

    #[tracing::instrument(skip_all, fields(id = %chunk.descriptor.id, container = %chunk.container), err(Debug))]
    async fn download_chunk(
        transport: Arc<dyn ChunkTransport>,
        strategy: Arc<CacheStrategy>,
        metrics: Arc<dyn MetricsSink>,
        permit: oneshot::Receiver<Permit>,
        chunk: ResolvedChunk,
    ) -> ChunkOutcome {
        let descriptor = chunk.descriptor;

        let bytes = {
            let _permit = permit.await.map_err(|_| DownloadError::Cancelled)?;
            transport
                .fetch(FetchRequest {
                    hash: descriptor.hash,
                    range: None,
                })
                .await?
        };

        metrics.on_download(bytes.len() as u64);

        let cached =
            tokio::task::spawn_blocking(move || Self::verify_and_cache(&strategy, &descriptor, bytes))
                .await??;

        if cached {
            tracing::debug!("chunk downloaded and cached");
        } else {
            tracing::debug!("chunk downloaded, cache write dropped");
        }

        Ok(DownloadedChunk { descriptor, cached })
    }

    fn verify_and_cache(
        strategy: &CacheStrategy,
        descriptor: &ChunkDescriptor,
        bytes: Bytes,
    ) -> Result<bool, DownloadError> {
        let actual = ContentHash::of(&bytes);
        if actual != descriptor.hash {
            return Err(DownloadError::HashMismatch {
                id: descriptor.id,
                expected: descriptor.hash,
                actual,
            });
        }

        let info = ChunkInfo {
            mod_tag: Some(descriptor.hash.tag()),
            raw_size: Some(descriptor.size),
            raw_block_size: None,
        };

        Ok(strategy.cache_chunk(&descriptor.id, 0, bytes, descriptor.id.kind(), &info))
    }
}

/// Download tasks of one request.
///
/// Dropping the batch aborts its tasks.
#[derive(Debug)]
pub struct DownloadBatch {
    id: u64,
    tasks: JoinSet<ChunkOutcome>,
    gate: Arc<PriorityGate>,
}

impl DownloadBatch {
    /// Re-keys the fetches still waiting for a slot.
    pub fn reprioritize(&self, priority: Priority) {
        self.gate.reprioritize(self.id, priority);
    }

    /// Drops waiting fetches and aborts running ones. A cache write already handed to the
    /// blocking pool still completes.
    pub fn cancel(&mut self) {
        self.gate.remove(self.id);
        self.tasks.abort_all();
    }

    /// Next finished chunk, or `None` once every task is done. Cancelled tasks are skipped.
    ///
    /// Cancel safe.
    pub async fn next(&mut self) -> Option<ChunkOutcome> {
        loop {
            match self.tasks.join_next().await? {
                Ok(Err(DownloadError::Cancelled)) => continue,
                Ok(outcome) => return Some(outcome),
                Err(e) if e.is_cancelled() => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    /// Number of tasks not yet returned by [`DownloadBatch::next`].
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Drop for DownloadBatch {
    fn drop(&mut self) {
        self.gate.remove(self.id);
    }
}

/// Counting semaphore whose waiters are served in `(priority, sequence)` order.
#[derive(Debug)]
struct PriorityGate {
    state: Mutex<GateState>,
}

#[derive(Debug)]
struct GateState {
    available: usize,
    next_seq: u64,
    waiters: BTreeMap<(Priority, u64), Waiter>,
}

#[derive(Debug)]
struct Waiter {
    batch: u64,
    wake: oneshot::Sender<Permit>,
}

/// A download slot, returned to the gate on drop.
#[derive(Debug)]
struct Permit {
    gate: Option<Arc<PriorityGate>>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.release();
        }
    }
}

impl PriorityGate {
    fn new(slots: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState {
                available: slots,
                next_seq: 0,
                waiters: BTreeMap::new(),
            }),
        })
    }

    fn acquire(self: &Arc<Self>, batch: u64, priority: Priority) -> oneshot::Receiver<Permit> {
        let (wake, permit) = oneshot::channel();
        let mut state = self.state.lock().unwrap();

        if state.available > 0 && state.waiters.is_empty() {
            state.available -= 1;
            drop(state);
            // The receiver is alive, so this cannot fail.
            let _ = wake.send(Permit {
                gate: Some(self.clone()),
            });
        } else {
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiters.insert((priority, seq), Waiter { batch, wake });
        }

        permit
    }

    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();

        while let Some((_, waiter)) = state.waiters.pop_first() {
            let permit = Permit {
                gate: Some(self.clone()),
            };

            match waiter.wake.send(permit) {
                Ok(()) => return,
                // The waiter is gone. Keep the slot for the next one.
                Err(mut permit) => permit.gate = None,
            }
        }

        state.available += 1;
    }

    fn reprioritize(&self, batch: u64, priority: Priority) {
        let mut state = self.state.lock().unwrap();

        let keys: Vec<_> = state
            .waiters
            .iter()
            .filter(|(_, waiter)| waiter.batch == batch)
            .map(|(key, _)| *key)
            .collect();

        for key in keys {
            if let Some(waiter) = state.waiters.remove(&key) {
                state.waiters.insert((priority, key.1), waiter);
            }
        }
    }

    fn remove(&self, batch: u64) {
        self.state
            .lock()
            .unwrap()
            .waiters
            .retain(|_, waiter| waiter.batch != batch);
    }
}
