//! The download scheduler: drains the chunk heap, reserves memory, and
//! matches piece fetches to workers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::chunk::{ChunkJob, DispatchOutcome};
use crate::error::DownloadError;
use crate::heap::DownloadHeap;
use crate::memory::MemoryManager;
use crate::worker::{PieceJob, WorkerHandle};

/// Long-lived scheduling loop. One per renter.
pub struct Scheduler {
    heap: Arc<DownloadHeap>,
    memory: Arc<MemoryManager>,
    workers: Arc<RwLock<HashMap<crate::filemap::ContractId, WorkerHandle>>>,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn spawn(
        heap: Arc<DownloadHeap>,
        memory: Arc<MemoryManager>,
        workers: Arc<RwLock<HashMap<crate::filemap::ContractId, WorkerHandle>>>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let s = Self {
            heap,
            memory,
            workers,
            shutdown,
        };
        tokio::spawn(s.run())
    }

    async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            // Drain everything queued, then park until the next push.
            while let Some(chunk) = self.heap.pop() {
                if *self.shutdown.borrow() {
                    break;
                }
                self.process_chunk(chunk).await;
            }
            tokio::select! {
                biased;
                res = self.shutdown.changed() => {
                    if res.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = self.heap.wait_for_work() => {}
            }
        }
        tracing::debug!("download scheduler stopped");
    }

    async fn process_chunk(&self, chunk: Arc<ChunkJob>) {
        // Memory first. This intentionally blocks the whole loop: the heap
        // is priority-ordered, and servicing lower-priority chunks while the
        // top one waits for memory would invert that order.
        if chunk.needs_memory() {
            let amount = chunk.memory_needed();
            match self.memory.request(amount).await {
                Ok(()) => {
                    if !chunk.set_memory_reserved(amount) {
                        return;
                    }
                }
                Err(e) => {
                    chunk.fail_chunk(e);
                    return;
                }
            }
        }

        let outcome = {
            let workers = self.workers.read().unwrap();
            let result =
                chunk.plan_dispatch(&|id| workers.get(id).map(|w| w.measured_latency_ms()));
            for assignment in &result.jobs {
                if let Some(worker) = workers.get(&assignment.contract) {
                    worker.send_job(
                        PieceJob {
                            chunk: Arc::clone(&chunk),
                            piece_index: assignment.piece_index,
                            root: assignment.root,
                        },
                        assignment.standby,
                    );
                }
            }
            if !result.jobs.is_empty() {
                tracing::debug!(
                    chunk = chunk.chunk_index,
                    dispatched = result.jobs.len(),
                    "dispatched piece fetches"
                );
            }
            result.outcome
        };

        if let DispatchOutcome::Insufficient { available } = outcome {
            chunk.fail_chunk(DownloadError::InsufficientHosts {
                chunk_index: chunk.chunk_index,
                available,
                needed: chunk.erasure.min_pieces(),
            });
        }
    }
}
