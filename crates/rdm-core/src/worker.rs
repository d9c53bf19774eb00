//! Per-host piece fetcher.
//!
//! One worker task per live host contract. The scheduler feeds it through
//! two inboxes: primary for chunks the host is fast enough for, standby for
//! chunks that only want this host if faster sources fall through. The
//! worker always drains primary work first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::chunk::ChunkJob;
use crate::config::RenterConfig;
use crate::error::DownloadError;
use crate::filemap::{ContractId, PieceRoot};
use crate::heap::DownloadHeap;

/// Fetches pieces from one host. Implemented by the RPC layer; tests use
/// in-process fakes. A fetch must return exactly the piece whose content
/// hashes to `root`; the worker re-verifies before accepting.
#[async_trait::async_trait]
pub trait HostClient: Send + Sync {
    async fn fetch_piece(&self, root: PieceRoot) -> anyhow::Result<Bytes>;
}

/// One piece-fetch handed to a worker.
pub struct PieceJob {
    pub chunk: Arc<ChunkJob>,
    pub piece_index: usize,
    pub root: PieceRoot,
}

/// Scheduler-side handle to a running worker.
pub struct WorkerHandle {
    pub contract: ContractId,
    primary_tx: mpsc::UnboundedSender<PieceJob>,
    standby_tx: mpsc::UnboundedSender<PieceJob>,
    latency_ms: Arc<AtomicU64>,
    fetches_ok: Arc<AtomicU64>,
    fetches_err: Arc<AtomicU64>,
    kill_tx: watch::Sender<bool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    /// Spawn the fetch task for `contract` and return its handle.
    pub fn spawn(
        contract: ContractId,
        client: Arc<dyn HostClient>,
        heap: Arc<DownloadHeap>,
        cfg: &RenterConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (primary_tx, primary_rx) = mpsc::unbounded_channel();
        let (standby_tx, standby_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = watch::channel(false);
        let latency_ms = Arc::new(AtomicU64::new(0));
        let fetches_ok = Arc::new(AtomicU64::new(0));
        let fetches_err = Arc::new(AtomicU64::new(0));

        let worker = Worker {
            contract,
            client,
            heap,
            latency_ms: Arc::clone(&latency_ms),
            fetches_ok: Arc::clone(&fetches_ok),
            fetches_err: Arc::clone(&fetches_err),
            fetch_timeout_factor: cfg.fetch_timeout_factor.max(1),
            min_fetch_timeout: Duration::from_millis(cfg.min_fetch_timeout_ms),
            primary_rx,
            standby_rx,
            shutdown,
            kill_rx,
        };
        let join = tokio::spawn(worker.run());

        Self {
            contract,
            primary_tx,
            standby_tx,
            latency_ms,
            fetches_ok,
            fetches_err,
            kill_tx,
            join: Mutex::new(Some(join)),
        }
    }

    /// Recent fetch latency in milliseconds; 0 until the first fetch lands.
    pub fn measured_latency_ms(&self) -> u64 {
        self.latency_ms.load(Ordering::Relaxed)
    }

    pub fn fetches_ok(&self) -> u64 {
        self.fetches_ok.load(Ordering::Relaxed)
    }

    pub fn fetches_err(&self) -> u64 {
        self.fetches_err.load(Ordering::Relaxed)
    }

    /// Queue a piece fetch. Standby jobs only run once the primary inbox is
    /// empty.
    pub fn send_job(&self, job: PieceJob, standby: bool) {
        let tx = if standby {
            &self.standby_tx
        } else {
            &self.primary_tx
        };
        if tx.send(job).is_err() {
            // Worker already stopped; the chunk will requeue via claim
            // failure or the host's removal path.
            tracing::debug!(host = %self.contract, "job sent to stopped worker");
        }
    }

    /// Tell the worker to stop. Queued jobs are failed with
    /// "worker terminated" and their chunks requeued.
    pub fn kill(&self) {
        let _ = self.kill_tx.send(true);
    }

    /// Wait for the worker task to exit.
    pub async fn join(&self) {
        let handle = self.join.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

struct Worker {
    contract: ContractId,
    client: Arc<dyn HostClient>,
    heap: Arc<DownloadHeap>,
    latency_ms: Arc<AtomicU64>,
    fetches_ok: Arc<AtomicU64>,
    fetches_err: Arc<AtomicU64>,
    fetch_timeout_factor: u32,
    min_fetch_timeout: Duration,
    primary_rx: mpsc::UnboundedReceiver<PieceJob>,
    standby_rx: mpsc::UnboundedReceiver<PieceJob>,
    shutdown: watch::Receiver<bool>,
    kill_rx: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() || *self.kill_rx.borrow() {
                break;
            }
            tokio::select! {
                biased;
                res = self.shutdown.changed() => {
                    if res.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                res = self.kill_rx.changed() => {
                    if res.is_err() || *self.kill_rx.borrow() {
                        break;
                    }
                }
                job = self.primary_rx.recv() => match job {
                    Some(job) => self.handle(job).await,
                    None => break,
                },
                job = self.standby_rx.recv() => match job {
                    Some(job) => self.handle(job).await,
                    None => break,
                },
            }
        }
        self.drain();
        tracing::debug!(host = %self.contract, "worker stopped");
    }

    async fn handle(&self, job: PieceJob) {
        if !job.chunk.claim_piece(job.piece_index, self.contract) {
            return;
        }

        let deadline = std::cmp::max(
            job.chunk.latency_target * self.fetch_timeout_factor,
            self.min_fetch_timeout,
        );
        let started = Instant::now();

        let mut stop = self.shutdown.clone();
        let mut kill = self.kill_rx.clone();
        let outcome = tokio::select! {
            biased;
            _ = stop.wait_for(|s| *s) => Err("worker terminated".to_string()),
            _ = kill.wait_for(|k| *k) => Err("worker terminated".to_string()),
            res = tokio::time::timeout(deadline, self.client.fetch_piece(job.root)) => {
                match res {
                    Ok(Ok(data)) => Ok(data),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("fetch timed out after {}ms", deadline.as_millis())),
                }
            }
        };

        let data = match outcome {
            Ok(data) => data,
            Err(reason) => {
                self.fetch_failed(&job, &reason);
                return;
            }
        };

        if PieceRoot::of(&data) != job.root {
            // Count the bad bytes; the host sent something.
            job.chunk.download.add_total_transferred(data.len() as u64);
            self.fetch_failed(&job, "piece root verification failed");
            return;
        }

        self.record_latency(started.elapsed());
        self.fetches_ok.fetch_add(1, Ordering::Relaxed);
        if let Some(ticket) = job
            .chunk
            .piece_retrieved(job.piece_index, self.contract, data)
        {
            let chunk = Arc::clone(&job.chunk);
            tokio::spawn(chunk.assemble(ticket));
        }
    }

    fn fetch_failed(&self, job: &PieceJob, reason: &str) {
        self.fetches_err.fetch_add(1, Ordering::Relaxed);
        let err = DownloadError::HostFetchFailed(reason.to_string());
        job.chunk
            .piece_failed(job.piece_index, self.contract, &err.to_string());
        // Requeue so the scheduler can promote a standby source.
        if job.chunk.needs_attention() {
            self.heap.push(Arc::clone(&job.chunk));
        }
    }

    /// Exponential moving average, weighted 3:1 toward history.
    fn record_latency(&self, sample: Duration) {
        let sample_ms = sample.as_millis() as u64;
        let old = self.latency_ms.load(Ordering::Relaxed);
        let new = if old == 0 {
            sample_ms
        } else {
            (3 * old + sample_ms) / 4
        };
        self.latency_ms.store(new, Ordering::Relaxed);
    }

    /// Fail everything still queued. Runs once the loop has exited.
    fn drain(&mut self) {
        self.primary_rx.close();
        self.standby_rx.close();
        while let Ok(job) = self.primary_rx.try_recv() {
            self.fail_queued(job);
        }
        while let Ok(job) = self.standby_rx.try_recv() {
            self.fail_queued(job);
        }
    }

    fn fail_queued(&self, job: PieceJob) {
        job.chunk
            .piece_failed(job.piece_index, self.contract, "worker terminated");
        if job.chunk.needs_attention() {
            self.heap.push(job.chunk);
        }
    }
}
