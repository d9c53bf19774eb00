//! The download handle: one queued user request and its lifecycle.
//!
//! A `Download` aggregates the chunks of one request, tracks progress through
//! lock-free counters, and raises its completion signal exactly once — on the
//! last chunk written or on the first fatal error. Failed downloads keep
//! accumulating errors, but the signal never fires twice.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::watch;

use crate::chunk::ChunkJob;
use crate::destination::DestinationSink;
use crate::error::{compose, DownloadError};
use crate::memory::MemoryManager;

/// Construction parameters for a `Download`. Validation happens in the
/// renter before this is built.
pub struct DownloadArgs {
    pub destination: Arc<dyn DestinationSink>,
    pub destination_string: String,
    pub destination_type: &'static str,
    pub length: u64,
    pub offset: u64,
    pub path: String,
    pub latency_target: Duration,
    pub overdrive: u32,
    pub priority: u64,
    pub memory: Arc<MemoryManager>,
}

struct DownloadState {
    errors: Vec<DownloadError>,
    end_time: Option<SystemTime>,
    chunks: Vec<Weak<ChunkJob>>,
}

/// One file download that has been queued by the renter.
///
/// Field ownership: the atomics below are written by workers and the
/// assembler without taking the state lock; everything mutable behind
/// `state` is only touched under it. The remaining fields are immutable
/// after construction.
pub struct Download {
    // Data progress. `data_received` stops at 100% of the requested range;
    // `total_transferred` also counts overdrive and late pieces.
    data_received: AtomicU64,
    total_transferred: AtomicU64,
    chunks_remaining: AtomicU64,

    pub destination: Arc<dyn DestinationSink>,
    pub destination_string: String,
    pub destination_type: &'static str,
    pub length: u64,
    pub offset: u64,
    pub path: String,

    // Retrieval settings, inherited by the download's chunks.
    pub latency_target: Duration,
    pub overdrive: u32,
    pub priority: u64,

    pub start_time: Instant,
    pub start_system: SystemTime,

    pub memory: Arc<MemoryManager>,

    completed: watch::Sender<bool>,
    state: Mutex<DownloadState>,
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("path", &self.path)
            .field("destination_string", &self.destination_string)
            .field("destination_type", &self.destination_type)
            .field("length", &self.length)
            .field("offset", &self.offset)
            .finish()
    }
}

/// History entry describing one download, completed or not.
#[derive(Debug, Clone)]
pub struct DownloadInfo {
    pub destination: String,
    pub destination_type: &'static str,
    pub length: u64,
    pub offset: u64,
    pub path: String,

    pub completed: bool,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub received: u64,
    pub total_data_transferred: u64,
    /// Composed error string; empty when the download saw no error.
    pub error: String,
}

impl Download {
    pub fn new(args: DownloadArgs) -> Arc<Self> {
        let (completed, _) = watch::channel(false);
        Arc::new(Self {
            data_received: AtomicU64::new(0),
            total_transferred: AtomicU64::new(0),
            chunks_remaining: AtomicU64::new(0),
            destination: args.destination,
            destination_string: args.destination_string,
            destination_type: args.destination_type,
            length: args.length,
            offset: args.offset,
            path: args.path,
            latency_target: args.latency_target,
            overdrive: args.overdrive,
            priority: args.priority,
            start_time: Instant::now(),
            start_system: SystemTime::now(),
            memory: args.memory,
            completed,
            state: Mutex::new(DownloadState {
                errors: Vec::new(),
                end_time: None,
                chunks: Vec::new(),
            }),
        })
    }

    /// Track a chunk belonging to this download. Must be called for every
    /// chunk before it is queued, so `chunks_remaining` is complete before
    /// the first chunk can finish.
    pub fn register_chunk(&self, chunk: &Arc<ChunkJob>) {
        self.chunks_remaining.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap().chunks.push(Arc::downgrade(chunk));
    }

    /// Whether the completion signal has been raised.
    pub fn is_complete(&self) -> bool {
        *self.completed.borrow()
    }

    /// The primary error, if the download failed.
    pub fn err(&self) -> Option<DownloadError> {
        self.state.lock().unwrap().errors.first().cloned()
    }

    /// All accumulated errors joined for reporting; empty when none.
    pub fn error_string(&self) -> String {
        compose(&self.state.lock().unwrap().errors)
    }

    pub fn data_received(&self) -> u64 {
        self.data_received.load(Ordering::Relaxed)
    }

    pub fn total_transferred(&self) -> u64 {
        self.total_transferred.load(Ordering::Relaxed)
    }

    pub(crate) fn add_data_received(&self, n: u64) {
        self.data_received.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_total_transferred(&self, n: u64) {
        self.total_transferred.fetch_add(n, Ordering::Relaxed);
    }

    /// Wait for the completion signal, then report the outcome.
    pub async fn wait(&self) -> Result<(), DownloadError> {
        let mut rx = self.completed.subscribe();
        let _ = rx.wait_for(|done| *done).await;
        match self.err() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Mark the download failed. The first call raises the completion signal
    /// and closes the destination; further calls append their error to the
    /// slot. Failing a download that already completed *successfully* is a
    /// bug in the caller and is logged at critical level.
    pub fn managed_fail(&self, err: DownloadError) {
        let chunks = {
            let mut st = self.state.lock().unwrap();
            if self.is_complete() {
                if !st.errors.is_empty() {
                    st.errors.push(err);
                } else {
                    tracing::error!(
                        path = %self.path,
                        error = %err,
                        "download completed without error but managed_fail was called"
                    );
                }
                return;
            }
            st.errors.push(err);
            st.end_time = Some(SystemTime::now());
            let chunks: Vec<_> = st.chunks.iter().filter_map(Weak::upgrade).collect();
            // send_replace: the signal must flip even with no waiters.
            self.completed.send_replace(true);
            chunks
        };

        if let Err(e) = self.destination.close() {
            tracing::warn!(path = %self.path, error = %e, "unable to close download destination");
        }
        // Abort outside the state lock; chunks take their own locks and
        // return their memory reservations.
        for chunk in chunks {
            chunk.abort();
        }
    }

    /// Called by the assembler when a chunk has been decoded and written.
    /// The last chunk raises the completion signal.
    pub(crate) fn chunk_complete(&self) {
        if self.chunks_remaining.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let mut st = self.state.lock().unwrap();
        if self.is_complete() {
            return;
        }
        st.end_time = Some(SystemTime::now());
        self.completed.send_replace(true);
        tracing::debug!(path = %self.path, length = self.length, "download complete");
    }

    /// Cancel the download. Follows the same path as a renter shutdown.
    pub fn cancel(&self) {
        self.managed_fail(DownloadError::Interrupted);
    }

    /// Snapshot for download history.
    pub fn info(&self) -> DownloadInfo {
        let st = self.state.lock().unwrap();
        DownloadInfo {
            destination: self.destination_string.clone(),
            destination_type: self.destination_type,
            length: self.length,
            offset: self.offset,
            path: self.path.clone(),
            completed: self.is_complete(),
            start_time: self.start_system,
            end_time: st.end_time,
            received: self.data_received(),
            total_data_transferred: self.total_transferred(),
            error: compose(&st.errors),
        }
    }
}
