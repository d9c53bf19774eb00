//! Priority queue of pending chunks, plus the scheduler's wake signal.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::Notify;

use crate::chunk::ChunkJob;

struct HeapEntry {
    priority: u64,
    started: Instant,
    seq: u64,
    chunk: Arc<ChunkJob>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Max-heap: higher priority first, then earlier download start, then
    // insertion order so ties stay stable.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.started.cmp(&self.started))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Pending-chunk queue. Pushes wake the scheduler through a single-slot
/// signal, so any burst of pushes collapses into one pending wake.
pub struct DownloadHeap {
    heap: Mutex<BinaryHeap<HeapEntry>>,
    seq: AtomicU64,
    wake: Notify,
}

impl Default for DownloadHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadHeap {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            wake: Notify::new(),
        }
    }

    /// Queue a chunk and signal the scheduler.
    pub fn push(&self, chunk: Arc<ChunkJob>) {
        let entry = HeapEntry {
            priority: chunk.priority,
            started: chunk.download.start_time,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            chunk,
        };
        self.heap.lock().unwrap().push(entry);
        self.wake.notify_one();
    }

    /// Remove the highest-priority chunk, if any.
    pub fn pop(&self) -> Option<Arc<ChunkJob>> {
        self.heap.lock().unwrap().pop().map(|e| e.chunk)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Park until the next push. A push that raced ahead of this call is not
    /// lost; the stored permit wakes the caller immediately.
    pub async fn wait_for_work(&self) {
        self.wake.notified().await;
    }
}
