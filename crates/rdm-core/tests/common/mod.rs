//! Shared fixtures: an in-process mock host network and erasure-encoded
//! test files.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use rdm_core::erasure::ErasureCoder;
use rdm_core::filemap::{ContractId, FileSnapshot, PieceRoot};
use rdm_core::worker::HostClient;

/// A fake host serving pieces from memory with configurable latency and an
/// on/off failure switch.
pub struct MockHost {
    pieces: Mutex<HashMap<PieceRoot, Bytes>>,
    latency: Mutex<Duration>,
    failing: AtomicBool,
    fetches: AtomicU64,
}

impl MockHost {
    pub fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            pieces: Mutex::new(HashMap::new()),
            latency: Mutex::new(latency),
            failing: AtomicBool::new(false),
            fetches: AtomicU64::new(0),
        })
    }

    pub fn store(&self, root: PieceRoot, data: Bytes) {
        self.pieces.lock().unwrap().insert(root, data);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl HostClient for MockHost {
    async fn fetch_piece(&self, root: PieceRoot) -> anyhow::Result<Bytes> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock().unwrap();
        tokio::time::sleep(latency).await;
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("host unreachable");
        }
        self.pieces
            .lock()
            .unwrap()
            .get(&root)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no piece with root {root}"))
    }
}

/// Deterministic pseudo-random file content.
pub fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) ^ (i >> 8)) as u8).collect()
}

/// A file fixture: its metadata snapshot, its content, and N mock hosts —
/// host `i` holds piece `i` of every chunk.
pub struct TestFile {
    pub snapshot: FileSnapshot,
    pub data: Vec<u8>,
    pub hosts: Vec<(ContractId, Arc<MockHost>)>,
}

/// Erasure-code `data` into a file snapshot plus the mock hosts backing it.
pub fn build_file(
    path: &str,
    data: Vec<u8>,
    chunk_size: u64,
    data_pieces: usize,
    total_pieces: usize,
    host_latency: Duration,
) -> TestFile {
    rdm_core::logging::init_logging();
    let coder = ErasureCoder::new(data_pieces, total_pieces).unwrap();
    let piece_size = (chunk_size as usize) / data_pieces;
    let mut snapshot = FileSnapshot::new(
        path,
        data.len() as u64,
        chunk_size,
        data_pieces,
        total_pieces,
        [7u8; 32],
    )
    .unwrap();

    let hosts: Vec<(ContractId, Arc<MockHost>)> = (0..total_pieces)
        .map(|i| (ContractId::from_seed(i as u64), MockHost::new(host_latency)))
        .collect();

    let num_chunks = (data.len() as u64).div_ceil(chunk_size);
    for chunk_index in 0..num_chunks {
        let start = (chunk_index * chunk_size) as usize;
        let end = (start + chunk_size as usize).min(data.len());
        let pieces = coder.encode(&data[start..end], piece_size).unwrap();
        for (piece_index, piece) in pieces.into_iter().enumerate() {
            let root = PieceRoot::of(&piece);
            let (contract, host) = &hosts[piece_index];
            host.store(root, piece);
            snapshot.add_piece(*contract, chunk_index, piece_index, root);
        }
    }

    TestFile {
        snapshot,
        data,
        hosts,
    }
}
