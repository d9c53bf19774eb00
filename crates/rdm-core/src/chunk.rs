//! One unfinished download chunk: piece tracking, dispatch planning, and
//! assembly (decode + write) once enough pieces are in hand.
//!
//! Workers never transition chunk state; they only move piece slots. The
//! scheduler drives dispatch and the assembler drives the terminal states.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::download::Download;
use crate::erasure::ErasureCoder;
use crate::error::DownloadError;
use crate::filemap::{ContractId, PieceInfo, PieceRoot};

/// Assignment state of one piece slot.
///
/// `Standby` means the piece sits in a slow worker's deferred inbox and is
/// counted against the dispatch target; the worker flips it to `InFlight`
/// when it actually starts fetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceSlot {
    Unassigned,
    Standby(ContractId),
    InFlight(ContractId),
    Retrieved,
    Failed,
}

/// Lifecycle of a chunk. Terminal states are `Released` and `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPhase {
    Pending,
    MemoryReserved,
    Dispatching,
    AwaitingPieces,
    Decoding,
    Written,
    Released,
    Failed,
}

struct ChunkState {
    phase: ChunkPhase,
    pieces: Vec<PieceSlot>,
    shards: Vec<Option<Vec<u8>>>,
    /// Hosts this chunk has already been dispatched to; a failed host is
    /// never retried for the same chunk.
    attempted: HashSet<ContractId>,
    reserved_memory: u64,
    /// Count of accepted (non-late) pieces; equals filled `shards` slots.
    retrieved: usize,
    /// Bytes already credited to the download's received counter.
    received_accounted: u64,
}

/// Construction parameters for a chunk job.
pub struct ChunkArgs {
    pub chunk_index: u64,
    pub relative_index: u64,
    pub fetch_offset: u64,
    pub fetch_length: u64,
    pub write_offset: u64,
    pub piece_size: u64,
    pub latency_target: Duration,
    pub overdrive: u32,
    pub piece_map: HashMap<ContractId, PieceInfo>,
    pub erasure: Arc<ErasureCoder>,
    pub download: Arc<Download>,
}

/// A chunk queued for download.
pub struct ChunkJob {
    pub chunk_index: u64,
    pub relative_index: u64,
    /// Offset within the decoded chunk where the requested range starts.
    pub fetch_offset: u64,
    /// Bytes of the decoded chunk that belong to the requested range.
    pub fetch_length: u64,
    /// Offset within the destination where this chunk's bytes land.
    pub write_offset: u64,
    pub piece_size: u64,
    pub latency_target: Duration,
    pub overdrive: u32,
    pub priority: u64,
    pub piece_map: HashMap<ContractId, PieceInfo>,
    pub erasure: Arc<ErasureCoder>,
    pub download: Arc<Download>,

    /// One-shot decode latch. Whoever wins the swap runs the decode.
    decoded: AtomicBool,
    state: Mutex<ChunkState>,
}

/// One piece-fetch the scheduler decided to hand to a worker.
pub struct PieceAssignment {
    pub contract: ContractId,
    pub piece_index: usize,
    pub root: PieceRoot,
    pub standby: bool,
}

/// What the scheduler should do with the chunk after a dispatch round.
pub enum DispatchOutcome {
    /// Nothing further to dispatch right now; piece failures requeue the
    /// chunk if more sources are needed.
    Retired,
    /// Not enough reachable piece sources remain to ever recover the chunk.
    Insufficient { available: usize },
}

pub struct DispatchResult {
    pub jobs: Vec<PieceAssignment>,
    pub outcome: DispatchOutcome,
}

/// Shards handed off to the decode path. Constructed exactly once per chunk.
pub struct DecodeTicket {
    shards: Vec<Option<Vec<u8>>>,
}

impl ChunkJob {
    pub fn new(args: ChunkArgs) -> Arc<Self> {
        let n = args.erasure.num_pieces();
        Arc::new(Self {
            chunk_index: args.chunk_index,
            relative_index: args.relative_index,
            fetch_offset: args.fetch_offset,
            fetch_length: args.fetch_length,
            write_offset: args.write_offset,
            piece_size: args.piece_size,
            latency_target: args.latency_target,
            overdrive: args.overdrive,
            priority: args.download.priority,
            piece_map: args.piece_map,
            erasure: args.erasure,
            download: args.download,
            decoded: AtomicBool::new(false),
            state: Mutex::new(ChunkState {
                phase: ChunkPhase::Pending,
                pieces: vec![PieceSlot::Unassigned; n],
                shards: vec![None; n],
                attempted: HashSet::new(),
                reserved_memory: 0,
                retrieved: 0,
                received_accounted: 0,
            }),
        })
    }

    /// Bytes to reserve before dispatch: raw piece buffers plus decode slots.
    pub fn memory_needed(&self) -> u64 {
        (self.erasure.num_pieces() + self.erasure.min_pieces()) as u64 * self.piece_size
    }

    pub fn needs_memory(&self) -> bool {
        self.state.lock().unwrap().phase == ChunkPhase::Pending
    }

    /// Record a granted reservation. Returns false — and gives the bytes
    /// straight back — when the chunk went terminal while the scheduler was
    /// parked on the memory manager.
    pub fn set_memory_reserved(&self, amount: u64) -> bool {
        let mut st = self.state.lock().unwrap();
        if Self::terminal(&st) {
            drop(st);
            self.download.memory.release(amount);
            return false;
        }
        st.reserved_memory = amount;
        st.phase = ChunkPhase::MemoryReserved;
        true
    }

    pub fn is_terminal(&self) -> bool {
        Self::terminal(&self.state.lock().unwrap())
    }

    pub fn is_decoded(&self) -> bool {
        self.decoded.load(Ordering::SeqCst)
    }

    /// Whether a piece failure should put the chunk back on the heap.
    pub fn needs_attention(&self) -> bool {
        !self.is_decoded() && !self.is_terminal() && !self.download.is_complete()
    }

    pub fn phase(&self) -> ChunkPhase {
        self.state.lock().unwrap().phase
    }

    fn terminal(st: &ChunkState) -> bool {
        matches!(st.phase, ChunkPhase::Released | ChunkPhase::Failed)
    }

    fn slot_counts(st: &ChunkState) -> (usize, usize) {
        let mut in_flight = 0;
        let mut standby = 0;
        for slot in &st.pieces {
            match slot {
                PieceSlot::InFlight(_) => in_flight += 1,
                PieceSlot::Standby(_) => standby += 1,
                _ => {}
            }
        }
        (in_flight, standby)
    }

    fn release_memory(&self, st: &mut ChunkState) {
        if st.reserved_memory > 0 {
            self.download.memory.release(st.reserved_memory);
            st.reserved_memory = 0;
        }
    }

    /// Plan a dispatch round. `live_latency` reports the recent measured
    /// latency (in ms, 0 = unmeasured) of a live worker, or `None` when the
    /// host has no worker.
    ///
    /// Workers at or under the chunk's latency target are dispatched first;
    /// slower workers are promoted from standby only when the fast ones
    /// cannot reach the target of `K + overdrive` outstanding fetches.
    pub fn plan_dispatch(
        &self,
        live_latency: &dyn Fn(&ContractId) -> Option<u64>,
    ) -> DispatchResult {
        let mut st = self.state.lock().unwrap();
        if Self::terminal(&st) || self.is_decoded() {
            return DispatchResult {
                jobs: Vec::new(),
                outcome: DispatchOutcome::Retired,
            };
        }
        if self.download.is_complete() {
            // Parent failed while we were queued; give the memory back.
            st.phase = ChunkPhase::Failed;
            self.release_memory(&mut st);
            return DispatchResult {
                jobs: Vec::new(),
                outcome: DispatchOutcome::Retired,
            };
        }
        st.phase = ChunkPhase::Dispatching;

        let k = self.erasure.min_pieces();
        let target = k + self.overdrive as usize;
        let (in_flight, standby) = Self::slot_counts(&st);
        let outstanding = in_flight + standby;

        let mut candidates: Vec<(ContractId, PieceInfo, u64)> = Vec::new();
        for (contract, info) in &self.piece_map {
            if st.attempted.contains(contract) {
                continue;
            }
            match st.pieces[info.piece_index] {
                PieceSlot::Unassigned | PieceSlot::Failed => {}
                _ => continue,
            }
            if let Some(latency) = live_latency(contract) {
                candidates.push((*contract, *info, latency));
            }
        }

        // Several contracts may hold the same piece index (repair uploads);
        // only distinct pieces count toward recoverability.
        let distinct_pieces: HashSet<usize> =
            candidates.iter().map(|(_, info, _)| info.piece_index).collect();

        // A chunk that can never gather K pieces fails now rather than
        // spinning on the heap.
        if st.retrieved + outstanding + distinct_pieces.len() < k {
            return DispatchResult {
                jobs: Vec::new(),
                outcome: DispatchOutcome::Insufficient {
                    available: st.retrieved + outstanding + distinct_pieces.len(),
                },
            };
        }

        let target_ms = self.latency_target.as_millis() as u64;
        let (mut primaries, mut standbys): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|(_, _, latency)| *latency <= target_ms);
        primaries.sort_by_key(|(_, _, latency)| *latency);
        standbys.sort_by_key(|(_, _, latency)| *latency);

        let needed = target.saturating_sub(st.retrieved + outstanding);
        let ordered = primaries
            .into_iter()
            .map(|(contract, info, _)| (contract, info, false))
            .chain(
                standbys
                    .into_iter()
                    .map(|(contract, info, _)| (contract, info, true)),
            );
        let mut jobs: Vec<PieceAssignment> = Vec::new();
        for (contract, info, standby_class) in ordered {
            if jobs.len() >= needed {
                break;
            }
            // A slot may have been taken by a faster host this round.
            if !matches!(
                st.pieces[info.piece_index],
                PieceSlot::Unassigned | PieceSlot::Failed
            ) {
                continue;
            }
            st.attempted.insert(contract);
            st.pieces[info.piece_index] = if standby_class {
                PieceSlot::Standby(contract)
            } else {
                PieceSlot::InFlight(contract)
            };
            jobs.push(PieceAssignment {
                contract,
                piece_index: info.piece_index,
                root: info.root,
                standby: standby_class,
            });
        }

        st.phase = ChunkPhase::AwaitingPieces;
        DispatchResult {
            jobs,
            outcome: DispatchOutcome::Retired,
        }
    }

    /// A worker about to fetch checks in. Converts a standby slot to
    /// in-flight. Returns false when the chunk no longer wants the piece
    /// (already decoded, failed, or reassigned).
    pub fn claim_piece(&self, piece_index: usize, contract: ContractId) -> bool {
        let mut st = self.state.lock().unwrap();
        let ours = matches!(
            st.pieces[piece_index],
            PieceSlot::InFlight(c) | PieceSlot::Standby(c) if c == contract
        );
        if Self::terminal(&st) || self.is_decoded() || self.download.is_complete() {
            if ours {
                st.pieces[piece_index] = PieceSlot::Failed;
            }
            return false;
        }
        match st.pieces[piece_index] {
            PieceSlot::InFlight(c) if c == contract => true,
            PieceSlot::Standby(c) if c == contract => {
                st.pieces[piece_index] = PieceSlot::InFlight(contract);
                true
            }
            _ => false,
        }
    }

    /// A worker failed to fetch a piece. Frees the slot so the scheduler can
    /// retry the piece through a different host.
    pub fn piece_failed(&self, piece_index: usize, contract: ContractId, reason: &str) {
        let mut st = self.state.lock().unwrap();
        if matches!(
            st.pieces[piece_index],
            PieceSlot::InFlight(c) | PieceSlot::Standby(c) if c == contract
        ) {
            st.pieces[piece_index] = PieceSlot::Failed;
        }
        tracing::debug!(
            chunk = self.chunk_index,
            piece = piece_index,
            host = %contract,
            reason,
            "piece fetch failed"
        );
    }

    /// A worker delivered a verified piece. Returns the decode ticket when
    /// this was the K-th accepted piece; the caller runs `assemble` with it.
    ///
    /// Pieces arriving after the decode latch fired are discarded: their
    /// bytes count toward total transfer, not toward received data.
    pub fn piece_retrieved(
        &self,
        piece_index: usize,
        contract: ContractId,
        data: Bytes,
    ) -> Option<DecodeTicket> {
        self.download.add_total_transferred(data.len() as u64);

        let mut st = self.state.lock().unwrap();
        if Self::terminal(&st) || self.is_decoded() || self.download.is_complete() {
            if matches!(st.pieces[piece_index], PieceSlot::InFlight(c) if c == contract) {
                st.pieces[piece_index] = PieceSlot::Retrieved;
            }
            return None;
        }
        if !matches!(st.pieces[piece_index], PieceSlot::InFlight(c) if c == contract) {
            return None;
        }

        st.pieces[piece_index] = PieceSlot::Retrieved;
        st.shards[piece_index] = Some(data.to_vec());
        st.retrieved += 1;

        // Credit progress pro-rata so received data grows as pieces land and
        // sums to exactly fetch_length at the K-th piece.
        let k = self.erasure.min_pieces() as u64;
        let credited = self.fetch_length * st.retrieved.min(self.erasure.min_pieces()) as u64 / k;
        let share = credited.saturating_sub(st.received_accounted);
        st.received_accounted += share;
        self.download.add_data_received(share);

        if st.retrieved >= self.erasure.min_pieces()
            && self
                .decoded
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            st.phase = ChunkPhase::Decoding;
            let shards = std::mem::take(&mut st.shards);
            return Some(DecodeTicket { shards });
        }
        None
    }

    /// Decode the chunk from its pieces and write the requested range to the
    /// destination. Runs the blocking work off the async executor.
    pub async fn assemble(self: Arc<Self>, ticket: DecodeTicket) {
        let chunk = Arc::clone(&self);
        let result = tokio::task::spawn_blocking(move || -> Result<(), DownloadError> {
            let data =
                chunk
                    .erasure
                    .decode(ticket.shards, chunk.fetch_offset, chunk.fetch_length)?;
            chunk
                .download
                .destination
                .write_at(&data, chunk.write_offset)
                .map_err(|e| DownloadError::DestinationWriteFailed(e.to_string()))?;
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => self.finish_written(),
            Ok(Err(e)) => self.fail_chunk(e),
            Err(join_err) => self.fail_chunk(DownloadError::DecodeFailed(format!(
                "decode task failed: {join_err}"
            ))),
        }
    }

    fn finish_written(&self) {
        {
            let mut st = self.state.lock().unwrap();
            st.phase = ChunkPhase::Written;
            self.release_memory(&mut st);
            st.phase = ChunkPhase::Released;
        }
        tracing::debug!(
            chunk = self.chunk_index,
            bytes = self.fetch_length,
            "chunk decoded and written"
        );
        self.download.chunk_complete();
    }

    /// Fail this chunk and, through it, the parent download.
    pub fn fail_chunk(&self, err: DownloadError) {
        {
            let mut st = self.state.lock().unwrap();
            if Self::terminal(&st) {
                return;
            }
            st.phase = ChunkPhase::Failed;
            st.shards.clear();
            self.release_memory(&mut st);
        }
        tracing::warn!(chunk = self.chunk_index, error = %err, "chunk failed");
        self.download.managed_fail(err);
    }

    /// Terminal cleanup when the parent download has already failed: release
    /// resources without re-entering the download's failure path.
    pub fn abort(&self) {
        let mut st = self.state.lock().unwrap();
        if Self::terminal(&st) {
            return;
        }
        st.phase = ChunkPhase::Failed;
        st.shards.clear();
        self.release_memory(&mut st);
    }
}
