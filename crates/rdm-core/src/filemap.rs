//! File metadata: chunk/piece geometry and the contract → piece mapping.
//!
//! A `FileSnapshot` is the read-only view of one stored file that the
//! download engine works from. It is built by the file-metadata collaborator
//! (upload and repair live elsewhere) and never mutated after registration.

use std::collections::HashMap;
use std::fmt;

use sha2::{Digest, Sha256};

/// Identifier of a file contract with one host. Contracts are renewed under
/// new identifiers; `ContractResolver` maps historical ids to current ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContractId(pub [u8; 32]);

impl ContractId {
    /// Deterministic id for tests and fixtures.
    pub fn from_seed(seed: u64) -> Self {
        let mut b = [0u8; 32];
        b[..8].copy_from_slice(&seed.to_le_bytes());
        ContractId(b)
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &hex::encode(self.0)[..16])
    }
}

/// Content root of one erasure-coded piece. A host returns the piece bytes
/// for a root; the worker verifies the bytes hash back to the same root
/// before accepting them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PieceRoot(pub [u8; 32]);

impl PieceRoot {
    /// Root of a piece's bytes (SHA-256).
    pub fn of(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut b = [0u8; 32];
        b.copy_from_slice(&digest);
        PieceRoot(b)
    }
}

impl fmt::Display for PieceRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &hex::encode(self.0)[..16])
    }
}

/// Which piece of a chunk a contract is responsible for, and its root.
#[derive(Debug, Clone, Copy)]
pub struct PieceInfo {
    pub piece_index: usize,
    pub root: PieceRoot,
}

/// Maps a historical contract id to its current id. Contracts renew under
/// new ids while the file metadata still records the id at upload time.
pub trait ContractResolver: Send + Sync {
    fn resolve(&self, id: ContractId) -> ContractId;
}

/// Resolver for setups where contract ids never change (tests, single-session
/// contract sets).
pub struct IdentityResolver;

impl ContractResolver for IdentityResolver {
    fn resolve(&self, id: ContractId) -> ContractId {
        id
    }
}

/// A piece location recorded in the file metadata.
#[derive(Debug, Clone, Copy)]
struct PieceRecord {
    chunk_index: u64,
    piece_index: usize,
    root: PieceRoot,
}

/// Read-only metadata for one stored file.
pub struct FileSnapshot {
    path: String,
    size: u64,
    chunk_size: u64,
    data_pieces: usize,
    total_pieces: usize,
    master_key: [u8; 32],
    pieces: HashMap<ContractId, Vec<PieceRecord>>,
}

impl FileSnapshot {
    /// Create an empty snapshot. `chunk_size` must divide evenly into
    /// `data_pieces` pieces, otherwise piece boundaries would not line up
    /// with erasure shards.
    pub fn new(
        path: impl Into<String>,
        size: u64,
        chunk_size: u64,
        data_pieces: usize,
        total_pieces: usize,
        master_key: [u8; 32],
    ) -> anyhow::Result<Self> {
        if chunk_size == 0 {
            anyhow::bail!("chunk size must be positive");
        }
        if data_pieces == 0 || total_pieces <= data_pieces {
            anyhow::bail!(
                "invalid erasure parameters: {} of {}",
                data_pieces,
                total_pieces
            );
        }
        if chunk_size % data_pieces as u64 != 0 {
            anyhow::bail!(
                "chunk size {} is not divisible into {} pieces",
                chunk_size,
                data_pieces
            );
        }
        Ok(Self {
            path: path.into(),
            size,
            chunk_size,
            data_pieces,
            total_pieces,
            master_key,
            pieces: HashMap::new(),
        })
    }

    /// Record that `contract` holds piece `piece_index` of chunk
    /// `chunk_index`, with content root `root`.
    pub fn add_piece(
        &mut self,
        contract: ContractId,
        chunk_index: u64,
        piece_index: usize,
        root: PieceRoot,
    ) {
        self.pieces.entry(contract).or_default().push(PieceRecord {
            chunk_index,
            piece_index,
            root,
        });
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Size of one erasure-coded piece.
    pub fn piece_size(&self) -> u64 {
        self.chunk_size / self.data_pieces as u64
    }

    pub fn data_pieces(&self) -> usize {
        self.data_pieces
    }

    pub fn total_pieces(&self) -> usize {
        self.total_pieces
    }

    /// Master key for the file. Decryption happens in the collaborator that
    /// consumes decoded chunks; the engine only carries the key through.
    pub fn master_key(&self) -> &[u8; 32] {
        &self.master_key
    }

    /// Number of chunks in the file.
    pub fn num_chunks(&self) -> u64 {
        self.size.div_ceil(self.chunk_size)
    }

    /// Build one host → piece map per chunk in `[min_chunk, max_chunk]`,
    /// keyed by resolved contract id.
    ///
    /// At most one piece per (chunk, host): if the metadata records several,
    /// the first wins and the duplicate is logged — the repair path should
    /// never spread two pieces of one chunk across the same host.
    pub fn chunk_maps(
        &self,
        resolver: &dyn ContractResolver,
        min_chunk: u64,
        max_chunk: u64,
    ) -> Vec<HashMap<ContractId, PieceInfo>> {
        let count = (max_chunk - min_chunk + 1) as usize;
        let mut maps: Vec<HashMap<ContractId, PieceInfo>> = vec![HashMap::new(); count];
        for (id, records) in &self.pieces {
            let resolved = resolver.resolve(*id);
            for rec in records {
                if rec.chunk_index < min_chunk || rec.chunk_index > max_chunk {
                    continue;
                }
                let map = &mut maps[(rec.chunk_index - min_chunk) as usize];
                if map.contains_key(&resolved) {
                    tracing::error!(
                        host = %resolved,
                        chunk = rec.chunk_index,
                        "host has multiple pieces for the same chunk"
                    );
                    continue;
                }
                map.insert(
                    resolved,
                    PieceInfo {
                        piece_index: rec.piece_index,
                        root: rec.root,
                    },
                );
            }
        }
        maps
    }
}
