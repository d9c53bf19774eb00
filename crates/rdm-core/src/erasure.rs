//! Reed-Solomon erasure coding over GF(2^8): any K of N pieces recover a chunk.

use bytes::Bytes;
use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::DownloadError;

/// K-of-N erasure coder for one file's chunks.
///
/// Encoding is only exercised by fixtures and the upload path's collaborator;
/// the download engine itself only decodes.
pub struct ErasureCoder {
    rs: ReedSolomon,
    data_pieces: usize,
    total_pieces: usize,
}

impl ErasureCoder {
    pub fn new(data_pieces: usize, total_pieces: usize) -> anyhow::Result<Self> {
        if total_pieces <= data_pieces {
            anyhow::bail!(
                "total pieces {} must exceed data pieces {}",
                total_pieces,
                data_pieces
            );
        }
        let rs = ReedSolomon::new(data_pieces, total_pieces - data_pieces)
            .map_err(|e| anyhow::anyhow!("reed-solomon init: {}", e))?;
        Ok(Self {
            rs,
            data_pieces,
            total_pieces,
        })
    }

    /// Minimum pieces required to recover a chunk.
    pub fn min_pieces(&self) -> usize {
        self.data_pieces
    }

    pub fn num_pieces(&self) -> usize {
        self.total_pieces
    }

    /// Encode one chunk of data into N equal-size pieces. `data` is padded
    /// with zeros up to `piece_size * K`; callers slice decoded output back
    /// down by fetch length, so padding never leaks out.
    pub fn encode(&self, data: &[u8], piece_size: usize) -> anyhow::Result<Vec<Bytes>> {
        let data_len = piece_size * self.data_pieces;
        if data.len() > data_len {
            anyhow::bail!(
                "chunk of {} bytes exceeds {} data bytes",
                data.len(),
                data_len
            );
        }
        let mut shards: Vec<Vec<u8>> = vec![vec![0u8; piece_size]; self.total_pieces];
        for (i, shard) in shards.iter_mut().take(self.data_pieces).enumerate() {
            let offset = i * piece_size;
            if offset >= data.len() {
                break;
            }
            let len = piece_size.min(data.len() - offset);
            shard[..len].copy_from_slice(&data[offset..offset + len]);
        }
        self.rs
            .encode(&mut shards)
            .map_err(|e| anyhow::anyhow!("reed-solomon encode: {}", e))?;
        Ok(shards.into_iter().map(Bytes::from).collect())
    }

    /// Recover a chunk from any K present pieces and return the bytes in
    /// `[fetch_offset, fetch_offset + fetch_length)` of the decoded data.
    ///
    /// `shards` must have one slot per piece index; missing pieces are `None`.
    pub fn decode(
        &self,
        mut shards: Vec<Option<Vec<u8>>>,
        fetch_offset: u64,
        fetch_length: u64,
    ) -> Result<Bytes, DownloadError> {
        if shards.len() != self.total_pieces {
            return Err(DownloadError::DecodeFailed(format!(
                "have {} piece slots, expected {}",
                shards.len(),
                self.total_pieces
            )));
        }
        self.rs
            .reconstruct_data(&mut shards)
            .map_err(|e| DownloadError::DecodeFailed(e.to_string()))?;

        let mut data = Vec::with_capacity(
            shards
                .iter()
                .take(self.data_pieces)
                .map(|s| s.as_ref().map(|v| v.len()).unwrap_or(0))
                .sum(),
        );
        for shard in shards.into_iter().take(self.data_pieces) {
            match shard {
                Some(s) => data.extend_from_slice(&s),
                None => {
                    return Err(DownloadError::DecodeFailed(
                        "data shard missing after reconstruction".into(),
                    ))
                }
            }
        }

        let start = fetch_offset as usize;
        let end = (fetch_offset + fetch_length) as usize;
        if end > data.len() {
            return Err(DownloadError::DecodeFailed(format!(
                "fetch range [{}, {}) exceeds decoded chunk of {} bytes",
                start,
                end,
                data.len()
            )));
        }
        let mut data = Bytes::from(data);
        let mut tail = data.split_off(start);
        Ok(tail.split_to(end - start))
    }
}
