//! Write targets for decoded chunk data: file, in-memory buffer, or an
//! ordered stream (e.g. an HTTP response body).

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};

/// Where decoded chunk bytes land.
///
/// `write_at` is safe for concurrent calls with non-overlapping ranges —
/// chunks complete out of order and write independently. `close` is
/// idempotent; the first failure path closes the sink and later completion
/// paths may close it again.
pub trait DestinationSink: Send + Sync {
    fn write_at(&self, data: &[u8], offset: u64) -> Result<()>;
    fn close(&self) -> Result<()>;
}

/// File destination with pwrite-style positioned writes.
pub struct FileDestination {
    file: File,
    closed: AtomicBool,
}

impl FileDestination {
    /// Create (or open) the destination file for writing. Existing content
    /// is not truncated; the download writes every byte of its range.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::options()
            .create(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open destination {}", path.display()))?;
        Ok(Self {
            file,
            closed: AtomicBool::new(false),
        })
    }
}

impl DestinationSink for FileDestination {
    #[cfg(unix)]
    fn write_at(&self, data: &[u8], offset: u64) -> Result<()> {
        let n = self
            .file
            .write_at(data, offset)
            .context("destination write_at failed")?;
        if n != data.len() {
            anyhow::bail!("short write: {} of {}", n, data.len());
        }
        Ok(())
    }

    /// Non-Unix fallback: seek + write on a cloned handle. Not atomic with
    /// respect to other writers, but ranges never overlap.
    #[cfg(not(unix))]
    fn write_at(&self, data: &[u8], offset: u64) -> Result<()> {
        use std::io::{Seek, SeekFrom};
        let mut f = self.file.try_clone()?;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(data)?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.file.sync_all().context("destination sync failed")?;
        Ok(())
    }
}

/// In-memory destination, used for buffer downloads and tests.
#[derive(Default)]
pub struct BufferDestination {
    buf: Mutex<Vec<u8>>,
}

impl BufferDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far. Unwritten gaps read as zero.
    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().unwrap().clone()
    }
}

impl DestinationSink for BufferDestination {
    fn write_at(&self, data: &[u8], offset: u64) -> Result<()> {
        let mut buf = self.buf.lock().unwrap();
        let end = offset as usize + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct StreamState {
    writer: Option<Box<dyn Write + Send>>,
    next_offset: u64,
    pending: BTreeMap<u64, Vec<u8>>,
    buffered: u64,
}

/// Destination over a sequential writer, e.g. an HTTP response body.
///
/// Chunks may complete out of order, but the stream must receive bytes in
/// offset order. Writes ahead of `next_offset` are buffered until the gap
/// fills in; the buffer is bounded by `window` bytes.
pub struct StreamDestination {
    state: Mutex<StreamState>,
    window: u64,
}

impl StreamDestination {
    pub fn new(writer: Box<dyn Write + Send>, window: u64) -> Self {
        Self {
            state: Mutex::new(StreamState {
                writer: Some(writer),
                next_offset: 0,
                pending: BTreeMap::new(),
                buffered: 0,
            }),
            window,
        }
    }
}

impl DestinationSink for StreamDestination {
    fn write_at(&self, data: &[u8], offset: u64) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.writer.is_none() {
            anyhow::bail!("stream destination is closed");
        }

        if offset != st.next_offset {
            st.buffered += data.len() as u64;
            if st.buffered > self.window {
                anyhow::bail!("out-of-order exceeded buffer");
            }
            st.pending.insert(offset, data.to_vec());
            return Ok(());
        }

        let writer = st.writer.as_mut().unwrap();
        writer.write_all(data).context("stream write failed")?;
        st.next_offset = offset + data.len() as u64;

        // Flush any buffered writes that are now contiguous.
        while let Some((&off, _)) = st.pending.first_key_value() {
            if off != st.next_offset {
                break;
            }
            let buf = st.pending.remove(&off).unwrap();
            st.buffered -= buf.len() as u64;
            let end = off + buf.len() as u64;
            st.writer
                .as_mut()
                .unwrap()
                .write_all(&buf)
                .context("stream write failed")?;
            st.next_offset = end;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if let Some(mut w) = st.writer.take() {
            w.flush().context("stream flush failed")?;
        }
        Ok(())
    }
}
