//! Public surface of the download engine: queue downloads, inspect history,
//! register files and host contracts, shut everything down.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::chunk::{ChunkArgs, ChunkJob};
use crate::config::RenterConfig;
use crate::destination::{DestinationSink, FileDestination, StreamDestination};
use crate::download::{Download, DownloadArgs, DownloadInfo};
use crate::erasure::ErasureCoder;
use crate::error::DownloadError;
use crate::filemap::{ContractId, ContractResolver, FileSnapshot};
use crate::heap::DownloadHeap;
use crate::memory::MemoryManager;
use crate::scheduler::Scheduler;
use crate::worker::{HostClient, WorkerHandle};

/// Parameters for one download request.
///
/// Exactly one of `destination` (an absolute file path) or `http_writer`
/// (a streaming sink, e.g. an HTTP response body) must be set. `length` of 0
/// means "from offset to end of file". The optional tuning fields fall back
/// to the renter's config.
#[derive(Default)]
pub struct DownloadParams {
    pub path: String,
    pub offset: u64,
    pub length: u64,
    pub destination: Option<PathBuf>,
    pub http_writer: Option<Box<dyn Write + Send>>,
    pub latency_target_ms: Option<u64>,
    pub overdrive: Option<u32>,
    pub priority: Option<u64>,
}

/// The download engine. Owns the scheduler task, the per-host workers, the
/// shared memory budget, and the session's download history.
pub struct Renter {
    cfg: RenterConfig,
    memory: Arc<MemoryManager>,
    heap: Arc<DownloadHeap>,
    workers: Arc<RwLock<HashMap<ContractId, WorkerHandle>>>,
    files: RwLock<HashMap<String, Arc<FileSnapshot>>>,
    resolver: Arc<dyn ContractResolver>,
    history: Mutex<Vec<Arc<Download>>>,
    shutdown_tx: watch::Sender<bool>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl Renter {
    /// Create the engine and start its scheduler. Must be called from within
    /// a tokio runtime.
    pub fn new(cfg: RenterConfig, resolver: Arc<dyn ContractResolver>) -> Self {
        let memory = Arc::new(MemoryManager::new(cfg.memory_budget));
        let heap = Arc::new(DownloadHeap::new());
        let workers = Arc::new(RwLock::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Scheduler::spawn(
            Arc::clone(&heap),
            Arc::clone(&memory),
            Arc::clone(&workers),
            shutdown_rx,
        );
        Self {
            cfg,
            memory,
            heap,
            workers,
            files: RwLock::new(HashMap::new()),
            resolver,
            history: Mutex::new(Vec::new()),
            shutdown_tx,
            scheduler: Mutex::new(Some(scheduler)),
        }
    }

    /// Register (or replace) the metadata snapshot for a file.
    pub fn insert_file(&self, snapshot: FileSnapshot) {
        let path = snapshot.path().to_string();
        self.files
            .write()
            .unwrap()
            .insert(path, Arc::new(snapshot));
    }

    /// Start a worker for a host contract. Replacing an existing contract
    /// kills its old worker.
    pub fn add_host(&self, contract: ContractId, client: Arc<dyn HostClient>) {
        let worker = WorkerHandle::spawn(
            contract,
            client,
            Arc::clone(&self.heap),
            &self.cfg,
            self.shutdown_tx.subscribe(),
        );
        if let Some(old) = self.workers.write().unwrap().insert(contract, worker) {
            old.kill();
        }
    }

    /// Stop and remove a host's worker. Its queued fetches fail over to
    /// other hosts holding the same chunks.
    pub fn remove_host(&self, contract: ContractId) {
        let removed = self.workers.write().unwrap().remove(&contract);
        if let Some(worker) = removed {
            worker.kill();
        }
    }

    /// Download a byte range of a file and block until it completes or the
    /// renter shuts down.
    pub async fn download(&self, params: DownloadParams) -> Result<(), DownloadError> {
        let download = self.start_download(params, false)?;
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::select! {
            res = download.wait() => res,
            _ = shutdown.wait_for(|stop| *stop) => Err(DownloadError::Interrupted),
        }
    }

    /// Queue a download and return its handle without waiting. Not available
    /// for streaming destinations, which need the caller to keep consuming.
    pub fn download_async(&self, params: DownloadParams) -> Result<Arc<Download>, DownloadError> {
        self.start_download(params, true)
    }

    /// Snapshot of this session's downloads, most recent first.
    pub fn download_history(&self) -> Vec<DownloadInfo> {
        let history = self.history.lock().unwrap();
        history.iter().rev().map(|d| d.info()).collect()
    }

    /// Current memory reservation across all downloads. Zero once every
    /// download has terminated.
    pub fn memory_outstanding(&self) -> u64 {
        self.memory.outstanding()
    }

    /// Stop the engine: fail incomplete downloads, stop the scheduler and
    /// every worker, and wait for their tasks to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.memory.shutdown();

        let downloads: Vec<Arc<Download>> = self.history.lock().unwrap().clone();
        for d in downloads {
            if !d.is_complete() {
                d.managed_fail(DownloadError::Interrupted);
            }
        }

        let scheduler = self.scheduler.lock().unwrap().take();
        if let Some(handle) = scheduler {
            let _ = handle.await;
        }
        let workers: Vec<WorkerHandle> = {
            let mut map = self.workers.write().unwrap();
            map.drain().map(|(_, w)| w).collect()
        };
        for worker in &workers {
            worker.kill();
        }
        for worker in &workers {
            worker.join().await;
        }
        tracing::info!("renter download engine stopped");
    }

    fn start_download(
        &self,
        mut params: DownloadParams,
        is_async: bool,
    ) -> Result<Arc<Download>, DownloadError> {
        // Look up the file for the given path.
        let file = self
            .files
            .read()
            .unwrap()
            .get(&params.path)
            .cloned()
            .ok_or_else(|| {
                DownloadError::invalid(format!("no file with that path: {}", params.path))
            })?;

        // Validate download parameters.
        let is_http = params.http_writer.is_some();
        if is_async && is_http {
            return Err(DownloadError::invalid("cannot async download to http response"));
        }
        if is_http && params.destination.is_some() {
            return Err(DownloadError::invalid(
                "destination cannot be specified when downloading to http response",
            ));
        }
        if !is_http && params.destination.is_none() {
            return Err(DownloadError::invalid("destination not supplied"));
        }
        if let Some(dest) = &params.destination {
            if !dest.is_absolute() {
                return Err(DownloadError::invalid("destination must be an absolute path"));
            }
        }
        if params.offset == file.size() {
            return Err(DownloadError::invalid("offset equals filesize"));
        }
        if params.offset > file.size() {
            return Err(DownloadError::invalid(format!(
                "offset and length combination invalid, max byte is at index {}",
                file.size() - 1
            )));
        }
        // Sentinel: a length of 0 means "download the whole file".
        if params.length == 0 {
            params.length = file.size() - params.offset;
        }
        if params.offset + params.length > file.size() {
            return Err(DownloadError::invalid(format!(
                "offset and length combination invalid, max byte is at index {}",
                file.size() - 1
            )));
        }

        // Instantiate the destination sink.
        let (destination, destination_type, destination_string): (
            Arc<dyn DestinationSink>,
            &'static str,
            String,
        ) = if is_http {
            let writer = params.http_writer.take().unwrap();
            (
                Arc::new(StreamDestination::new(writer, self.cfg.stream_window)),
                "http stream",
                String::new(),
            )
        } else {
            let path = params.destination.clone().unwrap();
            let sink = FileDestination::create(&path)
                .map_err(|e| DownloadError::DestinationWriteFailed(e.to_string()))?;
            (Arc::new(sink), "file", path.display().to_string())
        };

        let download = self.new_download(
            &file,
            destination,
            destination_type,
            destination_string,
            &params,
        )?;

        self.history.lock().unwrap().push(Arc::clone(&download));
        Ok(download)
    }

    /// Create the download object and queue one chunk job per covered chunk.
    ///
    /// Re-validates the range as strictly as the public entry point, so an
    /// internal caller cannot sneak past the pre-flight checks.
    fn new_download(
        &self,
        file: &Arc<FileSnapshot>,
        destination: Arc<dyn DestinationSink>,
        destination_type: &'static str,
        destination_string: String,
        params: &DownloadParams,
    ) -> Result<Arc<Download>, DownloadError> {
        if params.length == 0 {
            return Err(DownloadError::invalid(
                "download length must be a positive whole number",
            ));
        }
        if params.offset >= file.size() || params.offset + params.length > file.size() {
            return Err(DownloadError::invalid(
                "download is requesting data past the boundary of the file",
            ));
        }

        let latency_target = Duration::from_millis(
            params
                .latency_target_ms
                .unwrap_or(self.cfg.default_latency_target_ms),
        );
        let overdrive = params.overdrive.unwrap_or(self.cfg.default_overdrive);
        let priority = params.priority.unwrap_or(self.cfg.default_priority);

        let download = Download::new(DownloadArgs {
            destination,
            destination_string,
            destination_type,
            length: params.length,
            offset: params.offset,
            path: params.path.clone(),
            latency_target,
            overdrive,
            priority,
            memory: Arc::clone(&self.memory),
        });

        let erasure = Arc::new(
            ErasureCoder::new(file.data_pieces(), file.total_pieces())
                .map_err(|e| DownloadError::invalid(format!("invalid erasure parameters: {e}")))?,
        );

        // Determine which chunks to download and their per-chunk ranges.
        let chunk_size = file.chunk_size();
        let min_chunk = params.offset / chunk_size;
        let max_chunk = (params.offset + params.length - 1) / chunk_size;
        let mut chunk_maps = file
            .chunk_maps(self.resolver.as_ref(), min_chunk, max_chunk)
            .into_iter();

        let mut chunks = Vec::with_capacity((max_chunk - min_chunk + 1) as usize);
        let mut write_offset = 0u64;
        for index in min_chunk..=max_chunk {
            let relative_index = index - min_chunk;

            let fetch_offset = if index == min_chunk {
                params.offset % chunk_size
            } else {
                0
            };
            let fetch_length =
                if index == max_chunk && (params.offset + params.length) % chunk_size != 0 {
                    ((params.offset + params.length) % chunk_size) - fetch_offset
                } else {
                    chunk_size - fetch_offset
                };

            // Later chunks accept slower workers: the caller is waiting on
            // the first bytes, not the last.
            let chunk_latency = latency_target
                + Duration::from_millis(self.cfg.latency_relax_per_chunk_ms * relative_index);
            let chunk_overdrive = if relative_index < self.cfg.overdrive_chunk_cutoff {
                overdrive
            } else {
                0
            };

            let chunk = ChunkJob::new(ChunkArgs {
                chunk_index: index,
                relative_index,
                fetch_offset,
                fetch_length,
                write_offset,
                piece_size: file.piece_size(),
                latency_target: chunk_latency,
                overdrive: chunk_overdrive,
                piece_map: chunk_maps.next().unwrap_or_default(),
                erasure: Arc::clone(&erasure),
                download: Arc::clone(&download),
            });
            download.register_chunk(&chunk);
            chunks.push(chunk);

            write_offset += fetch_length;
        }

        // Queue only after every chunk is registered, so an early completion
        // cannot see a partial chunk count.
        for chunk in chunks {
            self.heap.push(chunk);
        }
        tracing::debug!(
            path = %params.path,
            offset = params.offset,
            length = params.length,
            chunks = max_chunk - min_chunk + 1,
            "download queued"
        );
        Ok(download)
    }
}
