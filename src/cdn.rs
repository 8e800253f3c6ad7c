//! The seed cache: download once, serve many.
//!
//! [`SeedCache`] ties the pieces together. The first request for a key
//! creates the task and spawns its fetch; every later request for the same
//! key attaches to that fetch through the progress notifier and reads the
//! piece from the store once it is published.
//!
//! ```text
//! request_piece ──> TaskRegistry::create_or_get ──(created)──> SourceFetcher
//!       │                                                        │
//!       └──> ProgressNotifier::wait_for <──── publish ───────────┤
//!       └──> PieceStore::get <─────────────── put ───────────────┘
//! ```
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use seedcache::cdn::SeedCache;
//! use seedcache::config::CdnConfig;
//! use seedcache::source::{HttpSource, SourceDescriptor};
//! use tokio::time::{Duration, Instant};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CdnConfig::default();
//! let source = Arc::new(HttpSource::new(
//!     config.fetch.connect_timeout(),
//!     config.fetch.read_timeout(),
//! )?);
//! let cache = SeedCache::open(config, source).await?;
//!
//! let origin = SourceDescriptor::new("https://example.com/image.tar");
//! let deadline = Instant::now() + Duration::from_secs(30);
//! let piece = cache.request_piece("image", &origin, 0, deadline).await?;
//! println!("piece 0: {} bytes", piece.data.len());
//!
//! cache.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::stream::{self, Stream};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::announce::{Announcer, ControlPlane};
use crate::config::{CdnConfig, ConfigError, GcConfig, HostConfig, ManagerConfig};
use crate::eviction::{EvictionController, EvictionError, SweepPolicy};
use crate::fetcher::SourceFetcher;
use crate::progress::{ProgressError, ProgressNotifier, Subscription};
use crate::source::{Source, SourceDescriptor};
use crate::storage::{DiskPieceStore, PieceRecord, PieceStore, StorageError};
use crate::task::{TaskError, TaskHandle, TaskRegistry, TaskState};

/// Times a request restarts after its task was removed underneath it.
const MAX_REQUEST_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum CdnError {
    /// `seq` is the awaited piece, absent when waiting for the whole task.
    #[error("timed out waiting for {key}")]
    Timeout { key: String, seq: Option<u32> },

    #[error("fetch of {0} failed")]
    FetchFailed(String),

    #[error("task {0} closed before the piece was available")]
    TaskClosed(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("task {key} is {state}")]
    InvalidTransition { key: String, state: TaskState },

    #[error("piece {seq} out of range: task has {piece_count} pieces")]
    PieceOutOfRange { seq: u32, piece_count: u32 },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl From<TaskError> for CdnError {
    fn from(e: TaskError) -> Self {
        match e {
            TaskError::UnknownTask(key) => CdnError::UnknownTask(key),
            TaskError::InvalidTransition { key, current, .. } => CdnError::InvalidTransition {
                key,
                state: current,
            },
        }
    }
}

impl From<EvictionError> for CdnError {
    fn from(e: EvictionError) -> Self {
        match e {
            EvictionError::Storage(e) => CdnError::Storage(e),
            EvictionError::InsufficientSpace {
                required,
                available,
            } => CdnError::Storage(StorageError::DiskFull {
                required,
                available,
            }),
        }
    }
}

/// One piece as served to a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub record: PieceRecord,
    pub data: Bytes,
}

impl Piece {
    pub fn seq(&self) -> u32 {
        self.record.seq
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub key: String,
    pub state: TaskState,
    pub piece_length: u64,
    pub total_length: Option<u64>,
    pub piece_count: Option<u32>,
    pub digest: Option<String>,
    /// Whether the source honored range requests, once it has been opened.
    pub supports_range: Option<bool>,
    /// Pieces currently readable from the store.
    pub available_pieces: u32,
}

pub struct SeedCache {
    store: Arc<dyn PieceStore>,
    registry: Arc<TaskRegistry>,
    notifier: Arc<ProgressNotifier>,
    eviction: Arc<EvictionController>,
    fetcher: Arc<SourceFetcher>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl SeedCache {
    /// Builds a cache over `store` without starting background loops.
    pub fn new(
        store: Arc<dyn PieceStore>,
        source: Arc<dyn Source>,
        config: &CdnConfig,
    ) -> Result<Self, CdnError> {
        config.validate()?;
        let registry = Arc::new(TaskRegistry::new(config.task.piece_length));
        let notifier = Arc::new(ProgressNotifier::new());
        let eviction = Arc::new(EvictionController::new(
            store.clone(),
            registry.clone(),
            notifier.clone(),
        ));
        let shutdown = CancellationToken::new();
        let fetcher = Arc::new(SourceFetcher::new(
            source,
            store.clone(),
            notifier.clone(),
            eviction.clone(),
            config.fetch.clone(),
            shutdown.child_token(),
        ));

        Ok(Self {
            store,
            registry,
            notifier,
            eviction,
            fetcher,
            tracker: TaskTracker::new(),
            shutdown,
        })
    }

    /// Opens the disk store under `config.storage.base_dir`, restores the
    /// tasks completed by a previous run and starts the GC sweeper.
    pub async fn open(config: CdnConfig, source: Arc<dyn Source>) -> Result<Self, CdnError> {
        config.validate()?;
        let store =
            DiskPieceStore::open(&config.storage.base_dir, config.storage.capacity).await?;
        let cache = Self::new(Arc::new(store), source, &config)?;
        cache.restore().await?;
        cache.start_gc(&config.gc);
        Ok(cache)
    }

    /// Registers completed tasks found in the store; removes the rest.
    pub async fn restore(&self) -> Result<usize, CdnError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut restored = 0;

        for key in self.store.task_keys() {
            let meta = match self.store.read_task_meta(&key).await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("Unreadable metadata for {}: {}", key, e);
                    None
                }
            };
            let stat = self.store.stat(&key);
            let complete = meta.filter(|m| {
                m.piece_length == self.registry.piece_length()
                    && m.piece_count == stat.piece_count
                    && m.total_length == stat.total_bytes
            });

            let Some(meta) = complete else {
                let freed = self.store.delete_task(&key).await?;
                debug!("Removed incomplete task {} ({} bytes)", key, freed);
                continue;
            };

            let age = Duration::from_secs(now.saturating_sub(meta.finished_at));
            let source = SourceDescriptor::new(meta.source_url);
            if self
                .registry
                .restore(&key, source, meta.total_length, meta.piece_count, meta.digest, age)
                .is_some()
            {
                restored += 1;
            }
        }

        info!("Restored {} tasks", restored);
        Ok(restored)
    }

    pub fn start_gc(&self, gc: &GcConfig) {
        self.tracker.spawn(self.eviction.clone().run_sweeper(
            gc.interval(),
            SweepPolicy::from(gc),
            self.shutdown.child_token(),
        ));
    }

    pub fn start_announcer(
        &self,
        control_plane: Arc<dyn ControlPlane>,
        host: &HostConfig,
        manager: &ManagerConfig,
    ) {
        let announcer = Announcer::new(
            control_plane,
            host,
            manager,
            self.store.clone(),
            self.registry.clone(),
        );
        self.tracker.spawn(announcer.run(self.shutdown.child_token()));
    }

    /// Returns piece `seq` of `key`, fetching the content from `source` if
    /// this is the first request for the key.
    ///
    /// Waits until the piece is published or `deadline` passes. A timeout
    /// does not affect the fetch, which keeps running for other readers.
    pub async fn request_piece(
        &self,
        key: &str,
        source: &SourceDescriptor,
        seq: u32,
        deadline: Instant,
    ) -> Result<Piece, CdnError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let handle = self.acquire(key, source);
            match self.read_piece(&handle, seq, deadline).await {
                Err(CdnError::Storage(
                    StorageError::UnknownTask(_) | StorageError::NotFound { .. },
                )) if attempt < MAX_REQUEST_ATTEMPTS && !self.is_current(&handle) =>
                {
                    debug!("Task {} was removed during a read, retrying", key);
                }
                result => return result,
            }
        }
    }

    /// Starts or joins the fetch of `key` without reading.
    pub fn seed(&self, key: &str, source: &SourceDescriptor) -> TaskInfo {
        let handle = self.acquire(key, source);
        self.info(&handle)
    }

    /// Pieces of `key` in order starting at `from_seq`, each waited for up
    /// to `piece_timeout`. The stream ends after the last piece or the first
    /// error.
    pub fn stream_pieces<'a>(
        &'a self,
        key: &'a str,
        source: &'a SourceDescriptor,
        from_seq: u32,
        piece_timeout: Duration,
    ) -> impl Stream<Item = Result<Piece, CdnError>> + 'a {
        stream::unfold(Some(from_seq), move |next| async move {
            let seq = next?;
            let deadline = Instant::now() + piece_timeout;
            match self.request_piece(key, source, seq, deadline).await {
                Ok(piece) => Some((Ok(piece), seq.checked_add(1))),
                Err(CdnError::PieceOutOfRange { .. }) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    pub fn get_task_info(&self, key: &str) -> Result<TaskInfo, CdnError> {
        let handle = self.registry.get(key)?;
        Ok(self.info(&handle))
    }

    /// Removes a completed or failed task and its pieces so the next
    /// request fetches it again. Refused while the task is fetching.
    pub async fn invalidate_task(&self, key: &str) -> Result<(), CdnError> {
        loop {
            let task = self.registry.get(key)?.snapshot();
            if task.state == TaskState::Fetching {
                return Err(CdnError::InvalidTransition {
                    key: key.to_string(),
                    state: task.state,
                });
            }

            let removed = self
                .eviction
                .remove_task(key, task.generation, |t| t.state.is_terminal())
                .await?;
            if let Some(freed) = removed {
                info!("Invalidated task {} ({} bytes)", key, freed);
                return Ok(());
            }
        }
    }

    /// Waits until `key` reaches a terminal state or `deadline` passes.
    pub async fn wait_for_task(&self, key: &str, deadline: Instant) -> Result<TaskInfo, CdnError> {
        let handle = self.registry.get(key)?;
        while !handle.state().is_terminal() {
            let Some(mut sub) = self.subscribe(&handle) else {
                continue;
            };
            // resolves once the channel retires, after the state has changed
            if let Err(ProgressError::Timeout) = sub.wait_for(u32::MAX, deadline).await {
                return Err(CdnError::Timeout {
                    key: key.to_string(),
                    seq: None,
                });
            }
        }
        Ok(self.info(&handle))
    }

    /// Cancels in-flight fetches and background loops and waits for them.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Seed cache stopped");
    }

    pub fn store(&self) -> &Arc<dyn PieceStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn eviction(&self) -> &Arc<EvictionController> {
        &self.eviction
    }

    /// Single-flight entry point: only the creator spawns a fetch.
    ///
    /// The progress channel is opened under the registry entry, so a task
    /// seen fetching always has one.
    fn acquire(&self, key: &str, source: &SourceDescriptor) -> Arc<TaskHandle> {
        let (handle, created) = self
            .registry
            .create_or_get_with(key, source, |task| self.notifier.open(key, task.generation()));
        if created {
            let fetcher = self.fetcher.clone();
            let task = handle.clone();
            self.tracker.spawn(async move {
                // outcome is recorded on the task
                let _ = fetcher.fetch(&task).await;
            });
        } else {
            handle.touch();
        }
        handle
    }

    /// Subscribes to the channel of `handle`'s instance.
    ///
    /// `None` means the channel has retired or been replaced, which only
    /// happens once the instance left the fetching state.
    fn subscribe(&self, handle: &TaskHandle) -> Option<Subscription> {
        let generation = handle.generation();
        self.notifier
            .subscribe(&handle.key())
            .filter(|sub| sub.generation() == generation)
    }

    fn is_current(&self, handle: &TaskHandle) -> bool {
        self.registry
            .get(&handle.key())
            .is_ok_and(|current| current.generation() == handle.generation())
    }

    async fn read_piece(
        &self,
        handle: &TaskHandle,
        seq: u32,
        deadline: Instant,
    ) -> Result<Piece, CdnError> {
        let key = handle.key();
        loop {
            let task = handle.snapshot();
            match task.state {
                TaskState::Success => {
                    let piece_count = task.piece_count.unwrap_or(0);
                    if seq >= piece_count {
                        return Err(CdnError::PieceOutOfRange { seq, piece_count });
                    }
                    let _pin = self.notifier.pin(&key, task.generation, piece_count);
                    return self.load(&key, seq).await;
                }
                // pieces persisted before the failure stay readable
                TaskState::Fail => return self.load_failed(&key, seq).await,
                TaskState::Fetching => {}
            }

            let Some(mut sub) = self.subscribe(handle) else {
                continue;
            };

            match sub.wait_for(seq, deadline).await {
                Ok(()) => {
                    return match self.load(&key, seq).await {
                        // discarded along with a corrupt download
                        Err(CdnError::Storage(e))
                            if is_missing(&e) && handle.state() == TaskState::Fail =>
                        {
                            Err(CdnError::FetchFailed(key))
                        }
                        result => result,
                    };
                }
                Err(ProgressError::Timeout) => {
                    return Err(CdnError::Timeout {
                        key,
                        seq: Some(seq),
                    });
                }
                Err(ProgressError::OutOfRange { seq, piece_count }) => {
                    return Err(CdnError::PieceOutOfRange { seq, piece_count });
                }
                Err(ProgressError::TaskClosed) => return Err(CdnError::TaskClosed(key)),
                Err(e) => {
                    warn!("Unexpected progress error for {}: {}", key, e);
                    return Err(CdnError::FetchFailed(key));
                }
            }
        }
    }

    async fn load(&self, key: &str, seq: u32) -> Result<Piece, CdnError> {
        let (data, record) = self.store.get(key, seq).await?;
        Ok(Piece { record, data })
    }

    async fn load_failed(&self, key: &str, seq: u32) -> Result<Piece, CdnError> {
        match self.load(key, seq).await {
            Err(CdnError::Storage(e)) if is_missing(&e) => {
                Err(CdnError::FetchFailed(key.to_string()))
            }
            result => result,
        }
    }

    fn info(&self, handle: &TaskHandle) -> TaskInfo {
        let task = handle.snapshot();
        let available_pieces = match task.state {
            TaskState::Success => task.piece_count.unwrap_or(0),
            _ => self.store.stat(&task.key).piece_count,
        };
        TaskInfo {
            key: task.key,
            state: task.state,
            piece_length: task.piece_length,
            total_length: task.total_length,
            piece_count: task.piece_count,
            digest: task.digest,
            supports_range: task.supports_range,
            available_pieces,
        }
    }
}

fn is_missing(e: &StorageError) -> bool {
    matches!(
        e,
        StorageError::NotFound { .. } | StorageError::UnknownTask(_)
    )
}

#[cfg(test)]
mod tests;
