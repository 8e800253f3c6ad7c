//! Origin-to-store transfer.
//!
//! A [`SourceFetcher`] runs once per task instance. It slices the source
//! stream into fixed-size pieces and, for each piece in order, secures
//! capacity, writes it to the piece store and publishes it on the task's
//! progress channel.
//!
//! Transient source failures are retried with exponential backoff. Every
//! attempt reopens the source at the last persisted piece boundary, so a
//! piece is never fetched or written twice. Pieces left in the store by an
//! earlier failed instance of the same key are verified and reused, unless
//! that instance failed on the content digest: its pieces are deleted.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use rand::Rng as _;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FetchConfig;
use crate::eviction::{EvictionController, EvictionError};
use crate::progress::{ProgressError, ProgressNotifier};
use crate::source::{Source, SourceError};
use crate::storage::{hex_encode, PieceRecord, PieceStore, StorageError, TaskMeta};
use crate::task::{Task, TaskError, TaskHandle, TaskState};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("source failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: SourceError,
    },

    #[error("source error: {0}")]
    Source(#[source] SourceError),

    #[error("content digest mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("invalid piece length {0}")]
    InvalidPieceLength(u64),

    #[error("insufficient space: {required} bytes required, {available} available")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("source returned data from byte {returned}, requested {requested}")]
    UnexpectedOffset { requested: u64, returned: u64 },

    #[error("fetch cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("task error: {0}")]
    Task(#[from] TaskError),

    #[error("progress error: {0}")]
    Progress(#[from] ProgressError),
}

impl From<EvictionError> for FetchError {
    fn from(e: EvictionError) -> Self {
        match e {
            EvictionError::InsufficientSpace {
                required,
                available,
            } => FetchError::InsufficientSpace {
                required,
                available,
            },
            EvictionError::Storage(e) => FetchError::Storage(e),
        }
    }
}

/// Summary of a completed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub total_length: u64,
    pub piece_count: u32,
    /// Lowercase hex SHA-256 of the whole content.
    pub digest: String,
    /// Pieces reused from an earlier instance of the task.
    pub resumed_pieces: u32,
    pub retries: u32,
}

/// Why one transfer attempt stopped.
enum Interrupt {
    /// The source failed; may be retried.
    Source(SourceError),
    /// Anything else ends the fetch.
    Fatal(FetchError),
}

impl From<FetchError> for Interrupt {
    fn from(e: FetchError) -> Self {
        Interrupt::Fatal(e)
    }
}

/// Position of the last persisted piece boundary.
struct Cursor {
    seq: u32,
    offset: u64,
    hasher: Sha256,
}

impl Cursor {
    fn new() -> Self {
        Self {
            seq: 0,
            offset: 0,
            hasher: Sha256::new(),
        }
    }

    fn advance(&mut self, record: &PieceRecord, data: &[u8]) {
        self.hasher.update(data);
        self.seq = record.seq + 1;
        self.offset = record.end();
    }
}

pub struct SourceFetcher {
    source: Arc<dyn Source>,
    store: Arc<dyn PieceStore>,
    notifier: Arc<ProgressNotifier>,
    eviction: Arc<EvictionController>,
    config: FetchConfig,
    shutdown: CancellationToken,
}

impl SourceFetcher {
    pub fn new(
        source: Arc<dyn Source>,
        store: Arc<dyn PieceStore>,
        notifier: Arc<ProgressNotifier>,
        eviction: Arc<EvictionController>,
        config: FetchConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            store,
            notifier,
            eviction,
            config,
            shutdown,
        }
    }

    /// Fetches the task's content and drives it to a terminal state.
    ///
    /// The task's progress channel must already be open. On success the
    /// task is `Success` and its channel finished; on any error the task is
    /// `Fail` and its channel closed. The state always changes first.
    pub async fn fetch(&self, handle: &TaskHandle) -> Result<FetchReport, FetchError> {
        let task = handle.snapshot();
        info!("Fetching {} from {}", task.key, task.source.url);

        let outcome = tokio::select! {
            _ = self.shutdown.cancelled() => Err(FetchError::Cancelled),
            result = self.download(handle, &task) => result,
        };

        match &outcome {
            Ok(report) => info!(
                "Fetched {}: {} bytes in {} pieces ({} resumed, {} retries)",
                task.key, report.total_length, report.piece_count, report.resumed_pieces, report.retries
            ),
            Err(e @ FetchError::ChecksumMismatch { .. }) => {
                warn!("Fetch of {} failed: {}; discarding its pieces", task.key, e);
                let discarded = self
                    .eviction
                    .discard_failed(&task.key, || self.fail(handle, &task))
                    .await;
                if let Err(e) = discarded {
                    warn!("Pieces of {} not discarded: {}", task.key, e);
                }
            }
            Err(e) => {
                warn!("Fetch of {} failed: {}", task.key, e);
                self.fail(handle, &task);
            }
        }
        outcome
    }

    fn fail(&self, handle: &TaskHandle, task: &Task) {
        if let Err(e) = handle.transition(TaskState::Fetching, TaskState::Fail) {
            debug!("Task {} not failed: {}", task.key, e);
        }
        self.notifier.close(&task.key, task.generation);
    }

    async fn download(&self, handle: &TaskHandle, task: &Task) -> Result<FetchReport, FetchError> {
        if task.piece_length == 0 {
            return Err(FetchError::InvalidPieceLength(task.piece_length));
        }
        self.eviction.wait_idle().await;
        let mut cursor = self.resume(task).await?;
        let resumed_pieces = cursor.seq;

        let mut retries = 0;
        loop {
            match self.transfer(handle, task, &mut cursor).await {
                Ok(()) => break,
                Err(Interrupt::Fatal(e)) => return Err(e),
                Err(Interrupt::Source(e)) if !e.is_transient() => {
                    return Err(FetchError::Source(e));
                }
                Err(Interrupt::Source(e)) if retries >= self.config.max_retries => {
                    return Err(FetchError::RetriesExhausted {
                        attempts: retries + 1,
                        last: e,
                    });
                }
                Err(Interrupt::Source(e)) => {
                    retries += 1;
                    let delay = self.backoff(retries);
                    warn!(
                        "Fetch of {} interrupted at byte {}: {}; retry {}/{} in {:?}",
                        task.key, cursor.offset, e, retries, self.config.max_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let digest = hex_encode(&cursor.hasher.finalize());
        if let Some(expected) = task.source.expected_sha256() {
            if expected != digest {
                return Err(FetchError::ChecksumMismatch {
                    expected,
                    actual: digest,
                });
            }
        }

        let total_length = cursor.offset;
        let piece_count = cursor.seq;
        handle.set_content(total_length, piece_count, digest.clone());
        self.store
            .write_task_meta(&TaskMeta {
                task_key: task.key.clone(),
                source_url: task.source.url.clone(),
                piece_length: task.piece_length,
                piece_count,
                total_length,
                digest: digest.clone(),
                finished_at: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
            })
            .await?;

        handle.transition(TaskState::Fetching, TaskState::Success)?;
        self.notifier.finish(&task.key, task.generation, piece_count);

        Ok(FetchReport {
            total_length,
            piece_count,
            digest,
            resumed_pieces,
            retries,
        })
    }

    /// Reuses pieces of an earlier instance when they form a verified
    /// prefix of full-length pieces; otherwise starts over.
    async fn resume(&self, task: &Task) -> Result<Cursor, FetchError> {
        let records = self.store.records(&task.key);
        if records.is_empty() {
            return Ok(Cursor::new());
        }

        let usable = records
            .iter()
            .enumerate()
            .all(|(i, r)| r.seq as usize == i && r.length == task.piece_length);

        if usable {
            let mut cursor = Cursor::new();
            for record in &records {
                match self.store.get(&task.key, record.seq).await {
                    Ok((data, record)) => cursor.advance(&record, &data),
                    Err(e) => {
                        debug!("Discarding stored pieces of {}: {}", task.key, e);
                        break;
                    }
                }
            }
            if cursor.seq as usize == records.len() {
                for seq in 0..cursor.seq {
                    self.notifier.publish(&task.key, seq)?;
                }
                info!(
                    "Resuming {} at piece {} (byte {})",
                    task.key, cursor.seq, cursor.offset
                );
                return Ok(cursor);
            }
        }

        let freed = self.store.delete_task(&task.key).await?;
        debug!("Dropped {} stale bytes of {}", freed, task.key);
        Ok(Cursor::new())
    }

    /// One attempt: streams from the cursor to the end of the content.
    async fn transfer(
        &self,
        handle: &TaskHandle,
        task: &Task,
        cursor: &mut Cursor,
    ) -> Result<(), Interrupt> {
        let mut stream = self
            .source
            .open_range(&task.source, cursor.offset)
            .await
            .map_err(Interrupt::Source)?;

        let mut skip = cursor
            .offset
            .checked_sub(stream.start)
            .ok_or(FetchError::UnexpectedOffset {
                requested: cursor.offset,
                returned: stream.start,
            })?;
        if !stream.supports_range && handle.snapshot().supports_range != Some(false) {
            info!("Source for {} does not support range requests", task.key);
        }
        handle.set_source_info(stream.content_length, stream.supports_range);
        if skip > 0 {
            debug!(
                "Source for {} resumed at byte {} instead of {}, skipping {} bytes",
                task.key, stream.start, cursor.offset, skip
            );
        }

        let piece_length = task.piece_length as usize;
        let mut pending = BytesMut::with_capacity(piece_length);
        let mut received = stream.start;

        while let Some(chunk) = stream.body.next().await {
            let mut chunk = chunk.map_err(Interrupt::Source)?;
            received += chunk.len() as u64;

            if skip > 0 {
                let n = skip.min(chunk.len() as u64);
                let _ = chunk.split_to(n as usize);
                skip -= n;
            }
            pending.extend_from_slice(&chunk);

            while pending.len() >= piece_length {
                let piece = pending.split_to(piece_length).freeze();
                self.commit(&task.key, cursor, piece).await?;
            }
        }

        let expected = stream.content_length.unwrap_or(received).max(cursor.offset);
        if received < expected || skip > 0 {
            return Err(Interrupt::Source(SourceError::Truncated {
                received,
                expected,
            }));
        }

        if !pending.is_empty() {
            self.commit(&task.key, cursor, pending.freeze()).await?;
        }
        Ok(())
    }

    async fn commit(&self, key: &str, cursor: &mut Cursor, piece: Bytes) -> Result<(), FetchError> {
        let len = piece.len() as u64;
        self.eviction.ensure_capacity(len).await?;

        let record = match self.store.put(key, cursor.seq, cursor.offset, piece.clone()).await {
            // someone else's write took the space in between
            Err(StorageError::DiskFull { .. }) => {
                self.eviction.ensure_capacity(len).await?;
                self.store
                    .put(key, cursor.seq, cursor.offset, piece.clone())
                    .await?
            }
            result => result?,
        };

        cursor.advance(&record, &piece);
        self.notifier.publish(key, record.seq)?;
        Ok(())
    }

    /// Exponential backoff with jitter over the upper half of the window.
    fn backoff(&self, retry: u32) -> Duration {
        let base = self.config.backoff_base();
        let cap = self.config.backoff_max();
        let window = base
            .saturating_mul(1u32 << retry.saturating_sub(1).min(16))
            .min(cap);
        let millis = window.as_millis() as u64;
        if millis < 2 {
            return window;
        }
        Duration::from_millis(rand::rng().random_range(millis / 2..=millis))
    }
}
