use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::capacity::Capacity;
use super::error::StorageError;
use super::record::{PieceRecord, TaskMeta};

/// Bytes and piece count stored for one task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStat {
    pub total_bytes: u64,
    pub piece_count: u32,
}

/// Write-once persistence of task pieces.
///
/// Every successful [`put`](PieceStore::put) reserves capacity and every
/// [`delete_task`](PieceStore::delete_task) releases it; the eviction
/// controller reads the same counter through [`capacity`](PieceStore::capacity).
#[async_trait]
pub trait PieceStore: Send + Sync {
    /// Persists one piece. Fails with `DuplicateWrite` if `(task_key, seq)`
    /// already exists and with `DiskFull` if the bytes do not fit.
    async fn put(
        &self,
        task_key: &str,
        seq: u32,
        offset: u64,
        data: Bytes,
    ) -> Result<PieceRecord, StorageError>;

    /// Reads one piece. `NotFound` means the task exists but the piece does
    /// not yet; `UnknownTask` means nothing is stored for the key.
    async fn get(&self, task_key: &str, seq: u32) -> Result<(Bytes, PieceRecord), StorageError>;

    fn stat(&self, task_key: &str) -> TaskStat;

    /// Records for the task ordered by sequence number.
    fn records(&self, task_key: &str) -> Vec<PieceRecord>;

    /// Removes every piece and the task metadata, returning the bytes freed.
    async fn delete_task(&self, task_key: &str) -> Result<u64, StorageError>;

    async fn write_task_meta(&self, meta: &TaskMeta) -> Result<(), StorageError>;

    async fn read_task_meta(&self, task_key: &str) -> Result<Option<TaskMeta>, StorageError>;

    /// Keys of every task with at least one stored piece or metadata record.
    fn task_keys(&self) -> Vec<String>;

    fn capacity(&self) -> &Arc<Capacity>;

    fn free_capacity(&self) -> u64 {
        self.capacity().free()
    }
}
