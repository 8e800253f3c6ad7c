//! In-memory piece store for tests and nodes without a cache disk.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::capacity::Capacity;
use super::error::StorageError;
use super::record::{PieceRecord, TaskMeta};
use super::store::{PieceStore, TaskStat};

#[derive(Default)]
struct TaskPieces {
    deleted: bool,
    pieces: BTreeMap<u32, (PieceRecord, Bytes)>,
    meta: Option<TaskMeta>,
}

impl TaskPieces {
    fn stored_bytes(&self) -> u64 {
        self.pieces.values().map(|(r, _)| r.length).sum()
    }
}

pub struct MemoryPieceStore {
    tasks: DashMap<String, Arc<RwLock<TaskPieces>>>,
    capacity: Arc<Capacity>,
}

impl MemoryPieceStore {
    pub fn new(capacity: u64) -> Self {
        Self {
            tasks: DashMap::new(),
            capacity: Capacity::new(capacity),
        }
    }

    fn entry(&self, task_key: &str) -> Arc<RwLock<TaskPieces>> {
        self.tasks
            .entry(task_key.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn lookup(&self, task_key: &str) -> Option<Arc<RwLock<TaskPieces>>> {
        self.tasks.get(task_key).map(|t| t.value().clone())
    }
}

#[async_trait]
impl PieceStore for MemoryPieceStore {
    async fn put(
        &self,
        task_key: &str,
        seq: u32,
        offset: u64,
        data: Bytes,
    ) -> Result<PieceRecord, StorageError> {
        loop {
            let task = self.entry(task_key);
            let mut pieces = task.write();
            if pieces.deleted {
                continue;
            }
            if pieces.pieces.contains_key(&seq) {
                return Err(StorageError::DuplicateWrite {
                    task: task_key.to_string(),
                    seq,
                });
            }
            let len = data.len() as u64;
            if !self.capacity.try_reserve(len) {
                return Err(StorageError::DiskFull {
                    required: len,
                    available: self.capacity.free(),
                });
            }
            let record = PieceRecord::new(task_key, seq, offset, &data);
            pieces.pieces.insert(seq, (record.clone(), data));
            return Ok(record);
        }
    }

    async fn get(&self, task_key: &str, seq: u32) -> Result<(Bytes, PieceRecord), StorageError> {
        let task = self
            .lookup(task_key)
            .ok_or_else(|| StorageError::UnknownTask(task_key.to_string()))?;
        let pieces = task.read();
        if pieces.deleted {
            return Err(StorageError::UnknownTask(task_key.to_string()));
        }
        pieces
            .pieces
            .get(&seq)
            .map(|(record, data)| (data.clone(), record.clone()))
            .ok_or_else(|| StorageError::NotFound {
                task: task_key.to_string(),
                seq,
            })
    }

    fn stat(&self, task_key: &str) -> TaskStat {
        match self.lookup(task_key) {
            Some(task) => {
                let pieces = task.read();
                TaskStat {
                    total_bytes: pieces.stored_bytes(),
                    piece_count: pieces.pieces.len() as u32,
                }
            }
            None => TaskStat::default(),
        }
    }

    fn records(&self, task_key: &str) -> Vec<PieceRecord> {
        self.lookup(task_key)
            .map(|task| task.read().pieces.values().map(|(r, _)| r.clone()).collect())
            .unwrap_or_default()
    }

    async fn delete_task(&self, task_key: &str) -> Result<u64, StorageError> {
        let Some((_, task)) = self.tasks.remove(task_key) else {
            return Ok(0);
        };
        let mut pieces = task.write();
        pieces.deleted = true;
        let freed = pieces.stored_bytes();
        pieces.pieces.clear();
        pieces.meta = None;
        self.capacity.release(freed);
        Ok(freed)
    }

    async fn write_task_meta(&self, meta: &TaskMeta) -> Result<(), StorageError> {
        loop {
            let task = self.entry(&meta.task_key);
            let mut pieces = task.write();
            if pieces.deleted {
                continue;
            }
            pieces.meta = Some(meta.clone());
            return Ok(());
        }
    }

    async fn read_task_meta(&self, task_key: &str) -> Result<Option<TaskMeta>, StorageError> {
        Ok(self.lookup(task_key).and_then(|task| task.read().meta.clone()))
    }

    fn task_keys(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.key().clone()).collect()
    }

    fn capacity(&self) -> &Arc<Capacity> {
        &self.capacity
    }
}
