use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex as TokioMutex, RwLock as TokioRwLock};
use tracing::{debug, warn};

use super::capacity::Capacity;
use super::error::StorageError;
use super::record::{PieceRecord, TaskMeta};
use super::store::{PieceStore, TaskStat};

const PIECE_INDEX_FILE: &str = "pieces.idx";
const TASK_META_FILE: &str = "task.json";
const PIECE_EXTENSION: &str = "piece";

/// Escapes a task key into a single safe path component.
///
/// Bytes outside `[A-Za-z0-9_-]` (and a leading `.`) are written as `%XX`, so
/// keys can never name a parent directory or an absolute path.
pub fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for (i, b) in key.bytes().enumerate() {
        let safe = b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || (b == b'.' && i > 0);
        if safe {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

pub fn unescape_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[derive(Default)]
struct PieceIndex {
    committed: BTreeMap<u32, PieceRecord>,
    pending: HashSet<u32>,
}

impl PieceIndex {
    fn stored_bytes(&self) -> u64 {
        self.committed.values().map(|r| r.length).sum()
    }
}

struct DiskTask {
    dir: PathBuf,
    /// Held shared by reads and writes, exclusively by deletion.
    gate: TokioRwLock<bool>,
    index: parking_lot::Mutex<PieceIndex>,
    index_file: TokioMutex<()>,
}

impl DiskTask {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            gate: TokioRwLock::new(false),
            index: parking_lot::Mutex::new(PieceIndex::default()),
            index_file: TokioMutex::new(()),
        }
    }

    fn piece_path(&self, seq: u32) -> PathBuf {
        self.dir.join(format!("{}.{}", seq, PIECE_EXTENSION))
    }

    async fn append_record(&self, record: &PieceRecord) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(record).map_err(|e| StorageError::Index {
            task: record.task_key.clone(),
            reason: e.to_string(),
        })?;
        line.push(b'\n');

        let _guard = self.index_file.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(PIECE_INDEX_FILE))
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }
}

/// Piece store backed by flat files with a sidecar index.
///
/// Layout: `<base>/<escaped key>/<seq>.piece` for bytes,
/// `<base>/<escaped key>/pieces.idx` with one JSON record per line, and
/// `<base>/<escaped key>/task.json` once the task completes.
pub struct DiskPieceStore {
    base_path: PathBuf,
    tasks: DashMap<String, Arc<DiskTask>>,
    capacity: Arc<Capacity>,
}

impl DiskPieceStore {
    /// Opens the store, re-accounting any task directories already present.
    ///
    /// Directories whose contents do not fit in `capacity` are removed.
    pub async fn open(base_path: impl Into<PathBuf>, capacity: u64) -> Result<Self, StorageError> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await?;

        let store = Self {
            base_path,
            tasks: DashMap::new(),
            capacity: Capacity::new(capacity),
        };
        store.rescan().await?;
        Ok(store)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    async fn rescan(&self) -> Result<(), StorageError> {
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(task_key) = unescape_key(&name) else {
                warn!("Skipping unrecognized cache directory {}", name);
                continue;
            };

            let task = DiskTask::new(entry.path());
            let records = load_index(&task, &task_key).await;
            let bytes: u64 = records.values().map(|r| r.length).sum();

            if !self.capacity.try_reserve(bytes) {
                warn!(
                    "Removing task {} on open: {} bytes exceed remaining capacity",
                    task_key, bytes
                );
                let _ = fs::remove_dir_all(&task.dir).await;
                continue;
            }

            debug!(
                "Restored {} pieces ({} bytes) for task {}",
                records.len(),
                bytes,
                task_key
            );
            task.index.lock().committed = records;
            self.tasks.insert(task_key, Arc::new(task));
        }
        Ok(())
    }

    fn entry(&self, task_key: &str) -> Arc<DiskTask> {
        self.tasks
            .entry(task_key.to_string())
            .or_insert_with(|| Arc::new(DiskTask::new(self.base_path.join(escape_key(task_key)))))
            .value()
            .clone()
    }

    fn lookup(&self, task_key: &str) -> Option<Arc<DiskTask>> {
        self.tasks.get(task_key).map(|t| t.value().clone())
    }

    async fn write_piece_file(task: &DiskTask, seq: u32, data: &[u8]) -> Result<(), StorageError> {
        fs::create_dir_all(&task.dir).await?;
        let path = task.piece_path(seq);
        let tmp = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .await?;
        file.write_all(data).await?;
        file.sync_data().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Reads the sidecar index, keeping only records whose piece file exists
/// with the recorded length. Later duplicate lines are ignored.
async fn load_index(task: &DiskTask, task_key: &str) -> BTreeMap<u32, PieceRecord> {
    let mut records = BTreeMap::new();
    let Ok(contents) = fs::read_to_string(task.dir.join(PIECE_INDEX_FILE)).await else {
        return records;
    };

    for line in contents.lines().filter(|l| !l.trim().is_empty()) {
        let record: PieceRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                warn!("Ignoring corrupt index line for task {}: {}", task_key, e);
                continue;
            }
        };
        if record.task_key != task_key || records.contains_key(&record.seq) {
            continue;
        }
        match fs::metadata(task.piece_path(record.seq)).await {
            Ok(meta) if meta.len() == record.length => {
                records.insert(record.seq, record);
            }
            _ => {
                debug!("Dropping record {} of task {}: piece file missing", record.seq, task_key);
            }
        }
    }
    records
}

#[async_trait]
impl PieceStore for DiskPieceStore {
    async fn put(
        &self,
        task_key: &str,
        seq: u32,
        offset: u64,
        data: Bytes,
    ) -> Result<PieceRecord, StorageError> {
        loop {
            let task = self.entry(task_key);
            let gate = task.gate.read().await;
            if *gate {
                continue;
            }

            let len = data.len() as u64;
            {
                let mut index = task.index.lock();
                if index.committed.contains_key(&seq) || index.pending.contains(&seq) {
                    return Err(StorageError::DuplicateWrite {
                        task: task_key.to_string(),
                        seq,
                    });
                }
                if !self.capacity.try_reserve(len) {
                    return Err(StorageError::DiskFull {
                        required: len,
                        available: self.capacity.free(),
                    });
                }
                index.pending.insert(seq);
            }

            let record = PieceRecord::new(task_key, seq, offset, &data);
            let written = async {
                Self::write_piece_file(&task, seq, &data).await?;
                task.append_record(&record).await
            }
            .await;

            let mut index = task.index.lock();
            index.pending.remove(&seq);
            return match written {
                Ok(()) => {
                    index.committed.insert(seq, record.clone());
                    Ok(record)
                }
                Err(e) => {
                    self.capacity.release(len);
                    Err(e)
                }
            };
        }
    }

    async fn get(&self, task_key: &str, seq: u32) -> Result<(Bytes, PieceRecord), StorageError> {
        let task = self
            .lookup(task_key)
            .ok_or_else(|| StorageError::UnknownTask(task_key.to_string()))?;
        let gate = task.gate.read().await;
        if *gate {
            return Err(StorageError::UnknownTask(task_key.to_string()));
        }

        let record = task
            .index
            .lock()
            .committed
            .get(&seq)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                task: task_key.to_string(),
                seq,
            })?;

        let data = fs::read(task.piece_path(seq)).await?;
        drop(gate);

        if !record.matches(&data) {
            return Err(StorageError::ChecksumMismatch {
                task: task_key.to_string(),
                seq,
            });
        }
        Ok((Bytes::from(data), record))
    }

    fn stat(&self, task_key: &str) -> TaskStat {
        match self.lookup(task_key) {
            Some(task) => {
                let index = task.index.lock();
                TaskStat {
                    total_bytes: index.stored_bytes(),
                    piece_count: index.committed.len() as u32,
                }
            }
            None => TaskStat::default(),
        }
    }

    fn records(&self, task_key: &str) -> Vec<PieceRecord> {
        self.lookup(task_key)
            .map(|task| task.index.lock().committed.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn delete_task(&self, task_key: &str) -> Result<u64, StorageError> {
        let Some(task) = self.lookup(task_key) else {
            return Ok(0);
        };

        let mut gate = task.gate.write().await;
        if *gate {
            return Ok(0);
        }

        // on failure the index and its capacity stay accounted for a later retry
        match fs::remove_dir_all(&task.dir).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                warn!("Failed to delete task {}: {}", task_key, e);
                return Err(StorageError::Io(e));
            }
            _ => {}
        }
        *gate = true;

        let freed = {
            let mut index = task.index.lock();
            let freed = index.stored_bytes();
            index.committed.clear();
            freed
        };
        self.capacity.release(freed);
        self.tasks.remove_if(task_key, |_, t| Arc::ptr_eq(t, &task));
        drop(gate);

        debug!("Deleted task {} ({} bytes)", task_key, freed);
        Ok(freed)
    }

    async fn write_task_meta(&self, meta: &TaskMeta) -> Result<(), StorageError> {
        let encoded = serde_json::to_vec_pretty(meta).map_err(|e| StorageError::Index {
            task: meta.task_key.clone(),
            reason: e.to_string(),
        })?;

        loop {
            let task = self.entry(&meta.task_key);
            let gate = task.gate.read().await;
            if *gate {
                continue;
            }
            fs::create_dir_all(&task.dir).await?;
            let path = task.dir.join(TASK_META_FILE);
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, &encoded).await?;
            fs::rename(&tmp, &path).await?;
            return Ok(());
        }
    }

    async fn read_task_meta(&self, task_key: &str) -> Result<Option<TaskMeta>, StorageError> {
        let Some(task) = self.lookup(task_key) else {
            return Ok(None);
        };
        let _gate = task.gate.read().await;
        let contents = match fs::read(task.dir.join(TASK_META_FILE)).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|e| StorageError::Index {
                task: task_key.to_string(),
                reason: e.to_string(),
            })
    }

    fn task_keys(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.key().clone()).collect()
    }

    fn capacity(&self) -> &Arc<Capacity> {
        &self.capacity
    }
}
