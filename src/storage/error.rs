use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("piece {seq} of task {task} not found")]
    NotFound { task: String, seq: u32 },

    #[error("task not stored: {0}")]
    UnknownTask(String),

    #[error("piece {seq} of task {task} already written")]
    DuplicateWrite { task: String, seq: u32 },

    #[error("disk full: {required} bytes required, {available} available")]
    DiskFull { required: u64, available: u64 },

    #[error("checksum mismatch for piece {seq} of task {task}")]
    ChecksumMismatch { task: String, seq: u32 },

    #[error("corrupt piece index for task {task}: {reason}")]
    Index { task: String, reason: String },
}

impl StorageError {
    /// Returns true if waiting for the fetch may make the request succeed.
    pub fn is_not_yet_available(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}
