use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Metadata for one persisted piece.
///
/// Records are immutable once written. A task's records ordered by `seq`
/// reconstruct its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceRecord {
    pub task_key: String,
    pub seq: u32,
    pub offset: u64,
    pub length: u64,
    /// Lowercase hex SHA-256 of the piece bytes.
    pub checksum: String,
}

impl PieceRecord {
    pub fn new(task_key: &str, seq: u32, offset: u64, data: &[u8]) -> Self {
        Self {
            task_key: task_key.to_string(),
            seq,
            offset,
            length: data.len() as u64,
            checksum: piece_checksum(data),
        }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn matches(&self, data: &[u8]) -> bool {
        data.len() as u64 == self.length && piece_checksum(data) == self.checksum
    }
}

/// Task-level metadata written once a fetch completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMeta {
    pub task_key: String,
    pub source_url: String,
    pub piece_length: u64,
    pub piece_count: u32,
    pub total_length: u64,
    pub digest: String,
    /// Seconds since the unix epoch.
    pub finished_at: u64,
}

pub fn piece_checksum(data: &[u8]) -> String {
    hex_encode(&Sha256::digest(data))
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}
