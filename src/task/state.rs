use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::source::SourceDescriptor;

/// Lifecycle state of a task.
///
/// `Fetching` is entered on creation. `Success` and `Fail` are terminal; a
/// failed task is only left by replacing the registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Fetching,
    Success,
    Fail,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Success | TaskState::Fail)
    }

    /// Returns true if `self -> to` is an edge of the state machine.
    pub fn can_transition_to(self, to: TaskState) -> bool {
        matches!(
            (self, to),
            (TaskState::Fetching, TaskState::Success) | (TaskState::Fetching, TaskState::Fail)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Fetching => "fetching",
            TaskState::Success => "success",
            TaskState::Fail => "fail",
        };
        f.write_str(s)
    }
}

/// Snapshot of a task's registry entry.
#[derive(Debug, Clone)]
pub struct Task {
    pub key: String,
    /// Incremented each time the key is re-created after a failure.
    pub generation: u64,
    pub state: TaskState,
    pub source: SourceDescriptor,
    pub piece_length: u64,
    /// Known once the source reports it or the fetch completes.
    pub total_length: Option<u64>,
    pub piece_count: Option<u32>,
    pub digest: Option<String>,
    /// Whether the source honored range requests when last opened.
    pub supports_range: Option<bool>,
    pub created_at: Instant,
    pub last_accessed: Instant,
}

impl Task {
    pub fn new(key: &str, generation: u64, source: SourceDescriptor, piece_length: u64) -> Self {
        let now = Instant::now();
        Self {
            key: key.to_string(),
            generation,
            state: TaskState::Fetching,
            source,
            piece_length,
            total_length: None,
            piece_count: None,
            digest: None,
            supports_range: None,
            created_at: now,
            last_accessed: now,
        }
    }

    /// Number of pieces a content of `total_length` bytes splits into.
    pub fn pieces_for(total_length: u64, piece_length: u64) -> u32 {
        total_length.div_ceil(piece_length.max(1)) as u32
    }
}
