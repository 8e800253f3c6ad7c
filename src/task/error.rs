use thiserror::Error;

use super::state::TaskState;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("invalid transition for task {key}: {from} -> {to} (current state {current})")]
    InvalidTransition {
        key: String,
        from: TaskState,
        to: TaskState,
        current: TaskState,
    },
}
