//! Task registry and lifecycle.
//!
//! A task is one content object identified by a stable key. The registry is
//! the single-flight gate: [`TaskRegistry::create_or_get`] atomically
//! inserts a task if absent and reports whether the caller created it; only
//! the creator starts a fetch.
//!
//! # State machine
//!
//! ```text
//! (none) --create--> Fetching --complete--> Success
//!                        |
//!                        +----error-------> Fail --create--> Fetching (new generation)
//! ```

mod error;
mod registry;
mod state;

pub use error::TaskError;
pub use registry::{TaskHandle, TaskRegistry};
pub use state::{Task, TaskState};
