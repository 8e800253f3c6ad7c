//! Piece persistence and capacity accounting.
//!
//! Tasks are split into fixed-size pieces. Each piece is written exactly
//! once together with a [`PieceRecord`] carrying its offset, length and
//! checksum; a task's records ordered by sequence number reconstruct the
//! content.
//!
//! # Components
//!
//! - [`PieceStore`] - Storage contract shared by every backend
//! - [`DiskPieceStore`] - Flat files with a sidecar index
//! - [`MemoryPieceStore`] - Heap-backed store for tests and diskless nodes
//! - [`Capacity`] - Atomic free-space counter shared with eviction
//!
//! # Examples
//!
//! ```no_run
//! use bytes::Bytes;
//! use seedcache::storage::{DiskPieceStore, PieceStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = DiskPieceStore::open("./cache", 64 * 1024 * 1024).await?;
//!
//! let record = store.put("task", 0, 0, Bytes::from_static(b"hello")).await?;
//! let (data, _) = store.get("task", 0).await?;
//! assert_eq!(data.len() as u64, record.length);
//!
//! store.delete_task("task").await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! Task keys are escaped before they are used as directory names, so a key
//! containing `..` or `/` cannot escape the cache directory.

mod capacity;
mod disk;
mod error;
mod memory;
mod record;
mod store;

pub use capacity::{Capacity, PRESSURE_RATIO};
pub use disk::{escape_key, unescape_key, DiskPieceStore};
pub use error::StorageError;
pub use memory::MemoryPieceStore;
pub use record::{piece_checksum, PieceRecord, TaskMeta};
pub(crate) use record::hex_encode;
pub use store::{PieceStore, TaskStat};
