//! seedcache - A seed-node piece cache
//!
//! A seed node pulls content from its origin once, splits it into
//! fixed-size pieces and serves those pieces to any number of concurrent
//! readers, including readers that arrive while the download is still in
//! progress. Completed content stays cached until capacity pressure or
//! idleness evicts it.
//!
//! # Modules
//!
//! - [`cdn`] - [`SeedCache`], the request entry point
//! - [`task`] - Task registry and lifecycle state machine
//! - [`progress`] - Per-task "piece N is available" broadcast
//! - [`storage`] - Piece persistence and capacity accounting
//! - [`eviction`] - LRU eviction and periodic GC
//! - [`fetcher`] - Origin-to-store transfer with retry and resume
//! - [`source`] - Origin access over HTTP
//! - [`announce`] - Registration and keepalive with the control plane
//! - [`config`] - Configuration with defaults from [`constants`]

pub mod announce;
pub mod cdn;
pub mod config;
pub mod constants;
pub mod eviction;
pub mod fetcher;
pub mod progress;
pub mod source;
pub mod storage;
pub mod task;

pub use announce::{AnnounceError, Announcer, ControlPlane, KeepAlive, SeedPeer, SeedPeerType};
pub use cdn::{CdnError, Piece, SeedCache, TaskInfo};
pub use config::{CdnConfig, ConfigError};
pub use eviction::{EvictionController, EvictionError, SweepPolicy, SweepReport};
pub use fetcher::{FetchError, FetchReport, SourceFetcher};
pub use progress::{ProgressError, ProgressNotifier, Subscription};
pub use source::{HttpSource, Source, SourceDescriptor, SourceError};
pub use storage::{
    DiskPieceStore, MemoryPieceStore, PieceRecord, PieceStore, StorageError, TaskMeta,
};
pub use task::{Task, TaskError, TaskHandle, TaskRegistry, TaskState};
