//! Defaults and tuning parameters.
//!
//! Values here seed [`CdnConfig`](crate::config::CdnConfig) and can be
//! overridden through configuration.

use std::time::Duration;

// ============================================================================
// Identification
// ============================================================================

/// User agent string for origin requests
pub const USER_AGENT: &str = concat!("seedcache/", env!("CARGO_PKG_VERSION"));

// ============================================================================
// Pieces and storage
// ============================================================================

/// Default piece length (4 MiB)
pub const DEFAULT_PIECE_LENGTH: u64 = 4 * 1024 * 1024;

/// Smallest accepted piece length
pub const MIN_PIECE_LENGTH: u64 = 1024;

/// Largest accepted piece length (64 MiB)
pub const MAX_PIECE_LENGTH: u64 = 64 * 1024 * 1024;

/// Default storage capacity (100 GiB)
pub const DEFAULT_STORAGE_CAPACITY: u64 = 100 * 1024 * 1024 * 1024;

/// Default cache directory
pub const DEFAULT_BASE_DIR: &str = "/var/lib/seedcache";

// ============================================================================
// Fetching
// ============================================================================

/// Retries after the first attempt before a fetch is failed
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// First backoff delay between attempts
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Cap on the backoff delay
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

// ============================================================================
// Garbage collection
// ============================================================================

/// Interval between GC sweeps
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60);

/// Idle time after which a completed task expires
pub const DEFAULT_TASK_EXPIRE_TIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Free capacity the sweep tries to keep available (5 GiB)
pub const DEFAULT_MIN_FREE_CAPACITY: u64 = 5 * 1024 * 1024 * 1024;

// ============================================================================
// Control plane
// ============================================================================

/// Keepalive interval towards the manager
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Default gRPC port advertised to the manager
pub const DEFAULT_RPC_PORT: u16 = 8003;

/// Default piece download port advertised to the manager
pub const DEFAULT_DOWNLOAD_PORT: u16 = 8001;
