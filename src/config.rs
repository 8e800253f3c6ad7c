//! Cache configuration.
//!
//! Every section has defaults from [`constants`](crate::constants), so a
//! partial document only needs the values it changes:
//!
//! ```
//! use seedcache::config::CdnConfig;
//!
//! let config = CdnConfig::from_json_str(r#"{
//!     "storage": { "base_dir": "/tmp/cache", "capacity": 1073741824 },
//!     "task": { "piece_length": 1048576 }
//! }"#).unwrap();
//!
//! assert_eq!(config.task.piece_length, 1024 * 1024);
//! assert_eq!(config.fetch.max_retries, 3);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::*;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CdnConfig {
    pub storage: StorageConfig,
    pub task: TaskConfig,
    pub fetch: FetchConfig,
    pub gc: GcConfig,
    pub host: HostConfig,
    /// Control plane registration; disabled when absent.
    pub manager: Option<ManagerConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub base_dir: PathBuf,
    /// Bytes the piece store may occupy.
    pub capacity: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(DEFAULT_BASE_DIR),
            capacity: DEFAULT_STORAGE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub piece_length: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            piece_length: DEFAULT_PIECE_LENGTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Attempts after the first before the task fails.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl FetchConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE.as_millis() as u64,
            backoff_max_ms: DEFAULT_BACKOFF_MAX.as_millis() as u64,
            connect_timeout_secs: crate::source::HTTP_CONNECT_TIMEOUT.as_secs(),
            read_timeout_secs: crate::source::HTTP_READ_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub interval_secs: u64,
    /// Completed tasks idle longer than this are removed by the sweep.
    pub task_expire_secs: u64,
    /// The sweep evicts until at least this many bytes are free.
    pub min_free_capacity: u64,
}

impl GcConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn task_expire_time(&self) -> Duration {
        Duration::from_secs(self.task_expire_secs)
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_GC_INTERVAL.as_secs(),
            task_expire_secs: DEFAULT_TASK_EXPIRE_TIME.as_secs(),
            min_free_capacity: DEFAULT_MIN_FREE_CAPACITY,
        }
    }
}

/// How this node describes itself to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub hostname: String,
    pub idc: String,
    pub location: String,
    pub net_topology: String,
    pub ip: String,
    pub port: u16,
    pub download_port: u16,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            idc: String::new(),
            location: String::new(),
            net_topology: String::new(),
            ip: "127.0.0.1".to_string(),
            port: DEFAULT_RPC_PORT,
            download_port: DEFAULT_DOWNLOAD_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub cluster_id: u64,
    pub keepalive_interval_secs: u64,
}

impl ManagerConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cluster_id: 1,
            keepalive_interval_secs: DEFAULT_KEEPALIVE_INTERVAL.as_secs(),
        }
    }
}

impl CdnConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let piece_length = self.task.piece_length;
        if !(MIN_PIECE_LENGTH..=MAX_PIECE_LENGTH).contains(&piece_length) {
            return Err(ConfigError::Invalid(format!(
                "task.piece_length {} outside {}..={}",
                piece_length, MIN_PIECE_LENGTH, MAX_PIECE_LENGTH
            )));
        }
        if self.storage.capacity < piece_length {
            return Err(ConfigError::Invalid(format!(
                "storage.capacity {} smaller than one piece",
                self.storage.capacity
            )));
        }
        if self.fetch.backoff_max_ms < self.fetch.backoff_base_ms {
            return Err(ConfigError::Invalid(
                "fetch.backoff_max_ms below fetch.backoff_base_ms".to_string(),
            ));
        }
        if self.gc.interval_secs == 0 {
            return Err(ConfigError::Invalid("gc.interval_secs must be > 0".to_string()));
        }
        if let Some(manager) = &self.manager {
            if manager.keepalive_interval_secs == 0 {
                return Err(ConfigError::Invalid(
                    "manager.keepalive_interval_secs must be > 0".to_string(),
                ));
            }
            if self.host.hostname.is_empty() {
                return Err(ConfigError::Invalid(
                    "host.hostname required for manager registration".to_string(),
                ));
            }
        }
        Ok(())
    }
}
