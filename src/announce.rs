//! Registration with the control plane.
//!
//! The seed node announces itself once and then sends periodic keepalives
//! carrying its free capacity and task counts. The control plane is an
//! external collaborator behind the [`ControlPlane`] trait; failures here
//! are logged and retried and never reach the fetch or read paths.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{HostConfig, ManagerConfig};
use crate::storage::PieceStore;
use crate::task::{TaskRegistry, TaskState};

#[derive(Debug, Error)]
pub enum AnnounceError {
    #[error("control plane unavailable: {0}")]
    Unavailable(String),

    #[error("registration rejected: {0}")]
    Rejected(String),

    #[error("control plane request timed out")]
    Timeout,
}

/// Role of a seed peer in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedPeerType {
    #[default]
    Super,
    Strong,
    Weak,
}

impl fmt::Display for SeedPeerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SeedPeerType::Super => "super",
            SeedPeerType::Strong => "strong",
            SeedPeerType::Weak => "weak",
        };
        f.write_str(s)
    }
}

/// How this node describes itself when registering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedPeer {
    pub hostname: String,
    pub peer_type: SeedPeerType,
    pub idc: String,
    pub location: String,
    pub net_topology: String,
    pub ip: String,
    pub port: u16,
    pub download_port: u16,
    pub cluster_id: u64,
}

impl SeedPeer {
    pub fn new(host: &HostConfig, cluster_id: u64) -> Self {
        Self {
            hostname: host.hostname.clone(),
            peer_type: SeedPeerType::Super,
            idc: host.idc.clone(),
            location: host.location.clone(),
            net_topology: host.net_topology.clone(),
            ip: host.ip.clone(),
            port: host.port,
            download_port: host.download_port,
            cluster_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAlive {
    pub hostname: String,
    pub cluster_id: u64,
    pub free_capacity: u64,
    pub total_capacity: u64,
    pub completed_tasks: usize,
    pub fetching_tasks: usize,
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn register(&self, peer: &SeedPeer) -> Result<(), AnnounceError>;

    async fn keep_alive(&self, message: &KeepAlive) -> Result<(), AnnounceError>;
}

pub struct Announcer {
    control_plane: Arc<dyn ControlPlane>,
    peer: SeedPeer,
    interval: Duration,
    store: Arc<dyn PieceStore>,
    registry: Arc<TaskRegistry>,
}

impl Announcer {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        host: &HostConfig,
        manager: &ManagerConfig,
        store: Arc<dyn PieceStore>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            control_plane,
            peer: SeedPeer::new(host, manager.cluster_id),
            interval: manager.keepalive_interval(),
            store,
            registry,
        }
    }

    pub fn peer(&self) -> &SeedPeer {
        &self.peer
    }

    pub fn keep_alive_message(&self) -> KeepAlive {
        let tasks = self.registry.list(|_| true);
        KeepAlive {
            hostname: self.peer.hostname.clone(),
            cluster_id: self.peer.cluster_id,
            free_capacity: self.store.free_capacity(),
            total_capacity: self.store.capacity().total(),
            completed_tasks: tasks.iter().filter(|t| t.state == TaskState::Success).count(),
            fetching_tasks: tasks.iter().filter(|t| t.state == TaskState::Fetching).count(),
        }
    }

    /// Registers, retrying every interval, then sends keepalives until
    /// `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut registered = false;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !registered {
                match self.control_plane.register(&self.peer).await {
                    Ok(()) => {
                        info!(
                            "Registered seed peer {} ({}) in cluster {}",
                            self.peer.hostname, self.peer.peer_type, self.peer.cluster_id
                        );
                        registered = true;
                    }
                    Err(e) => warn!("Seed peer registration failed: {}", e),
                }
                continue;
            }

            let message = self.keep_alive_message();
            match self.control_plane.keep_alive(&message).await {
                Ok(()) => debug!(
                    "Keepalive sent: {} bytes free, {} tasks",
                    message.free_capacity, message.completed_tasks
                ),
                Err(e) => warn!("Keepalive failed: {}", e),
            }
        }
        debug!("Announcer stopped");
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use parking_lot::Mutex;

    use crate::source::SourceDescriptor;
    use crate::storage::MemoryPieceStore;

    #[derive(Default)]
    struct RecordingControlPlane {
        registration_failures: AtomicU32,
        registered: Mutex<Vec<SeedPeer>>,
        keepalives: Mutex<Vec<KeepAlive>>,
    }

    #[async_trait]
    impl ControlPlane for RecordingControlPlane {
        async fn register(&self, peer: &SeedPeer) -> Result<(), AnnounceError> {
            let failing = self
                .registration_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(AnnounceError::Unavailable("connection refused".into()));
            }
            self.registered.lock().push(peer.clone());
            Ok(())
        }

        async fn keep_alive(&self, message: &KeepAlive) -> Result<(), AnnounceError> {
            self.keepalives.lock().push(message.clone());
            Ok(())
        }
    }

    fn host() -> HostConfig {
        HostConfig {
            hostname: "seed-1".into(),
            idc: "idc-a".into(),
            ..HostConfig::default()
        }
    }

    fn manager() -> ManagerConfig {
        ManagerConfig {
            cluster_id: 7,
            keepalive_interval_secs: 5,
        }
    }

    #[test]
    fn test_seed_peer_from_config() {
        let peer = SeedPeer::new(&host(), 7);
        assert_eq!(peer.hostname, "seed-1");
        assert_eq!(peer.idc, "idc-a");
        assert_eq!(peer.peer_type, SeedPeerType::Super);
        assert_eq!(peer.cluster_id, 7);
        assert_eq!(peer.port, crate::constants::DEFAULT_RPC_PORT);
    }

    #[test]
    fn test_keep_alive_message() {
        let store = Arc::new(MemoryPieceStore::new(4096));
        let registry = Arc::new(TaskRegistry::new(1024));
        let (done, _) = registry.create_or_get("a", &SourceDescriptor::new("http://a"));
        done.transition(TaskState::Fetching, TaskState::Success).unwrap();
        registry.create_or_get("b", &SourceDescriptor::new("http://b"));

        let announcer = Announcer::new(
            Arc::new(RecordingControlPlane::default()),
            &host(),
            &manager(),
            store,
            registry,
        );
        let message = announcer.keep_alive_message();
        assert_eq!(message.cluster_id, 7);
        assert_eq!(message.free_capacity, 4096);
        assert_eq!(message.completed_tasks, 1);
        assert_eq!(message.fetching_tasks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registers_with_retry_then_keeps_alive() {
        let control_plane = Arc::new(RecordingControlPlane {
            registration_failures: AtomicU32::new(2),
            ..Default::default()
        });
        let announcer = Announcer::new(
            control_plane.clone(),
            &host(),
            &manager(),
            Arc::new(MemoryPieceStore::new(1024)),
            Arc::new(TaskRegistry::new(1024)),
        );

        let shutdown = CancellationToken::new();
        let handle = announcer.spawn(shutdown.clone());

        // ticks at 0s, 5s, 10s register; 15s and 20s keep alive
        tokio::time::sleep(Duration::from_secs(21)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(control_plane.registered.lock().len(), 1);
        assert_eq!(control_plane.keepalives.lock().len(), 2);
        assert_eq!(control_plane.keepalives.lock()[0].hostname, "seed-1");
    }
}
