//! Capacity reclamation.
//!
//! [`EvictionController::ensure_capacity`] runs before each piece write that
//! would not fit. It deletes completed tasks nobody is subscribed to, least
//! recently accessed first (ties broken by creation time), until the
//! requested bytes are free or no candidate remains.
//!
//! A periodic [`sweep`](EvictionController::sweep) additionally expires idle
//! tasks and keeps a configured amount of space free.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GcConfig;
use crate::progress::ProgressNotifier;
use crate::storage::{PieceStore, StorageError};
use crate::task::{Task, TaskRegistry, TaskState};

#[derive(Debug, Error)]
pub enum EvictionError {
    #[error("insufficient space: {required} bytes required, {available} available")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Thresholds applied by the periodic sweep.
#[derive(Debug, Clone, Copy)]
pub struct SweepPolicy {
    pub task_expire_time: Duration,
    pub min_free_capacity: u64,
}

impl From<&GcConfig> for SweepPolicy {
    fn from(config: &GcConfig) -> Self {
        Self {
            task_expire_time: config.task_expire_time(),
            min_free_capacity: config.min_free_capacity,
        }
    }
}

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_tasks: usize,
    pub failed_tasks: usize,
    pub freed_bytes: u64,
    pub pruned_channels: usize,
}

pub struct EvictionController {
    store: Arc<dyn PieceStore>,
    registry: Arc<TaskRegistry>,
    notifier: Arc<ProgressNotifier>,
    /// Serializes eviction runs; readers and writers never take it.
    running: TokioMutex<()>,
}

impl EvictionController {
    pub fn new(
        store: Arc<dyn PieceStore>,
        registry: Arc<TaskRegistry>,
        notifier: Arc<ProgressNotifier>,
    ) -> Self {
        Self {
            store,
            registry,
            notifier,
            running: TokioMutex::new(()),
        }
    }

    /// Frees space until `required` bytes are available.
    ///
    /// Returns the bytes freed, or `InsufficientSpace` when every candidate
    /// has been deleted and the space still is not there.
    pub async fn ensure_capacity(&self, required: u64) -> Result<u64, EvictionError> {
        if self.store.free_capacity() >= required {
            return Ok(0);
        }
        if required > self.store.capacity().total() {
            return Err(self.insufficient(required));
        }

        let _running = self.running.lock().await;
        let mut freed = 0;
        for victim in self.candidates() {
            if self.store.free_capacity() >= required {
                break;
            }
            freed += self.evict(&victim).await?;
        }

        if self.store.free_capacity() >= required {
            debug!("Reclaimed {} bytes for a {} byte write", freed, required);
            Ok(freed)
        } else {
            warn!(
                "Cannot reclaim {} bytes: {} free after evicting {} bytes",
                required,
                self.store.free_capacity(),
                freed
            );
            Err(self.insufficient(required))
        }
    }

    fn insufficient(&self, required: u64) -> EvictionError {
        EvictionError::InsufficientSpace {
            required,
            available: self.store.free_capacity(),
        }
    }

    fn is_candidate(&self, task: &Task) -> bool {
        task.state == TaskState::Success && self.notifier.subscriber_count(&task.key) == 0
    }

    /// Completed, unsubscribed tasks in eviction order.
    pub fn candidates(&self) -> Vec<Task> {
        let mut candidates = self.registry.list(|t| self.is_candidate(t));
        candidates.sort_by(|a, b| {
            a.last_accessed
                .cmp(&b.last_accessed)
                .then(a.created_at.cmp(&b.created_at))
        });
        candidates
    }

    /// Deletes one task if it is still the same eviction candidate.
    async fn evict(&self, victim: &Task) -> Result<u64, EvictionError> {
        let freed = self
            .purge(&victim.key, victim.generation, |t| self.is_candidate(t))
            .await?;
        if let Some(freed) = freed {
            info!("Evicted task {} ({} bytes)", victim.key, freed);
        }
        Ok(freed.unwrap_or(0))
    }

    /// Removes a task's registry entry, progress channel and stored pieces
    /// if the entry is still `generation` and matches `predicate`.
    ///
    /// Returns `None` when the entry no longer qualifies.
    pub async fn remove_task(
        &self,
        key: &str,
        generation: u64,
        predicate: impl Fn(&Task) -> bool,
    ) -> Result<Option<u64>, EvictionError> {
        let _running = self.running.lock().await;
        self.purge(key, generation, predicate).await
    }

    /// Waits for an in-progress removal to finish deleting its data.
    ///
    /// A task re-created under a key that is being removed must not write
    /// before the old pieces are gone.
    pub async fn wait_idle(&self) {
        drop(self.running.lock().await);
    }

    /// Runs `fail` and then deletes the task's stored pieces as one removal.
    ///
    /// `fail` moves the task out of the fetching state. An instance
    /// re-created in between waits in [`wait_idle`](Self::wait_idle) until
    /// the pieces are gone, so it cannot resume from them.
    pub async fn discard_failed(
        &self,
        key: &str,
        fail: impl FnOnce(),
    ) -> Result<u64, EvictionError> {
        let _running = self.running.lock().await;
        fail();
        let freed = self.store.delete_task(key).await?;
        debug!("Discarded {} bytes of failed task {}", freed, key);
        Ok(freed)
    }

    /// Callers hold `running`.
    async fn purge(
        &self,
        key: &str,
        generation: u64,
        predicate: impl Fn(&Task) -> bool,
    ) -> Result<Option<u64>, EvictionError> {
        // the channel goes with the entry so a re-created task cannot lose
        // its freshly opened channel
        let removed = self.registry.remove_if(key, generation, |t| {
            let matched = predicate(t);
            if matched {
                self.notifier.discard(key);
            }
            matched
        });
        if removed.is_none() {
            return Ok(None);
        }
        Ok(Some(self.store.delete_task(key).await?))
    }

    /// Expires idle tasks, then evicts until `min_free_capacity` is free.
    pub async fn sweep(&self, policy: SweepPolicy) -> SweepReport {
        let mut report = SweepReport::default();
        let now = Instant::now();
        let idle = |t: &Task| now.saturating_duration_since(t.last_accessed) > policy.task_expire_time;

        {
            let _running = self.running.lock().await;
            for task in self.candidates().into_iter().filter(|t| idle(t)) {
                match self.evict(&task).await {
                    Ok(0) => {}
                    Ok(freed) => {
                        report.expired_tasks += 1;
                        report.freed_bytes += freed;
                    }
                    Err(e) => warn!("GC: failed to expire task {}: {}", task.key, e),
                }
            }

            let failed = self
                .registry
                .list(|t| t.state == TaskState::Fail && idle(t));
            for task in failed {
                let removed = self
                    .purge(&task.key, task.generation, |t| t.state == TaskState::Fail)
                    .await;
                match removed {
                    Ok(None) => {}
                    Ok(Some(freed)) => {
                        report.failed_tasks += 1;
                        report.freed_bytes += freed;
                    }
                    Err(e) => warn!("GC: failed to remove task {}: {}", task.key, e),
                }
            }
        }

        if self.store.free_capacity() < policy.min_free_capacity {
            match self.ensure_capacity(policy.min_free_capacity).await {
                Ok(freed) => report.freed_bytes += freed,
                Err(e) => debug!("GC: free capacity target not met: {}", e),
            }
        }

        report.pruned_channels = self.notifier.prune();
        if report != SweepReport::default() {
            info!(
                "GC: expired {} tasks, removed {} failed tasks, freed {} bytes",
                report.expired_tasks, report.failed_tasks, report.freed_bytes
            );
        }
        report
    }

    /// Runs [`sweep`](Self::sweep) every `period`, and early whenever a
    /// write is refused for lack of space, until `shutdown` is cancelled.
    pub async fn run_sweeper(
        self: Arc<Self>,
        period: Duration,
        policy: SweepPolicy,
        shutdown: CancellationToken,
    ) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let capacity = self.store.capacity().clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = capacity.wait_for_pressure() => {}
            }
            self.sweep(policy).await;
        }
        debug!("GC: sweeper stopped");
    }

    pub fn spawn_sweeper(
        self: Arc<Self>,
        period: Duration,
        policy: SweepPolicy,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run_sweeper(period, policy, shutdown))
    }
}
