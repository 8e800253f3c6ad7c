//! Per-task piece progress broadcast.
//!
//! Each fetching task has one channel carrying a watermark: the number of
//! contiguous pieces published so far. Any number of readers subscribe and
//! wait for a sequence number; a reader attaching late sees the current
//! watermark immediately and only blocks for pieces not yet produced.
//!
//! The notifier is pure coordination. It never holds piece bytes; readers
//! fetch those from the piece store once their wait returns.
//!
//! # Examples
//!
//! ```
//! use seedcache::progress::ProgressNotifier;
//! use tokio::time::{Duration, Instant};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let notifier = ProgressNotifier::new();
//! notifier.open("task", 1);
//!
//! let mut sub = notifier.subscribe("task").expect("channel is open");
//! notifier.publish("task", 0)?;
//!
//! sub.wait_for(0, Instant::now() + Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tracing::trace;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProgressError {
    #[error("timed out waiting for piece")]
    Timeout,

    #[error("task closed before the piece was published")]
    TaskClosed,

    #[error("piece {seq} out of range: task has {piece_count} pieces")]
    OutOfRange { seq: u32, piece_count: u32 },

    #[error("piece {seq} published out of order, expected {expected}")]
    OutOfOrder { seq: u32, expected: u32 },

    #[error("no progress channel for task {0}")]
    NoChannel(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Fetching,
    Finished { piece_count: u32 },
    Closed,
}

/// Current state of one task's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Pieces `0..available` are published.
    pub available: u32,
    pub status: ChannelStatus,
}

impl Progress {
    /// Highest contiguous sequence number published, if any.
    pub fn watermark(&self) -> Option<u32> {
        self.available.checked_sub(1)
    }

    fn is_retired(&self) -> bool {
        self.status != ChannelStatus::Fetching
    }

    fn resolve(&self, seq: u32) -> Option<Result<(), ProgressError>> {
        if seq < self.available {
            return Some(Ok(()));
        }
        match self.status {
            ChannelStatus::Fetching => None,
            ChannelStatus::Finished { piece_count } => {
                Some(Err(ProgressError::OutOfRange { seq, piece_count }))
            }
            ChannelStatus::Closed => Some(Err(ProgressError::TaskClosed)),
        }
    }
}

struct Channel {
    /// Generation of the task instance the channel belongs to.
    generation: u64,
    tx: watch::Sender<Progress>,
}

impl Channel {
    fn is_retired(&self) -> bool {
        self.tx.borrow().is_retired()
    }
}

type Channels = DashMap<String, Channel>;

/// Broadcasts "piece N is available" per task.
///
/// A channel is keyed by task key and tagged with the generation of the
/// task instance that opened it. Lifecycle calls carrying another
/// generation leave the channel alone.
pub struct ProgressNotifier {
    channels: Arc<Channels>,
}

fn new_channel(generation: u64, status: ChannelStatus, available: u32) -> Channel {
    let (tx, _) = watch::channel(Progress { available, status });
    Channel { generation, tx }
}

impl ProgressNotifier {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
        }
    }

    /// Creates a fresh channel for task instance `generation` entering the
    /// fetching state.
    ///
    /// A previous channel for the key is closed so its waiters wake up.
    pub fn open(&self, key: &str, generation: u64) {
        let channel = new_channel(generation, ChannelStatus::Fetching, 0);
        if let Some(old) = self.channels.insert(key.to_string(), channel) {
            old.tx.send_if_modified(|p| close_progress(p));
        }
    }

    /// Marks piece `seq` as available.
    ///
    /// Republishing a piece below the watermark is a no-op; skipping ahead
    /// of it is rejected. Returns the new number of available pieces.
    pub fn publish(&self, key: &str, seq: u32) -> Result<u32, ProgressError> {
        let channel = self
            .channels
            .get(key)
            .ok_or_else(|| ProgressError::NoChannel(key.to_string()))?;

        let mut result = Ok(0);
        channel.tx.send_if_modified(|p| {
            if p.status != ChannelStatus::Fetching {
                result = Err(ProgressError::NoChannel(key.to_string()));
                return false;
            }
            if seq < p.available {
                result = Ok(p.available);
                return false;
            }
            if seq > p.available {
                result = Err(ProgressError::OutOfOrder {
                    seq,
                    expected: p.available,
                });
                return false;
            }
            p.available += 1;
            result = Ok(p.available);
            true
        });

        if let Ok(available) = result {
            trace!("Task {} watermark {}", key, available);
        }
        result
    }

    /// Marks task instance `generation` complete with `piece_count` pieces.
    ///
    /// Called once the task is `Success`: a retired channel always belongs
    /// to a task that has left the fetching state.
    pub fn finish(&self, key: &str, generation: u64, piece_count: u32) {
        if let Some(channel) = self.channels.get(key).filter(|c| c.generation == generation) {
            channel.tx.send_if_modified(|p| {
                if p.status != ChannelStatus::Fetching {
                    return false;
                }
                p.available = p.available.max(piece_count);
                p.status = ChannelStatus::Finished { piece_count };
                true
            });
        }
        self.release_if_idle(key, generation);
    }

    /// Wakes every waiter on task instance `generation` with
    /// [`ProgressError::TaskClosed`] unless its piece was already published.
    ///
    /// Called once the task is `Fail`.
    pub fn close(&self, key: &str, generation: u64) {
        if let Some(channel) = self.channels.get(key).filter(|c| c.generation == generation) {
            channel.tx.send_if_modified(|p| close_progress(p));
        }
        self.release_if_idle(key, generation);
    }

    /// Closes and drops the channel regardless of subscribers.
    pub fn discard(&self, key: &str) {
        if let Some((_, channel)) = self.channels.remove(key) {
            channel.tx.send_if_modified(|p| close_progress(p));
        }
    }

    pub fn subscribe(&self, key: &str) -> Option<Subscription> {
        let channel = self.channels.get(key)?;
        Some(self.attach(key, &channel))
    }

    /// Subscribes to finished task instance `generation`, creating a
    /// finished channel if none exists. A held subscription keeps the task
    /// out of eviction.
    pub fn pin(&self, key: &str, generation: u64, piece_count: u32) -> Subscription {
        let channel = self.channels.entry(key.to_string()).or_insert_with(|| {
            new_channel(generation, ChannelStatus::Finished { piece_count }, piece_count)
        });
        self.attach(key, &channel)
    }

    fn attach(&self, key: &str, channel: &Channel) -> Subscription {
        Subscription {
            key: key.to_string(),
            generation: channel.generation,
            rx: channel.tx.subscribe(),
            channels: Arc::downgrade(&self.channels),
        }
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.channels
            .get(key)
            .map(|c| c.tx.receiver_count())
            .unwrap_or(0)
    }

    pub fn progress(&self, key: &str) -> Option<Progress> {
        self.channels.get(key).map(|c| *c.tx.borrow())
    }

    /// Drops finished or closed channels nobody is subscribed to.
    pub fn prune(&self) -> usize {
        let before = self.channels.len();
        self.channels
            .retain(|_, c| !(c.is_retired() && c.tx.receiver_count() == 0));
        before.saturating_sub(self.channels.len())
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn release_if_idle(&self, key: &str, generation: u64) {
        self.channels.remove_if(key, |_, c| {
            c.generation == generation && c.is_retired() && c.tx.receiver_count() == 0
        });
    }
}

impl Default for ProgressNotifier {
    fn default() -> Self {
        Self::new()
    }
}

fn close_progress(p: &mut Progress) -> bool {
    if p.status == ChannelStatus::Fetching {
        p.status = ChannelStatus::Closed;
        true
    } else {
        false
    }
}

/// A reader's cursor on one task's channel.
///
/// Dropping the last subscription of a finished channel discards it.
pub struct Subscription {
    key: String,
    generation: u64,
    rx: watch::Receiver<Progress>,
    channels: Weak<Channels>,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Generation of the task instance this channel belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn progress(&self) -> Progress {
        *self.rx.borrow()
    }

    /// Waits until pieces `0..=seq` are published or `deadline` passes.
    ///
    /// A timeout leaves the subscription usable for another wait.
    pub async fn wait_for(&mut self, seq: u32, deadline: Instant) -> Result<(), ProgressError> {
        if let Some(resolved) = self.progress().resolve(seq) {
            return resolved;
        }

        let waited = timeout_at(deadline, self.rx.wait_for(|p| p.resolve(seq).is_some()))
            .await
            .map(|r| r.map(|p| *p));

        match waited {
            Err(_) => Err(ProgressError::Timeout),
            Ok(Ok(progress)) => progress.resolve(seq).unwrap_or(Err(ProgressError::TaskClosed)),
            // sender dropped: the channel was discarded
            Ok(Err(_)) => self
                .progress()
                .resolve(seq)
                .unwrap_or(Err(ProgressError::TaskClosed)),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(channels) = self.channels.upgrade() else {
            return;
        };
        channels.remove_if(&self.key, |_, c| {
            c.generation == self.generation && c.is_retired() && c.tx.receiver_count() <= 1
        });
    }
}
