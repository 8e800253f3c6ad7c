use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Fraction of the total above which the store is considered under pressure.
pub const PRESSURE_RATIO: f64 = 0.9;

/// Byte accounting for a piece store.
///
/// Usage never goes below zero and never exceeds `total`. Writers reserve
/// before persisting and deletions release.
pub struct Capacity {
    total: u64,
    used: AtomicU64,
    pressure_notify: Notify,
}

impl Capacity {
    pub fn new(total: u64) -> Arc<Self> {
        Arc::new(Self {
            total,
            used: AtomicU64::new(0),
            pressure_notify: Notify::new(),
        })
    }

    pub fn try_reserve(&self, bytes: u64) -> bool {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            if current.saturating_add(bytes) > self.total {
                self.pressure_notify.notify_waiters();
                return false;
            }
            match self.used.compare_exchange_weak(
                current,
                current + bytes,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release(&self, bytes: u64) {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn free(&self) -> u64 {
        self.total.saturating_sub(self.used())
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_under_pressure(&self) -> bool {
        self.used() as f64 > self.total as f64 * PRESSURE_RATIO
    }

    /// Resolves the next time a reservation is refused.
    pub async fn wait_for_pressure(&self) {
        self.pressure_notify.notified().await;
    }
}
