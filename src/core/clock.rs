//! Time sources for bucket refill arithmetic

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A source of wall-clock milliseconds.
///
/// Every worker, possibly on another machine, stamps bucket refills with its
/// own clock, so implementations must agree on the UNIX epoch. Tests plug in
/// [`ManualClock`] to make refill deterministic.
pub trait Clock: Send + Sync + Debug {
    /// Milliseconds since the UNIX epoch
    fn now_millis(&self) -> u64;
}

/// UTC wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// A clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    current: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            current: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.current
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.current.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }
}
