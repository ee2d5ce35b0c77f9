//! Sliding-window admission control for outbound sends.
//!
//! The window holds the timestamps of recent sends. Stale entries are evicted lazily
//! inside every check, under the same lock, so admission decisions are linearizable.
//! [`RateLimiter::try_acquire`] checks and takes a slot in one step; concurrent callers
//! can never be admitted past the cap. The limiter is local to the process.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct RateLimiter {
    max_per_window: usize,
    window: Duration,
    sends: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn per_minute(max_per_minute: usize) -> Self {
        Self::new(max_per_minute, DEFAULT_WINDOW)
    }

    pub fn new(max_per_window: usize, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            sends: Mutex::new(VecDeque::new()),
        }
    }

    pub fn try_admit(&self) -> bool {
        self.try_admit_at(Instant::now())
    }

    /// Admits iff fewer than `max_per_window` sends were recorded in the trailing window.
    pub fn try_admit_at(&self, now: Instant) -> bool {
        let mut sends = self.lock();
        evict(&mut sends, now, self.window);
        sends.len() < self.max_per_window
    }

    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Like [`Self::try_admit_at`], but an admitted caller also takes the slot. The slot
    /// is kept whatever the send turns out to be.
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut sends = self.lock();
        evict(&mut sends, now, self.window);
        if sends.len() < self.max_per_window {
            sends.push_back(now);
            true
        } else {
            false
        }
    }

    pub fn record_send(&self) {
        self.record_send_at(Instant::now());
    }

    pub fn record_send_at(&self, at: Instant) {
        let mut sends = self.lock();
        evict(&mut sends, at, self.window);
        sends.push_back(at);
    }

    pub fn time_until_available(&self) -> Duration {
        self.time_until_available_at(Instant::now())
    }

    /// Zero when a slot is free, otherwise how long until the oldest send ages out.
    pub fn time_until_available_at(&self, now: Instant) -> Duration {
        let mut sends = self.lock();
        evict(&mut sends, now, self.window);
        if sends.len() < self.max_per_window {
            return Duration::ZERO;
        }
        sends
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    pub fn in_window(&self) -> usize {
        let mut sends = self.lock();
        evict(&mut sends, Instant::now(), self.window);
        sends.len()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Instant>> {
        self.sends.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn evict(sends: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = sends.front() {
        if now.saturating_duration_since(*oldest) >= window {
            sends.pop_front();
        } else {
            break;
        }
    }
}
