//! Fixed-window attempt limiter (login throttling and similar).
//!
//! Time and storage are injected: [`Clock`] and [`AttemptStore`]. Tests use
//! [`ManualClock`] to move time without sleeping.

use crate::error::{DbError, DbResult};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(15 * 60);

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += to_delta(by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Failed attempts recorded for one key in the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptWindow {
    pub count: u32,
    pub window_start: DateTime<Utc>,
}

/// Backing store for attempt windows. `record` must be atomic per key.
pub trait AttemptStore: Send + Sync {
    fn get(&self, key: &str) -> Option<AttemptWindow>;

    /// Count one failure at `now`, opening a new window if the current one
    /// is older than `window`. Returns the updated window.
    fn record(&self, key: &str, now: DateTime<Utc>, window: TimeDelta) -> AttemptWindow;

    fn remove(&self, key: &str);

    /// Drop windows that started before `cutoff`. Returns how many were dropped.
    fn remove_before(&self, cutoff: DateTime<Utc>) -> usize;
}

#[derive(Debug, Default)]
pub struct InMemoryAttemptStore {
    entries: Mutex<HashMap<String, AttemptWindow>>,
}

impl InMemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AttemptStore for InMemoryAttemptStore {
    fn get(&self, key: &str) -> Option<AttemptWindow> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    fn record(&self, key: &str, now: DateTime<Utc>, window: TimeDelta) -> AttemptWindow {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(key.to_string()).or_insert(AttemptWindow {
            count: 0,
            window_start: now,
        });
        if now - entry.window_start >= window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count = entry.count.saturating_add(1);
        *entry
    }

    fn remove(&self, key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    fn remove_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, window| window.window_start >= cutoff);
        before - entries.len()
    }
}

/// Refuses a key once it has `max_attempts` failures inside one window.
#[derive(Debug)]
pub struct RateLimiter<S: AttemptStore = InMemoryAttemptStore, K: Clock = SystemClock> {
    max_attempts: u32,
    window: TimeDelta,
    store: S,
    clock: K,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self::with_parts(max_attempts, window, InMemoryAttemptStore::new(), SystemClock)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_WINDOW)
    }
}

impl<S: AttemptStore, K: Clock> RateLimiter<S, K> {
    pub fn with_parts(max_attempts: u32, window: Duration, store: S, clock: K) -> Self {
        Self {
            max_attempts,
            window: to_delta(window),
            store,
            clock,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &K {
        &self.clock
    }

    /// `Err(DbError::RateLimited)` while `key` is over its limit.
    pub fn check(&self, key: &str) -> DbResult<()> {
        let Some(window) = self.store.get(key) else {
            return Ok(());
        };
        let now = self.clock.now();
        let elapsed = now - window.window_start;
        if elapsed >= self.window || window.count < self.max_attempts {
            return Ok(());
        }

        let retry_after = self.window - elapsed;
        let retry_after_secs = ceil_secs(retry_after);
        warn!(
            key,
            attempts = window.count,
            retry_after_secs,
            "Attempt limit reached"
        );
        Err(DbError::rate_limited(key, retry_after_secs))
    }

    /// Count a failed attempt. Returns the failures in the current window.
    pub fn record_failure(&self, key: &str) -> u32 {
        let window = self.store.record(key, self.clock.now(), self.window);
        debug!(key, attempts = window.count, "Recorded failed attempt");
        window.count
    }

    /// Forget all failures for `key`, e.g. after a successful login.
    pub fn reset(&self, key: &str) {
        self.store.remove(key);
    }

    /// Drop expired windows. Returns how many were removed.
    pub fn prune(&self) -> usize {
        match self.clock.now().checked_sub_signed(self.window) {
            Some(cutoff) => self.store.remove_before(cutoff),
            None => 0,
        }
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or_else(|_| TimeDelta::MAX)
}

fn ceil_secs(delta: TimeDelta) -> u64 {
    let millis = delta.num_milliseconds().max(0) as u64;
    millis.div_ceil(1000).max(1)
}
