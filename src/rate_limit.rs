//! Fixed-window rate limiting for expensive downstream calls
//!
//! The counter store is a trait so a multi-instance deployment can back it with
//! an external cache; the in-process store keeps buckets in a locked map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

/// Source of wall-clock milliseconds
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Real clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Manually advanced clock for deterministic tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<u64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Mutex::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by.as_millis() as u64;
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        *self.now.lock()
    }
}

/// Window counter storage
pub trait RateLimitStore: Send + Sync {
    /// Count one hit for `key` and return the total within the current window
    fn increment(&self, key: &str, window: Duration) -> u64;
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u64,
    reset_at: u64,
}

/// Bucket count at which `increment` first sweeps expired windows
const SWEEP_THRESHOLD: usize = 1024;

struct Buckets {
    map: HashMap<String, Bucket>,
    /// Sweep once `map` reaches this size; doubles past live buckets
    sweep_at: usize,
}

impl Buckets {
    fn sweep(&mut self, now: u64) -> usize {
        let before = self.map.len();
        self.map.retain(|_, b| b.reset_at > now);
        self.sweep_at = (self.map.len() * 2).max(SWEEP_THRESHOLD);
        before - self.map.len()
    }
}

/// In-process store: a locked map of fixed windows
pub struct InMemoryRateLimitStore {
    buckets: Mutex<Buckets>,
    clock: Arc<dyn Clock>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: Mutex::new(Buckets {
                map: HashMap::new(),
                sweep_at: SWEEP_THRESHOLD,
            }),
            clock,
        }
    }

    /// Drop buckets whose window has elapsed
    pub fn prune(&self) -> usize {
        let now = self.clock.now_ms();
        self.buckets.lock().sweep(now)
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryRateLimitStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitStore for InMemoryRateLimitStore {
    fn increment(&self, key: &str, window: Duration) -> u64 {
        let now = self.clock.now_ms();
        let window_ms = window.as_millis() as u64;
        let mut buckets = self.buckets.lock();
        if buckets.map.len() >= buckets.sweep_at {
            let dropped = buckets.sweep(now);
            debug!(dropped, live = buckets.map.len(), "Swept expired rate-limit buckets");
        }

        let bucket = buckets.map.entry(key.to_string()).or_insert(Bucket {
            count: 0,
            reset_at: now + window_ms,
        });
        if bucket.reset_at <= now {
            bucket.count = 0;
            bucket.reset_at = now + window_ms;
        }
        bucket.count += 1;
        bucket.count
    }
}

/// Allows `max` hits per key within each fixed window
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    max: u64,
    window: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, max: u64, window: Duration) -> Self {
        Self { store, max, window }
    }

    /// In-process limiter on the system clock
    pub fn in_memory(max: u64, window: Duration) -> Self {
        Self::new(Arc::new(InMemoryRateLimitStore::new()), max, window)
    }

    /// Record a hit and report whether it is within the limit
    pub fn check(&self, key: &str) -> bool {
        let count = self.store.increment(key, self.window);
        let allowed = count <= self.max;
        if !allowed {
            debug!(key, count, max = self.max, "Rate limit exceeded");
        }
        allowed
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}
