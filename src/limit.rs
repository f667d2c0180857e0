use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Notify};

/// Sliding window length.
pub const WINDOW_MS: u64 = 60_000;
/// Compaction pass interval.
const COMPACT_INTERVAL_SECS: u64 = 30;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Requests left in the window after this one.
    pub remaining: u32,
    /// When the window frees up (monotonic milliseconds, same clock as
    /// `now_ms`). Only meaningful on rejection.
    pub reset_at_ms: u64,
}

impl Decision {
    /// Seconds until `reset_at_ms`, rounded up. Feeds `Retry-After`.
    pub fn retry_after_secs(&self) -> u64 {
        let now = now_ms();
        self.reset_at_ms.saturating_sub(now).div_ceil(1000).max(1)
    }
}

/// Sliding-window counter over the last 60 s, keyed by an opaque string
/// (typically a client IP).
///
/// Each key holds the ordered timestamps of its requests inside the window.
/// Unlike an estimated window, the exact log guarantees that any burst of
/// `n > limit` requests admits exactly `limit`.
///
/// Keys are independent; per-key operations serialize on the key's own
/// `tokio::sync::Mutex` so waiting yields back to the runtime.
pub struct SlidingWindowLimiter {
    windows: DashMap<String, Arc<Mutex<VecDeque<u64>>>>,
    shutdown: Arc<Notify>,
    destroyed: AtomicBool,
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self {
            windows: DashMap::new(),
            shutdown: Arc::new(Notify::new()),
            destroyed: AtomicBool::new(false),
        }
    }
}

impl SlidingWindowLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check and record one request for `key`.
    pub async fn check(&self, key: &str, limit: u32) -> Decision {
        self.check_at(key, limit, now_ms()).await
    }

    /// Clock-injected variant of [`check`](Self::check); tests drive this
    /// directly to exercise window expiry deterministically.
    pub(crate) async fn check_at(&self, key: &str, limit: u32, now: u64) -> Decision {
        let window = if let Some(entry) = self.windows.get(key) {
            entry.value().clone()
        } else {
            self.windows
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
                .clone()
        };

        let mut w = window.lock().await;
        let cutoff = now.saturating_sub(WINDOW_MS);
        while w.front().is_some_and(|&t| t <= cutoff) {
            w.pop_front();
        }

        if w.len() as u32 >= limit {
            let earliest = w.front().copied().unwrap_or(now);
            return Decision {
                allowed: false,
                remaining: 0,
                reset_at_ms: earliest + WINDOW_MS,
            };
        }

        w.push_back(now);
        Decision {
            allowed: true,
            remaining: limit - w.len() as u32,
            reset_at_ms: now + WINDOW_MS,
        }
    }

    /// Spawn the background compaction task. Call once after construction;
    /// the task exits when `destroy` is called.
    pub fn start_compaction(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(COMPACT_INTERVAL_SECS)) => {}
                    _ = shutdown.notified() => return,
                }
                limiter.compact(now_ms());
            }
        });
    }

    /// Drop keys whose windows hold no live timestamps. Windows currently
    /// locked by a checker are left for the next pass.
    fn compact(&self, now: u64) {
        let cutoff = now.saturating_sub(WINDOW_MS);
        self.windows.retain(|_, window| match window.try_lock() {
            Ok(mut w) => {
                while w.front().is_some_and(|&t| t <= cutoff) {
                    w.pop_front();
                }
                !w.is_empty()
            }
            Err(_) => true,
        });
    }

    /// Number of keys currently tracked.
    pub fn key_count(&self) -> usize {
        self.windows.len()
    }

    /// Stop compaction and drop all windows. Safe to call repeatedly.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        self.windows.clear();
    }
}

/// Monotonic milliseconds since process start.
fn now_ms() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}
