//! Dual leaky-bucket rate limiter (requests/window and tokens/window).
//!
//! Each [`Bucket`] is a bounded counter guarded by `Mutex + Condvar`, refilled
//! by its own background thread. Token cost of a call is only known after the
//! response arrives, so callers [`reserve`](Limiter::reserve) with an estimate
//! and [`reconcile`](Limiter::reconcile) with the real count afterwards.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::shutdown::{CancelToken, Cancelled};

/// How long a blocked taker waits before re-checking cancellation
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Refill tick bounds. Units are credited by elapsed time, so the tick only
/// affects smoothness and how quickly a filler notices shutdown.
const MIN_TICK: Duration = Duration::from_millis(1);
const MAX_TICK: Duration = Duration::from_millis(100);

/// Bounded counter in `[0, capacity]`.
#[derive(Debug)]
pub struct Bucket {
    capacity: u64,
    level: Mutex<u64>,
    cond: Condvar,
}

impl Bucket {
    /// Create an empty bucket
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            level: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn level(&self) -> u64 {
        *self.level.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add up to `n` units without waiting; whatever would overflow is dropped.
    ///
    /// Returns the number of units actually added.
    pub fn try_add(&self, n: u64) -> u64 {
        if n == 0 {
            return 0;
        }
        let mut level = self.level.lock().unwrap_or_else(PoisonError::into_inner);
        let added = n.min(self.capacity - *level);
        *level += added;
        drop(level);
        if added > 0 {
            self.cond.notify_all();
        }
        added
    }

    /// Remove `n` units, taking them as they become available.
    ///
    /// `n` may exceed capacity. On cancellation the units already taken stay
    /// consumed.
    pub fn take(&self, n: u64, cancel: &CancelToken) -> Result<(), Cancelled> {
        let mut remaining = n;
        let mut level = self.level.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let grab = remaining.min(*level);
            *level -= grab;
            remaining -= grab;
            if remaining == 0 {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            level = self
                .cond
                .wait_timeout(level, WAIT_SLICE)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Bucket capacities and the window they are spread over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterConfig {
    pub requests: u64,
    pub tokens: u64,
    pub window: Duration,
}

impl LimiterConfig {
    /// Requests and tokens per minute
    pub fn per_minute(requests: u64, tokens: u64) -> Self {
        Self {
            requests,
            tokens,
            window: Duration::from_secs(60),
        }
    }
}

/// Counters for the limiter stats log and the run summary
#[derive(Debug, Default)]
pub struct LimiterStats {
    pub requests: AtomicU64,
    pub estimated_tokens: AtomicU64,
    pub actual_tokens: AtomicU64,
    window_estimated: AtomicU64,
    window_actual: AtomicU64,
}

impl LimiterStats {
    fn log_window(&self, requests: &Bucket, tokens: &Bucket) {
        log::debug!(
            "limiter stats: requests_bucket={}/{} tokens_bucket={}/{} estimated_window={} used_window={}",
            requests.level(),
            requests.capacity(),
            tokens.level(),
            tokens.capacity(),
            self.window_estimated.swap(0, Ordering::Relaxed),
            self.window_actual.swap(0, Ordering::Relaxed),
        );
    }
}

/// Dual-bucket limiter. Dropping it stops the refill threads.
pub struct Limiter {
    requests: Arc<Bucket>,
    tokens: Arc<Bucket>,
    stats: Arc<LimiterStats>,
    stop: Arc<AtomicBool>,
    fillers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("requests", &self.requests)
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}

impl Limiter {
    /// Start a limiter with empty buckets and spawn their refill threads.
    pub fn new(config: LimiterConfig) -> io::Result<Self> {
        if config.requests == 0 || config.tokens == 0 || config.window.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "rate limits and window must be non-zero",
            ));
        }

        let requests = Arc::new(Bucket::new(config.requests));
        let tokens = Arc::new(Bucket::new(config.tokens));
        let stats = Arc::new(LimiterStats::default());
        let stop = Arc::new(AtomicBool::new(false));

        let mut limiter = Self {
            requests: requests.clone(),
            tokens: tokens.clone(),
            stats: stats.clone(),
            stop: stop.clone(),
            fillers: Vec::with_capacity(2),
        };

        // Request filler doubles as the per-window stats logger
        let on_window = {
            let (requests, tokens) = (requests.clone(), tokens.clone());
            move || stats.log_window(&requests, &tokens)
        };
        limiter.fillers.push(spawn_filler(
            "limiter-requests",
            requests,
            config.window,
            stop.clone(),
            on_window,
        )?);
        limiter
            .fillers
            .push(spawn_filler("limiter-tokens", tokens, config.window, stop, || {})?);

        log::debug!(
            "limiter started: {} requests / {} tokens per {:?}",
            config.requests,
            config.tokens,
            config.window
        );
        Ok(limiter)
    }

    /// Admission gate for one call: take `estimate` tokens, then one request.
    pub fn reserve(&self, estimate: u64, cancel: &CancelToken) -> Result<(), Cancelled> {
        self.tokens.take(estimate, cancel)?;
        self.requests.take(1, cancel)?;
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        self.stats.estimated_tokens.fetch_add(estimate, Ordering::Relaxed);
        self.stats.window_estimated.fetch_add(estimate, Ordering::Relaxed);
        Ok(())
    }

    /// Charge the real token cost, then refund the estimate without waiting.
    ///
    /// The refund is capped at capacity, so a burst of over-estimates is lossy
    /// rather than blocking.
    pub fn reconcile(&self, estimate: u64, actual: u64, cancel: &CancelToken) -> Result<(), Cancelled> {
        self.stats.actual_tokens.fetch_add(actual, Ordering::Relaxed);
        self.stats.window_actual.fetch_add(actual, Ordering::Relaxed);
        self.tokens.take(actual, cancel)?;
        self.tokens.try_add(estimate);
        Ok(())
    }

    pub fn stats(&self) -> &LimiterStats {
        &self.stats
    }

    pub fn requests(&self) -> &Bucket {
        &self.requests
    }

    pub fn tokens(&self) -> &Bucket {
        &self.tokens
    }
}

impl Drop for Limiter {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.fillers.drain(..) {
            if handle.join().is_err() {
                log::error!("limiter refill thread panicked");
            }
        }
    }
}

/// Tick interval: one unit's worth of time, clamped
fn tick_for(capacity: u64, window: Duration) -> Duration {
    let per_unit = window.as_nanos() / u128::from(capacity.max(1));
    Duration::from_nanos(u64::try_from(per_unit).unwrap_or(u64::MAX)).clamp(MIN_TICK, MAX_TICK)
}

/// Units owed after `elapsed` at `capacity` per `window`
fn units_due(elapsed: Duration, capacity: u64, window: Duration) -> u64 {
    let due = elapsed.as_nanos() * u128::from(capacity) / window.as_nanos();
    u64::try_from(due).unwrap_or(u64::MAX)
}

fn spawn_filler(
    name: &str,
    bucket: Arc<Bucket>,
    window: Duration,
    stop: Arc<AtomicBool>,
    on_window: impl Fn() + Send + 'static,
) -> io::Result<JoinHandle<()>> {
    let tick = tick_for(bucket.capacity(), window);
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let start = Instant::now();
            let mut credited = 0u64;
            let mut windows = 0u128;
            while !stop.load(Ordering::Relaxed) {
                std::thread::sleep(tick);
                let elapsed = start.elapsed();
                let due = units_due(elapsed, bucket.capacity(), window);
                // Overflow is dropped, not queued: credit it regardless
                bucket.try_add(due - credited);
                credited = due;

                let window_idx = elapsed.as_nanos() / window.as_nanos();
                if window_idx > windows {
                    windows = window_idx;
                    on_window();
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_add_caps_at_capacity() {
        let b = Bucket::new(5);
        assert_eq!(b.try_add(3), 3);
        assert_eq!(b.try_add(10), 2);
        assert_eq!(b.try_add(1), 0);
        assert_eq!(b.level(), 5);
    }

    #[test]
    fn take_available_units() {
        let b = Bucket::new(10);
        b.try_add(10);
        b.take(4, &CancelToken::new()).unwrap();
        assert_eq!(b.level(), 6);
    }

    #[test]
    fn take_blocks_until_added() {
        let b = Arc::new(Bucket::new(10));
        let b2 = b.clone();
        let handle = std::thread::spawn(move || {
            b2.take(3, &CancelToken::new()).unwrap();
            42
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        b.try_add(2);
        std::thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        b.try_add(5);

        assert_eq!(handle.join().unwrap(), 42);
        assert_eq!(b.level(), 4);
    }

    #[test]
    fn take_more_than_capacity() {
        let b = Arc::new(Bucket::new(2));
        let b2 = b.clone();
        let handle = std::thread::spawn(move || b2.take(5, &CancelToken::new()));
        for _ in 0..10 {
            b.try_add(2);
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handle.join().unwrap(), Ok(()));
    }

    #[test]
    fn take_cancelled() {
        let b = Bucket::new(10);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(b.take(1, &cancel), Err(Cancelled));
    }

    #[test]
    fn concurrent_takes_never_overdraw() {
        let b = Arc::new(Bucket::new(100));
        b.try_add(100);
        let cancel = CancelToken::new();
        let taken = AtomicU64::new(0);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    // 8 * 10 = 80 <= 100: all succeed immediately
                    b.take(10, &cancel).unwrap();
                    taken.fetch_add(10, Ordering::Relaxed);
                });
            }
        });
        assert_eq!(taken.load(Ordering::Relaxed), 80);
        assert_eq!(b.level(), 20);
    }

    #[test]
    fn tick_is_clamped() {
        let minute = Duration::from_secs(60);
        assert_eq!(tick_for(1, minute), MAX_TICK);
        assert_eq!(tick_for(1_000_000, minute), MIN_TICK);
        assert_eq!(tick_for(6000, minute), Duration::from_millis(10));
    }

    #[test]
    fn units_due_by_elapsed() {
        let minute = Duration::from_secs(60);
        assert_eq!(units_due(Duration::from_secs(30), 60, minute), 30);
        assert_eq!(units_due(Duration::from_millis(500), 60, minute), 0);
        assert_eq!(units_due(minute * 2, 3150, minute), 6300);
    }

    #[test]
    fn zero_limits_rejected() {
        assert!(Limiter::new(LimiterConfig::per_minute(0, 10)).is_err());
        assert!(Limiter::new(LimiterConfig::per_minute(10, 0)).is_err());
    }

    #[test]
    fn refill_stops_at_capacity() {
        let limiter = Limiter::new(LimiterConfig {
            requests: 5,
            tokens: 20,
            window: Duration::from_millis(50),
        })
        .unwrap();
        // Several windows' worth of refill
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(limiter.requests().level(), 5);
        assert_eq!(limiter.tokens().level(), 20);
    }

    #[test]
    fn reconcile_refund_capped() {
        let limiter = Limiter::new(LimiterConfig {
            requests: 10,
            tokens: 100,
            window: Duration::from_millis(100),
        })
        .unwrap();
        let cancel = CancelToken::new();
        limiter.reserve(50, &cancel).unwrap();
        // Refund far more than was reserved
        limiter.reconcile(10_000, 1, &cancel).unwrap();
        assert!(limiter.tokens().level() <= 100);
        std::thread::sleep(Duration::from_millis(200));
        assert!(limiter.tokens().level() <= 100);
    }

    #[test]
    fn reserve_waits_for_refill() {
        // 20 tokens per 200ms: 10 tokens need ~100ms from an empty bucket
        let limiter = Limiter::new(LimiterConfig {
            requests: 100,
            tokens: 20,
            window: Duration::from_millis(200),
        })
        .unwrap();
        let start = Instant::now();
        limiter.reserve(10, &CancelToken::new()).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(80));
        assert_eq!(limiter.stats().requests.load(Ordering::Relaxed), 1);
        assert_eq!(limiter.stats().estimated_tokens.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn concurrent_reserves_respect_budget() {
        // 40 tokens per 200ms window. Four reserves of 20 need 80 tokens,
        // i.e. at least ~one full window beyond the first.
        let limiter = Limiter::new(LimiterConfig {
            requests: 1000,
            tokens: 40,
            window: Duration::from_millis(200),
        })
        .unwrap();
        let cancel = CancelToken::new();
        let start = Instant::now();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| limiter.reserve(20, &cancel).unwrap());
            }
        });
        assert!(start.elapsed() >= Duration::from_millis(350));
        assert_eq!(limiter.stats().requests.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn reserve_cancellable() {
        let limiter = Limiter::new(LimiterConfig::per_minute(1, 1)).unwrap();
        let cancel = CancelToken::new();
        let c2 = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            c2.cancel();
        });
        assert_eq!(limiter.reserve(1_000, &cancel), Err(Cancelled));
        handle.join().unwrap();
    }
}
