//! C6: Adaptive rate controller (spec §4.6). Recomputed on every batch
//! completion when a deadline is set: `(new_pool_size, new_delay)` derived
//! from elapsed time, progress, the deadline, and remaining bytes.

use crate::config::ScrubConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Minimum scheduler granularity used when the controller is not actively
/// throttling (spec §4.6 "new_delay = 1 tick").
const TICK: Duration = Duration::from_millis(1);

pub struct RateController {
    deadline: Option<Duration>,
    target_bytes: u64,
    batch_bytes: u64,
    max_pool: usize,
    default_pool_size: usize,
    max_pages_per_batch: usize,
    boost_enabled: bool,
    pool_size: AtomicUsize,
    delay: Mutex<Duration>,
    boost_active: AtomicBool,
}

impl RateController {
    pub fn new(config: &ScrubConfig, target_bytes: u64) -> Self {
        let batch_bytes = (config.pages_per_batch * config.page_size) as u64;
        Self {
            deadline: config.deadline,
            target_bytes,
            batch_bytes: batch_bytes.max(1),
            max_pool: config.max_pool,
            default_pool_size: config.default_pool_size,
            max_pages_per_batch: config.pages_per_batch,
            boost_enabled: config.bg_flags.boost,
            pool_size: AtomicUsize::new(config.default_pool_size),
            delay: Mutex::new(Duration::ZERO),
            boost_active: AtomicBool::new(false),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size.load(Ordering::Acquire)
    }

    pub fn delay(&self) -> Duration {
        *self.delay.lock()
    }

    fn apply(&self, pool: usize, delay: Duration) -> (usize, Duration) {
        self.pool_size.store(pool, Ordering::Release);
        *self.delay.lock() = delay;
        (pool, delay)
    }

    /// Spec §4.6's core algorithm. Called on each completion when a deadline
    /// is set; with no deadline the controller stays at its steady-state
    /// default (spec §8 boundary behavior: "Deadline of 0, default
    /// steady-state pool, no pacing").
    pub fn recompute(&self, elapsed: Duration, progress_bytes: u64) -> (usize, Duration) {
        let deadline = match self.deadline {
            Some(d) if !d.is_zero() => d,
            _ => return self.apply(self.default_pool_size, Duration::ZERO),
        };
        if elapsed >= deadline {
            // Boundary behavior: elapsed >= deadline -> pool clamped to MAX,
            // delay 0, no further adjustment.
            return self.apply(self.max_pool, Duration::ZERO);
        }
        let remaining_bytes = self
            .target_bytes
            .saturating_sub(progress_bytes)
            .max(self.batch_bytes);
        let remaining_time = (deadline - elapsed).as_secs_f64().max(f64::MIN_POSITIVE);
        let bytes_per_sec = (remaining_bytes as f64 / remaining_time).ceil().max(1.0) as u64;

        if bytes_per_sec < self.batch_bytes {
            let secs = self.batch_bytes as f64 / bytes_per_sec as f64;
            self.apply(1, Duration::from_secs_f64(secs))
        } else {
            let pool = ((bytes_per_sec as f64 / self.batch_bytes as f64).ceil() as usize)
                .clamp(1, self.max_pool);
            self.apply(pool, TICK)
        }
    }

    fn goal_bytes(&self, elapsed: Duration) -> u64 {
        match self.deadline {
            None => 0,
            Some(d) if d.is_zero() => self.target_bytes,
            Some(d) => {
                let frac = (elapsed.as_secs_f64() / d.as_secs_f64()).min(1.0);
                (self.target_bytes as f64 * frac) as u64
            }
        }
    }

    /// Optional "boost" lever (spec §4.6): re-evaluates whether the scrub
    /// thread should be elevated to a best-effort I/O priority class.
    /// Returns the new state; only meaningful when `BGSC_BOOST` was set.
    pub fn update_boost(&self, progress_bytes: u64, elapsed: Duration) -> bool {
        if !self.boost_enabled {
            return false;
        }
        let goal = self.goal_bytes(elapsed);
        let behind = goal.saturating_sub(progress_bytes);
        let should_boost = behind >= 100 * self.batch_bytes;
        self.boost_active.store(should_boost, Ordering::Release);
        should_boost
    }

    pub fn boost_active(&self) -> bool {
        self.boost_active.load(Ordering::Acquire)
    }

    pub fn max_pages_per_batch(&self) -> usize {
        self.max_pages_per_batch
    }
}

/// Scales the configured delay by how full a completing batch actually was
/// (spec §4.6 "Pacing": `scaled_delay = delay × (batch_pages /
/// max_pages_per_batch)`).
pub fn scaled_delay(delay: Duration, batch_pages: usize, max_pages_per_batch: usize) -> Duration {
    if max_pages_per_batch == 0 || batch_pages == 0 {
        return Duration::ZERO;
    }
    let frac = (batch_pages as f64 / max_pages_per_batch as f64).min(1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * frac)
}

/// The remaining pacing interval a completing batch must wait out before it
/// can return to the free-list, or `None` if it has already spent at least
/// that long in flight.
pub fn pacing_remainder(
    delay: Duration,
    batch_pages: usize,
    max_pages_per_batch: usize,
    time_in_flight: Duration,
) -> Option<Duration> {
    let scaled = scaled_delay(delay, batch_pages, max_pages_per_batch);
    if time_in_flight >= scaled {
        None
    } else {
        Some(scaled - time_in_flight)
    }
}
