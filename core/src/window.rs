//! Time-bucketed outcome window for circuit breakers
//!
//! This module provides:
//! - `Clock`: monotonic time source anchored at creation (tokio time, so it
//!   follows a paused test clock)
//! - `RollingWindow`: a fixed number of time buckets holding outcome counts,
//!   giving a moving failure rate instead of an all-time counter

use crate::EventKind;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Monotonic clock measuring offsets from its creation instant
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    /// Create a clock anchored at the current instant
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Time elapsed since the clock was created
    pub fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome counts over the live part of a window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowCounts {
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
}

impl WindowCounts {
    /// Total number of samples
    pub fn total(&self) -> u64 {
        self.successes + self.failures + self.timeouts
    }

    /// Failures plus timeouts
    pub fn failed(&self) -> u64 {
        self.failures + self.timeouts
    }

    /// Failed samples as a percentage of the total (0.0 when empty)
    pub fn error_percentage(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.failed() as f64 * 100.0 / total as f64
    }

    fn add(&mut self, kind: EventKind) {
        match kind {
            EventKind::Success => self.successes += 1,
            EventKind::Failure => self.failures += 1,
            EventKind::Timeout => self.timeouts += 1,
        }
    }

    fn merge(&mut self, other: &WindowCounts) {
        self.successes += other.successes;
        self.failures += other.failures;
        self.timeouts += other.timeouts;
    }
}

#[derive(Debug)]
struct Bucket {
    start: Duration,
    counts: WindowCounts,
}

/// Thread-safe rolling window of outcome samples
///
/// The window spans `duration` and is split into `bucket_count` buckets of
/// equal width. Buckets whose start is `duration` or more in the past are
/// dropped on write and skipped on read.
#[derive(Debug)]
pub struct RollingWindow {
    buckets: Mutex<VecDeque<Bucket>>,
    duration: Duration,
    bucket_count: usize,
    bucket_nanos: u128,
}

impl RollingWindow {
    /// Create a window covering `duration` with `bucket_count` buckets
    ///
    /// A zero bucket count is treated as one bucket.
    pub fn new(duration: Duration, bucket_count: usize) -> Self {
        let bucket_count = bucket_count.max(1);
        let bucket_nanos = (duration.as_nanos() / bucket_count as u128).max(1);

        Self {
            buckets: Mutex::new(VecDeque::with_capacity(bucket_count)),
            duration,
            bucket_count,
            bucket_nanos,
        }
    }

    /// Number of buckets the window is divided into
    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// Record one outcome at monotonic time `now`
    pub fn record(&self, kind: EventKind, now: Duration) {
        let start = self.bucket_start(now);
        let mut buckets = self.buckets.lock();

        while let Some(front) = buckets.front() {
            if self.is_live(front, now) {
                break;
            }
            buckets.pop_front();
        }

        match buckets.back_mut() {
            Some(bucket) if bucket.start == start => bucket.counts.add(kind),
            _ => {
                let mut counts = WindowCounts::default();
                counts.add(kind);
                buckets.push_back(Bucket { start, counts });
            }
        }

        while buckets.len() > self.bucket_count {
            buckets.pop_front();
        }
    }

    /// Sum of the live buckets at monotonic time `now`
    ///
    /// Reading never discards buckets.
    pub fn counts(&self, now: Duration) -> WindowCounts {
        let buckets = self.buckets.lock();
        let mut total = WindowCounts::default();
        for bucket in buckets.iter().filter(|b| self.is_live(b, now)) {
            total.merge(&bucket.counts);
        }
        total
    }

    /// Drop every sample
    pub fn clear(&self) {
        self.buckets.lock().clear();
    }

    fn bucket_start(&self, now: Duration) -> Duration {
        let aligned = now.as_nanos() / self.bucket_nanos * self.bucket_nanos;
        Duration::from_nanos(u64::try_from(aligned).unwrap_or(u64::MAX))
    }

    fn is_live(&self, bucket: &Bucket, now: Duration) -> bool {
        now.saturating_sub(bucket.start) < self.duration
    }
}
