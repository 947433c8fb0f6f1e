use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared processed/dropped/error counters.
///
/// Cloning shares the underlying counters, which is how a `Stage` keeps one set of
/// numbers across every inner stream it rebuilds.
#[derive(Debug, Clone)]
pub struct StatisticsCounter {
    processed: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    start_time: Instant,
}

impl StatisticsCounter {
    pub fn new() -> Self {
        Self {
            processed: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Read-only view of the current counts.
    pub fn snapshot(&self) -> Statistics {
        Statistics {
            processed_frames: self.processed.load(Ordering::Relaxed),
            dropped_frames: self.dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            elapsed: self.start_time.elapsed(),
        }
    }
}

impl Default for StatisticsCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Statistics {
    pub processed_frames: u64,
    pub dropped_frames: u64,
    pub errors: u64,
    pub elapsed: Duration,
}

impl Statistics {
    /// Processed frames per second since the counter was created.
    pub fn throughput_fps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.processed_frames as f64 / secs
        }
    }

    /// Fraction of offered frames that were dropped, in `0.0..=1.0`.
    pub fn drop_ratio(&self) -> f64 {
        let offered = self.processed_frames + self.dropped_frames;
        if offered == 0 {
            0.0
        } else {
            self.dropped_frames as f64 / offered as f64
        }
    }

    pub fn format(&self) -> String {
        format!(
            "processed={} dropped={} errors={} fps={:.2} drop_ratio={:.2}",
            self.processed_frames,
            self.dropped_frames,
            self.errors,
            self.throughput_fps(),
            self.drop_ratio()
        )
    }
}
