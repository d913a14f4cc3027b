use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Counters for the run in progress, shared with worker tasks.
pub struct RunProgress {
    pub movies_found: AtomicUsize,
    pub series_found: AtomicUsize,
    pub cache_updates: AtomicUsize,
    pub jobs_queued: AtomicUsize,
    pub duplicates: AtomicUsize,
    pub item_failures: AtomicUsize,
    start_time: Mutex<Instant>,
}

impl Default for RunProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl RunProgress {
    pub fn new() -> Self {
        Self {
            movies_found: AtomicUsize::new(0),
            series_found: AtomicUsize::new(0),
            cache_updates: AtomicUsize::new(0),
            jobs_queued: AtomicUsize::new(0),
            duplicates: AtomicUsize::new(0),
            item_failures: AtomicUsize::new(0),
            start_time: Mutex::new(Instant::now()),
        }
    }

    /// Zero every counter and restart the clock.
    pub fn reset(&self) {
        for counter in [
            &self.movies_found,
            &self.series_found,
            &self.cache_updates,
            &self.jobs_queued,
            &self.duplicates,
            &self.item_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        *self.start_time.lock() = Instant::now();
    }

    pub fn add_movies(&self, n: usize) {
        self.movies_found.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_series(&self, n: usize) {
        self.series_found.fetch_add(n, Ordering::Relaxed);
    }

    pub fn increment_cache_updates(&self) {
        self.cache_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_jobs(&self) {
        self.jobs_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_duplicates(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_failures(&self, n: usize) {
        self.item_failures.fetch_add(n, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.lock().elapsed()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            movies_found: self.movies_found.load(Ordering::Relaxed),
            series_found: self.series_found.load(Ordering::Relaxed),
            cache_updates: self.cache_updates.load(Ordering::Relaxed),
            jobs_queued: self.jobs_queued.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            item_failures: self.item_failures.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub movies_found: usize,
    pub series_found: usize,
    pub cache_updates: usize,
    pub jobs_queued: usize,
    pub duplicates: usize,
    pub item_failures: usize,
    pub elapsed: Duration,
}
