//! Metrics sink injected into the cache strategy and the install manager.
//!
//! - [`MetricsSink`] - events reported by the cache components
//! - [`NoopMetrics`] - discards everything
//! - [`CacheCounters`] - atomic counters with a [`CacheCounters::snapshot`]

use std::sync::atomic::{AtomicU64, Ordering};

/// Kind of request reported on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Install,
    Purge,
    Defrag,
    Verify,
}

/// Outcome category of a completed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestOutcome {
    Ok,
    Cancelled,
    Error,
}

/// Receiver of cache events. All methods default to doing nothing.
pub trait MetricsSink: Send + Sync {
    fn on_cache_hit(&self, _bytes: u64) {}
    fn on_cache_miss(&self) {}
    fn on_cache_write(&self, _bytes: u64) {}
    fn on_cache_write_dropped(&self, _bytes: u64) {}
    fn on_invalidate(&self, _bytes: u64) {}
    fn on_abandon(&self) {}
    fn on_hash_mismatch(&self) {}
    fn on_download(&self, _bytes: u64) {}
    fn on_request_completed(&self, _kind: RequestKind, _outcome: RequestOutcome) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    hit_bytes: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    written_bytes: AtomicU64,
    dropped_writes: AtomicU64,
    invalidated_bytes: AtomicU64,
    abandons: AtomicU64,
    hash_mismatches: AtomicU64,
    downloads: AtomicU64,
    downloaded_bytes: AtomicU64,
    completed_requests: AtomicU64,
    failed_requests: AtomicU64,
    cancelled_requests: AtomicU64,
}

/// Point-in-time copy of [`CacheCounters`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub hits: u64,
    pub hit_bytes: u64,
    pub misses: u64,
    pub writes: u64,
    pub written_bytes: u64,
    pub dropped_writes: u64,
    pub invalidated_bytes: u64,
    pub abandons: u64,
    pub hash_mismatches: u64,
    pub downloads: u64,
    pub downloaded_bytes: u64,
    pub completed_requests: u64,
    pub failed_requests: u64,
    pub cancelled_requests: u64,
}

impl CountersSnapshot {
    /// Hit rate as a percentage (0.0 - 100.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

impl CacheCounters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            hit_bytes: self.hit_bytes.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            written_bytes: self.written_bytes.load(Ordering::Relaxed),
            dropped_writes: self.dropped_writes.load(Ordering::Relaxed),
            invalidated_bytes: self.invalidated_bytes.load(Ordering::Relaxed),
            abandons: self.abandons.load(Ordering::Relaxed),
            hash_mismatches: self.hash_mismatches.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
            downloaded_bytes: self.downloaded_bytes.load(Ordering::Relaxed),
            completed_requests: self.completed_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            cancelled_requests: self.cancelled_requests.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for CacheCounters {
    fn on_cache_hit(&self, bytes: u64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.hit_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn on_cache_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn on_cache_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.written_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn on_cache_write_dropped(&self, _bytes: u64) {
        self.dropped_writes.fetch_add(1, Ordering::Relaxed);
    }

    fn on_invalidate(&self, bytes: u64) {
        self.invalidated_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn on_abandon(&self) {
        self.abandons.fetch_add(1, Ordering::Relaxed);
    }

    fn on_hash_mismatch(&self) {
        self.hash_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    fn on_download(&self, bytes: u64) {
        self.downloads.fetch_add(1, Ordering::Relaxed);
        self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn on_request_completed(&self, _kind: RequestKind, outcome: RequestOutcome) {
        let counter = match outcome {
            RequestOutcome::Ok => &self.completed_requests,
            RequestOutcome::Cancelled => &self.cancelled_requests,
            RequestOutcome::Error => &self.failed_requests,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
