use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters recorded by the fragment cache.
///
/// All counters use relaxed atomic increments; they are observability data,
/// not synchronization points.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    refresh_successes: AtomicU64,
    refresh_failures: AtomicU64,
}

impl CacheStats {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refresh_success(&self) {
        self.refresh_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refresh_failure(&self) {
        self.refresh_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of cache reads that returned a live fragment
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of cache reads that found nothing or only an expired fragment
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Number of background refreshes that produced a cacheable fragment
    pub fn refresh_successes(&self) -> u64 {
        self.refresh_successes.load(Ordering::Relaxed)
    }

    /// Number of background refreshes that failed or produced a
    /// non-cacheable fragment
    pub fn refresh_failures(&self) -> u64 {
        self.refresh_failures.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of the fragment cache counters, taken once per
/// [`resolve_includes`](crate::TransclusionProcessor::resolve_includes)
/// call for the stats comment and exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    /// Number of fragments currently cached
    pub item_count: u64,
    /// See [`CacheStats::hits`]
    pub hits: u64,
    /// See [`CacheStats::misses`]
    pub misses: u64,
    /// See [`CacheStats::refresh_successes`]
    pub refresh_successes: u64,
    /// See [`CacheStats::refresh_failures`]
    pub refresh_failures: u64,
}
