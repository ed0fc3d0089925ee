//! Size-bounded in-memory fragment cache.
//!
//! Entries are weighed by cache key length plus body length and expire
//! individually based on the fragment's expiration time. With auto refresh
//! enabled, cached fragments are re-fetched shortly before they expire so
//! hot includes keep being served from cache.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use futures::future::BoxFuture;
use http::HeaderMap;
use log::{debug, warn};
use moka::future::Cache as MokaCache;
use moka::notification::RemovalCause;
use moka::Expiry;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::config::AbleronConfig;
use crate::fragment::Fragment;
use crate::stats::{CacheStats, CacheStatsSnapshot};

/// Producer invoked by the cache to proactively refresh a fragment.
///
/// Returns the freshly fetched fragment, or `None` when the refresh attempt
/// failed entirely.
pub type FragmentRefreshFn =
    Arc<dyn Fn() -> BoxFuture<'static, Option<Fragment>> + Send + Sync>;

/// Per-entry TTL derived from the fragment's expiration time. Reads keep
/// the remaining TTL untouched.
struct FragmentExpiry;

impl Expiry<String, Arc<Fragment>> for FragmentExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        fragment: &Arc<Fragment>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(remaining_ttl(fragment))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        fragment: &Arc<Fragment>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(remaining_ttl(fragment))
    }
}

fn remaining_ttl(fragment: &Fragment) -> Duration {
    fragment
        .expiration()
        .duration_since(SystemTime::now())
        .unwrap_or(Duration::ZERO)
}

#[derive(Default)]
struct RefreshState {
    /// Set on every cache read, cleared by a successful refresh
    alive: bool,
    /// Successful refreshes in a row during which nobody read the entry
    inactive_refreshs: u32,
    /// Failed refresh attempts in a row
    attempts: u32,
}

#[derive(Default)]
struct EvictionWindow {
    window_start: Option<Instant>,
    suppressed: u64,
}

/// Size-weighted fragment store with per-entry TTL and optional proactive
/// refresh.
///
/// Cloning is cheap and yields a handle to the same underlying storage.
#[derive(Clone)]
pub struct FragmentCache {
    cache: MokaCache<String, Arc<Fragment>>,
    stats: Arc<CacheStats>,
    auto_refresh_enabled: bool,
    max_refresh_attempts: u32,
    max_inactive_refreshs: u32,
    refresh_states: Arc<Mutex<HashMap<String, RefreshState>>>,
    refresh_tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl fmt::Debug for FragmentCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentCache")
            .field("item_count", &self.cache.entry_count())
            .field("auto_refresh_enabled", &self.auto_refresh_enabled)
            .finish_non_exhaustive()
    }
}

impl FragmentCache {
    /// Creates a cache sized and tuned according to the given configuration
    pub fn new(config: &AbleronConfig) -> Self {
        let eviction_window = Arc::new(Mutex::new(EvictionWindow::default()));
        let cache = MokaCache::builder()
            .max_capacity(config.cache_max_size_in_bytes)
            .weigher(|key: &String, fragment: &Arc<Fragment>| {
                u32::try_from(key.len() + fragment.content().len())
                    .unwrap_or(u32::MAX)
            })
            .expire_after(FragmentExpiry)
            .eviction_listener(move |key, _fragment, cause| {
                if cause == RemovalCause::Size {
                    warn_size_eviction(&eviction_window, &key);
                }
            })
            .build();
        Self {
            cache,
            stats: Arc::new(CacheStats::default()),
            auto_refresh_enabled: config.cache_auto_refresh_enabled,
            max_refresh_attempts: config.cache_auto_refresh_max_attempts,
            max_inactive_refreshs: config
                .cache_auto_refresh_inactive_fragments_max_refreshs,
            refresh_states: Arc::new(Mutex::new(HashMap::new())),
            refresh_tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the cached fragment for the given key iff it has not expired
    /// yet. Expired entries are dropped on access.
    pub async fn get(&self, key: &str) -> Option<Arc<Fragment>> {
        match self.cache.get(key).await {
            Some(fragment) => {
                self.stats.record_hit();
                if self.auto_refresh_enabled {
                    if let Some(state) =
                        self.refresh_states.lock().get_mut(key)
                    {
                        state.alive = true;
                    }
                }
                Some(fragment)
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    /// Inserts or updates a fragment.
    ///
    /// Fragments whose expiration is not in the future are not stored.
    /// When auto refresh is enabled and a refresh function is given, a
    /// one-shot refresh is scheduled at 85% of the remaining TTL (at least
    /// 10 ms out).
    pub async fn put(
        &self,
        key: &str,
        fragment: Arc<Fragment>,
        refresher: Option<FragmentRefreshFn>,
    ) {
        let ttl = match fragment
            .expiration()
            .duration_since(SystemTime::now())
        {
            Ok(ttl) if !ttl.is_zero() => ttl,
            _ => return,
        };
        self.cache.insert(key.to_string(), fragment).await;
        if self.auto_refresh_enabled {
            if let Some(refresher) = refresher {
                self.refresh_states
                    .lock()
                    .entry(key.to_string())
                    .or_default();
                let delay = std::cmp::max(
                    Duration::from_millis(10),
                    ttl.mul_f64(0.85),
                );
                self.schedule_refresh(key.to_string(), delay, refresher);
            }
        }
    }

    /// Clears all cached fragments and cancels scheduled refreshes
    pub async fn invalidate_all(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        for (_, task) in self.refresh_tasks.lock().drain() {
            task.abort();
        }
        self.refresh_states.lock().clear();
    }

    /// The live counters of this cache
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Takes a point-in-time snapshot of the cache counters
    pub fn stats_snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            item_count: self.cache.entry_count(),
            hits: self.stats.hits(),
            misses: self.stats.misses(),
            refresh_successes: self.stats.refresh_successes(),
            refresh_failures: self.stats.refresh_failures(),
        }
    }

    #[cfg(test)]
    pub(crate) async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }

    fn schedule_refresh(
        &self,
        key: String,
        delay: Duration,
        refresher: FragmentRefreshFn,
    ) {
        let cache = self.clone();
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            cache.refresh(key, refresher).await;
        });
        // A replaced task is either the sleeping predecessor for this key
        // or the already completed task this reschedule originates from
        if let Some(previous) = self.refresh_tasks.lock().insert(task_key, task)
        {
            if !previous.is_finished() {
                previous.abort();
            }
        }
    }

    async fn refresh(&self, key: String, refresher: FragmentRefreshFn) {
        let worth_refreshing = match self.refresh_states.lock().get(&key) {
            Some(state) => {
                state.alive
                    || state.inactive_refreshs < self.max_inactive_refreshs
            }
            None => false,
        };
        if !worth_refreshing {
            debug!("stopping auto refresh of fragment '{key}': not in use");
            self.refresh_states.lock().remove(&key);
            return;
        }

        match refresher().await {
            Some(fragment) if fragment.is_cacheable() => {
                self.stats.record_refresh_success();
                {
                    let mut states = self.refresh_states.lock();
                    if let Some(state) = states.get_mut(&key) {
                        if state.alive {
                            state.alive = false;
                            state.inactive_refreshs = 0;
                        } else {
                            state.inactive_refreshs += 1;
                        }
                        state.attempts = 0;
                    }
                }
                self.put(&key, Arc::new(fragment), Some(refresher)).await;
            }
            _ => {
                self.stats.record_refresh_failure();
                let attempts = {
                    let mut states = self.refresh_states.lock();
                    match states.get_mut(&key) {
                        Some(state) => {
                            state.attempts += 1;
                            state.attempts
                        }
                        None => return,
                    }
                };
                if attempts < self.max_refresh_attempts {
                    debug!(
                        "refresh of fragment '{key}' failed, retrying in 1s \
                         (attempt {attempts} of {})",
                        self.max_refresh_attempts
                    );
                    self.schedule_refresh(
                        key,
                        Duration::from_secs(1),
                        refresher,
                    );
                } else {
                    debug!(
                        "refresh of fragment '{key}' failed {attempts} \
                         times, giving up"
                    );
                    self.refresh_states.lock().remove(&key);
                }
            }
        }
    }
}

fn warn_size_eviction(window: &Mutex<EvictionWindow>, key: &str) {
    let mut window = window.lock();
    let now = Instant::now();
    match window.window_start {
        Some(start) if now.duration_since(start) < Duration::from_secs(60) => {
            window.suppressed += 1;
        }
        _ => {
            if window.suppressed > 0 {
                warn!(
                    "fragment cache evicted {} more entries over its size \
                     limit in the last 60s",
                    window.suppressed
                );
            }
            warn!(
                "fragment cache size limit reached, evicted entry '{key}'"
            );
            window.window_start = Some(now);
            window.suppressed = 0;
        }
    }
}

/// Builds the cache key of a fragment URL, extended by the values of the
/// configured vary-by request headers. Segments are lowercased and sorted
/// so the key is independent of header order.
pub(crate) fn build_fragment_cache_key(
    url: &str,
    parent_headers: &HeaderMap,
    vary_by_headers: &[String],
) -> String {
    let mut segments: Vec<String> = vary_by_headers
        .iter()
        .filter_map(|name| {
            let values: Vec<&str> = parent_headers
                .get_all(name.as_str())
                .iter()
                .filter_map(|value| value.to_str().ok())
                .collect();
            if values.is_empty() {
                None
            } else {
                Some(format!(
                    "|{}={}",
                    name.to_ascii_lowercase(),
                    values.join(",").to_ascii_lowercase()
                ))
            }
        })
        .collect();
    segments.sort();
    let mut key = String::with_capacity(
        url.len() + segments.iter().map(String::len).sum::<usize>(),
    );
    key.push_str(url);
    for segment in &segments {
        key.push_str(segment);
    }
    key
}
