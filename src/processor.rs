//! Orchestration of a transclusion pass: scan, resolve concurrently,
//! splice, aggregate.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use http::HeaderMap;
use log::debug;
use tokio::sync::Semaphore;

use crate::cache::FragmentCache;
use crate::config::AbleronConfig;
use crate::error::TransclusionError;
use crate::fragment::Fragment;
use crate::include::{
    filter_request_headers, FragmentSource, ResolveContext, SingleFlight,
};
use crate::result::TransclusionResult;
use crate::scanner;

/// Upper bound of include resolutions running at the same time
const MAX_CONCURRENT_RESOLUTIONS: usize = 64;

/// TTL of the synthetic fallback fragment used when a resolution task dies
const UNRESOLVABLE_INCLUDE_TTL: Duration = Duration::from_secs(60);

/// The transclusion engine.
///
/// Owns one fragment cache and one HTTP client for its lifetime. Intended
/// to be created once and shared; [`resolve_includes`] may be called from
/// any number of tasks concurrently.
///
/// ```no_run
/// use ableron::{AbleronConfig, TransclusionProcessor};
/// use http::HeaderMap;
///
/// #[tokio::main]
/// async fn main() -> ableron::Result<()> {
///     let processor = TransclusionProcessor::new(AbleronConfig::default())?;
///     let result = processor
///         .resolve_includes(
///             r#"<ableron-include src="https://fragments.example/header"/>"#,
///             &HeaderMap::new(),
///         )
///         .await;
///     println!("{}", result.content());
///     Ok(())
/// }
/// ```
///
/// [`resolve_includes`]: Self::resolve_includes
pub struct TransclusionProcessor {
    config: Arc<AbleronConfig>,
    http_client: reqwest::Client,
    fragment_cache: FragmentCache,
    inflight: Arc<SingleFlight>,
    resolution_limiter: Arc<Semaphore>,
}

impl fmt::Debug for TransclusionProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransclusionProcessor")
            .field("config", &self.config)
            .field("fragment_cache", &self.fragment_cache)
            .finish_non_exhaustive()
    }
}

impl TransclusionProcessor {
    /// Creates a processor with its own HTTP client. The client never
    /// follows redirects; fragment responses are taken as they come.
    pub fn new(config: AbleronConfig) -> crate::Result<Self> {
        let http_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self::with_client(config, http_client))
    }

    /// Creates a processor around an existing HTTP client.
    ///
    /// The client should be configured not to follow redirects, otherwise
    /// redirect responses of primary fragments cannot propagate to the
    /// outer response.
    pub fn with_client(
        config: AbleronConfig,
        http_client: reqwest::Client,
    ) -> Self {
        let fragment_cache = FragmentCache::new(&config);
        Self {
            config: Arc::new(config),
            http_client,
            fragment_cache,
            inflight: Arc::new(SingleFlight::new()),
            resolution_limiter: Arc::new(Semaphore::new(
                MAX_CONCURRENT_RESOLUTIONS,
            )),
        }
    }

    /// The configuration this processor runs with
    pub fn config(&self) -> &AbleronConfig {
        &self.config
    }

    /// The fragment cache owned by this processor
    pub fn fragment_cache(&self) -> &FragmentCache {
        &self.fragment_cache
    }

    /// Resolves all includes of the given content.
    ///
    /// Unique includes are resolved concurrently; the call returns once
    /// every resolution has finished. Fragment bodies replace every
    /// occurrence of their raw tag text. This never fails: includes whose
    /// sources are unreachable fall back per their precedence and the
    /// composed result is always returned.
    pub async fn resolve_includes(
        &self,
        content: &str,
        parent_headers: &HeaderMap,
    ) -> TransclusionResult {
        let started = Instant::now();
        if !self.config.enabled {
            return TransclusionResult::unchanged(content);
        }
        let includes = scanner::find_includes(content);
        if includes.is_empty() {
            return TransclusionResult::unchanged(content);
        }

        let mut result = TransclusionResult::new(
            content,
            self.config.stats_append_to_content,
            self.config.stats_expose_fragment_url,
        );
        let parent_headers = Arc::new(parent_headers.clone());
        let forward_headers = filter_request_headers(
            &parent_headers,
            &self.config.request_headers_to_pass(),
        );
        let context = ResolveContext {
            http_client: self.http_client.clone(),
            forward_headers,
            parent_headers,
            cache: self.fragment_cache.clone(),
            inflight: Arc::clone(&self.inflight),
            config: Arc::clone(&self.config),
        };

        let mut resolutions = Vec::with_capacity(includes.len());
        for include in includes {
            let include = Arc::new(include);
            let task_include = Arc::clone(&include);
            let task_context = context.clone();
            let limiter = Arc::clone(&self.resolution_limiter);
            let task = tokio::spawn(async move {
                let _permit = limiter.acquire_owned().await;
                task_include.resolve(&task_context).await
            });
            resolutions.push((include, task));
        }

        // Includes are folded in document order, so the first primary
        // include is decided by its offset in the content, not by which
        // resolution finished first
        for (include, task) in resolutions {
            match task.await {
                Ok(resolved) => {
                    result.add_resolved_include(
                        &include,
                        &resolved.fragment,
                        resolved.source,
                        resolved.resolution_time,
                    );
                }
                Err(err) => {
                    debug!(
                        "unable to resolve include '{}': {}",
                        include.id(),
                        TransclusionError::from(err)
                    );
                    let fragment = Fragment::local_expiring(
                        include.fallback_content(),
                        SystemTime::now() + UNRESOLVABLE_INCLUDE_TTL,
                    );
                    result.add_resolved_include(
                        &include,
                        &fragment,
                        FragmentSource::FallbackContent,
                        Duration::ZERO,
                    );
                }
            }
        }

        result.set_cache_stats(self.fragment_cache.stats_snapshot());
        result.set_processing_time(started.elapsed());
        result.finalize();
        result
    }
}
