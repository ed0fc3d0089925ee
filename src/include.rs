//! Include tags and their resolution against fragment origins.
//!
//! An include is resolved by trying its `src` URL, then its `fallback-src`
//! URL, then its inline fallback content. The first successful attempt
//! wins. Primary includes propagate the first errored response instead of
//! falling back to inline content, so error pages from the origin reach
//! the client unaltered.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use http::header::{HeaderMap, HeaderName, ACCEPT_ENCODING};
use log::{debug, warn};
use parking_lot::Mutex;
use url::Url;

use crate::cache::{build_fragment_cache_key, FragmentCache, FragmentRefreshFn};
use crate::config::AbleronConfig;
use crate::error::TransclusionError;
use crate::fragment::Fragment;
use crate::http_util::{
    compute_expiration, decode_body, is_status_cacheable, is_status_success,
};

/// Where the content that replaced an include came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentSource {
    /// Fetched from the include's `src` URL
    RemoteSrc,
    /// Served from cache for the include's `src` URL
    CachedSrc,
    /// Fetched from the include's `fallback-src` URL
    RemoteFallbackSrc,
    /// Served from cache for the include's `fallback-src` URL
    CachedFallbackSrc,
    /// Built locally from the include's inline fallback content
    FallbackContent,
}

impl fmt::Display for FragmentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteSrc => write!(f, "remote src"),
            Self::CachedSrc => write!(f, "cached src"),
            Self::RemoteFallbackSrc => write!(f, "remote fallback-src"),
            Self::CachedFallbackSrc => write!(f, "cached fallback-src"),
            Self::FallbackContent => write!(f, "fallback content"),
        }
    }
}

/// Outcome of one per-URL fetch attempt, shared between coalesced waiters
#[derive(Clone)]
pub(crate) enum AttemptOutcome {
    /// Response with a success status
    Success(Arc<Fragment>),
    /// Response received but with an error status. The fragment is cached
    /// when the status permits it, so repeated errors within the TTL don't
    /// re-hit the origin.
    ErrorStatus(Arc<Fragment>),
    /// Timeout, transport failure or unusable URL; no response to propagate
    Failed,
}

/// Coalesces concurrent fetches of the same cache key onto a single
/// in-flight request. The request is driven by its own task, so waiters
/// that time out don't abandon it mid-flight.
pub(crate) struct SingleFlight {
    inflight:
        Arc<Mutex<HashMap<String, Shared<BoxFuture<'static, AttemptOutcome>>>>>,
}

impl SingleFlight {
    pub(crate) fn new() -> Self {
        Self { inflight: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub(crate) async fn run(
        &self,
        key: &str,
        request: BoxFuture<'static, AttemptOutcome>,
    ) -> AttemptOutcome {
        let shared = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some(existing) => existing.clone(),
                None => {
                    let (sender, receiver) = tokio::sync::oneshot::channel();
                    let shared = async move {
                        receiver.await.unwrap_or(AttemptOutcome::Failed)
                    }
                    .boxed()
                    .shared();
                    inflight.insert(key.to_string(), shared.clone());
                    let inflight_map = Arc::clone(&self.inflight);
                    let request_key = key.to_string();
                    tokio::spawn(async move {
                        let outcome = request.await;
                        inflight_map.lock().remove(&request_key);
                        let _ = sender.send(outcome);
                    });
                    shared
                }
            }
        };
        shared.await
    }
}

/// One transclusion point parsed from an include tag.
///
/// Two includes with identical raw tag text are equal, regardless of how
/// their attributes were parsed.
#[derive(Debug, Clone)]
pub struct Include {
    raw_include_tag: String,
    id: String,
    src: Option<String>,
    src_timeout: Option<Duration>,
    fallback_src: Option<String>,
    fallback_src_timeout: Option<Duration>,
    primary: bool,
    fallback_content: String,
}

impl PartialEq for Include {
    fn eq(&self, other: &Self) -> bool {
        self.raw_include_tag == other.raw_include_tag
    }
}

impl Eq for Include {}

impl Hash for Include {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw_include_tag.hash(state);
    }
}

impl Include {
    /// Builds an include from its raw tag, parsed attributes and inline
    /// fallback content. Attribute keys are compared case-insensitively.
    pub(crate) fn new(
        raw_include_tag: String,
        attributes: Vec<(String, String)>,
        fallback_content: Option<String>,
    ) -> Self {
        let mut attrs: HashMap<String, String> = attributes
            .into_iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value))
            .collect();
        let id = build_include_id(attrs.remove("id"), &raw_include_tag);
        let src = attrs.remove("src").filter(|src| !src.is_empty());
        let src_timeout = parse_timeout_millis(
            attrs.remove("src-timeout-millis"),
            "src-timeout-millis",
        );
        let fallback_src =
            attrs.remove("fallback-src").filter(|src| !src.is_empty());
        let fallback_src_timeout = parse_timeout_millis(
            attrs.remove("fallback-src-timeout-millis"),
            "fallback-src-timeout-millis",
        );
        let primary = attrs.remove("primary").is_some_and(|value| {
            value.is_empty() || value.eq_ignore_ascii_case("primary")
        });
        Self {
            raw_include_tag,
            id,
            src,
            src_timeout,
            fallback_src,
            fallback_src_timeout,
            primary,
            fallback_content: fallback_content.unwrap_or_default(),
        }
    }

    /// The raw tag text this include was parsed from
    pub fn raw_tag(&self) -> &str {
        &self.raw_include_tag
    }

    /// The sanitized `id` attribute, or a stable hash of the raw tag when
    /// no usable id was given
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The `src` attribute, if present and non-empty
    pub fn src(&self) -> Option<&str> {
        self.src.as_deref()
    }

    /// The `fallback-src` attribute, if present and non-empty
    pub fn fallback_src(&self) -> Option<&str> {
        self.fallback_src.as_deref()
    }

    /// Whether this include propagates its fragment's status and selected
    /// headers to the outer response
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// The inline fallback content, empty for self-closing tags
    pub fn fallback_content(&self) -> &str {
        &self.fallback_content
    }

    /// Resolves this include to the fragment replacing it.
    ///
    /// Never fails: when everything else is exhausted, the inline fallback
    /// content (possibly empty) forms the fragment.
    pub(crate) async fn resolve(
        &self,
        ctx: &ResolveContext,
    ) -> ResolvedInclude {
        let started = Instant::now();
        let mut errored_primary: Option<(Arc<Fragment>, FragmentSource)> =
            None;

        if let Some(src) = &self.src {
            if let Some((fragment, source)) = self
                .attempt_url(
                    src,
                    self.src_timeout,
                    UrlKind::Src,
                    ctx,
                    &mut errored_primary,
                )
                .await
            {
                return ResolvedInclude {
                    fragment,
                    source,
                    resolution_time: started.elapsed(),
                };
            }
        }

        if let Some(fallback_src) = &self.fallback_src {
            if let Some((fragment, source)) = self
                .attempt_url(
                    fallback_src,
                    self.fallback_src_timeout,
                    UrlKind::FallbackSrc,
                    ctx,
                    &mut errored_primary,
                )
                .await
            {
                return ResolvedInclude {
                    fragment,
                    source,
                    resolution_time: started.elapsed(),
                };
            }
        }

        // For a primary include the first errored response beats the
        // inline fallback content
        if let Some((fragment, source)) = errored_primary {
            return ResolvedInclude {
                fragment,
                source,
                resolution_time: started.elapsed(),
            };
        }

        ResolvedInclude {
            fragment: Arc::new(Fragment::local(self.fallback_content.clone())),
            source: FragmentSource::FallbackContent,
            resolution_time: started.elapsed(),
        }
    }

    async fn attempt_url(
        &self,
        url: &str,
        tag_timeout: Option<Duration>,
        kind: UrlKind,
        ctx: &ResolveContext,
        errored_primary: &mut Option<(Arc<Fragment>, FragmentSource)>,
    ) -> Option<(Arc<Fragment>, FragmentSource)> {
        let timeout =
            tag_timeout.unwrap_or(ctx.config.fragment_request_timeout);
        let cache_key = build_fragment_cache_key(
            url,
            &ctx.parent_headers,
            &ctx.config.cache_vary_by_request_headers,
        );

        if let Some(cached) = ctx.cache.get(&cache_key).await {
            if is_status_success(cached.status_code()) {
                return Some((cached, kind.cached()));
            }
            self.record_errored_primary(errored_primary, cached, kind.cached());
            return None;
        }

        let request = fetch_fragment(
            ctx.clone(),
            url.to_string(),
            cache_key.clone(),
            timeout,
        );
        let outcome = match tokio::time::timeout(
            timeout,
            ctx.inflight.run(&cache_key, request.boxed()),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(
                    "{}",
                    TransclusionError::RequestTimeout {
                        url: url.to_string(),
                        timeout,
                    }
                );
                return None;
            }
        };

        match outcome {
            AttemptOutcome::Success(fragment) => {
                Some((fragment, kind.remote()))
            }
            AttemptOutcome::ErrorStatus(fragment) => {
                self.record_errored_primary(
                    errored_primary,
                    fragment,
                    kind.remote(),
                );
                None
            }
            AttemptOutcome::Failed => None,
        }
    }

    fn record_errored_primary(
        &self,
        slot: &mut Option<(Arc<Fragment>, FragmentSource)>,
        fragment: Arc<Fragment>,
        source: FragmentSource,
    ) {
        if self.primary && slot.is_none() {
            *slot = Some((fragment, source));
        }
    }
}

/// A fragment together with how and how fast it was obtained
pub(crate) struct ResolvedInclude {
    pub(crate) fragment: Arc<Fragment>,
    pub(crate) source: FragmentSource,
    pub(crate) resolution_time: Duration,
}

/// Everything a resolution task needs, cloneable into spawned tasks
#[derive(Clone)]
pub(crate) struct ResolveContext {
    pub(crate) http_client: reqwest::Client,
    /// Parent request headers filtered by the forwarding allow-list
    pub(crate) forward_headers: HeaderMap,
    /// Unfiltered parent request headers, for vary-by cache keys
    pub(crate) parent_headers: Arc<HeaderMap>,
    pub(crate) cache: FragmentCache,
    pub(crate) inflight: Arc<SingleFlight>,
    pub(crate) config: Arc<AbleronConfig>,
}

#[derive(Clone, Copy)]
enum UrlKind {
    Src,
    FallbackSrc,
}

impl UrlKind {
    fn remote(self) -> FragmentSource {
        match self {
            Self::Src => FragmentSource::RemoteSrc,
            Self::FallbackSrc => FragmentSource::RemoteFallbackSrc,
        }
    }

    fn cached(self) -> FragmentSource {
        match self {
            Self::Src => FragmentSource::CachedSrc,
            Self::FallbackSrc => FragmentSource::CachedFallbackSrc,
        }
    }
}

/// Performs the HTTP GET for a fragment URL, builds the fragment and
/// stores it in the cache when its status and headers permit
async fn fetch_fragment(
    ctx: ResolveContext,
    url: String,
    cache_key: String,
    timeout: Duration,
) -> AttemptOutcome {
    let parsed_url = match Url::parse(&url) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!("unable to resolve fragment with invalid URL '{url}': {err}");
            return AttemptOutcome::Failed;
        }
    };

    let response = match request_fragment(
        &ctx.http_client,
        parsed_url.clone(),
        &ctx.forward_headers,
        timeout,
    )
    .await
    {
        Ok(response) => response,
        Err(err) => {
            debug!("unable to load fragment '{url}': {err}");
            return AttemptOutcome::Failed;
        }
    };

    let status = response.status().as_u16();
    let response_headers = response.headers().clone();
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(err) => {
            debug!("unable to read body of fragment '{url}': {err}");
            return AttemptOutcome::Failed;
        }
    };

    let content = decode_body(&body, &response_headers);
    let headers_to_pass = filter_response_headers(
        &response_headers,
        &ctx.config.primary_fragment_response_headers_to_pass,
    );

    if !is_status_cacheable(status) {
        debug!("fragment '{url}' responded with non-cacheable status {status}");
        return AttemptOutcome::ErrorStatus(Arc::new(Fragment::remote(
            parsed_url,
            status,
            content,
            UNIX_EPOCH,
            headers_to_pass,
        )));
    }

    let fragment = Arc::new(Fragment::remote(
        parsed_url,
        status,
        content,
        compute_expiration(&response_headers),
        headers_to_pass,
    ));
    let refresher = ctx
        .config
        .cache_auto_refresh_enabled
        .then(|| build_refresher(ctx.clone(), url, timeout));
    ctx.cache.put(&cache_key, Arc::clone(&fragment), refresher).await;

    if is_status_success(status) {
        AttemptOutcome::Success(fragment)
    } else {
        AttemptOutcome::ErrorStatus(fragment)
    }
}

async fn request_fragment(
    client: &reqwest::Client,
    url: Url,
    forward_headers: &HeaderMap,
    timeout: Duration,
) -> crate::Result<reqwest::Response> {
    let response = client
        .get(url)
        .headers(forward_headers.clone())
        .header(ACCEPT_ENCODING, "gzip")
        .timeout(timeout)
        .send()
        .await?;
    Ok(response)
}

/// Builds the producer used by the cache to re-fetch a fragment before it
/// expires. The refreshed fragment is not cached here; the refresh loop
/// decides based on its cacheability.
fn build_refresher(
    ctx: ResolveContext,
    url: String,
    timeout: Duration,
) -> FragmentRefreshFn {
    Arc::new(move || {
        let ctx = ctx.clone();
        let url = url.clone();
        async move {
            let parsed_url = Url::parse(&url).ok()?;
            let response = match request_fragment(
                &ctx.http_client,
                parsed_url.clone(),
                &ctx.forward_headers,
                timeout,
            )
            .await
            {
                Ok(response) => response,
                Err(err) => {
                    debug!("unable to refresh fragment '{url}': {err}");
                    return None;
                }
            };
            let status = response.status().as_u16();
            let response_headers = response.headers().clone();
            let body = response.bytes().await.ok()?;
            Some(Fragment::remote(
                parsed_url,
                status,
                decode_body(&body, &response_headers),
                compute_expiration(&response_headers),
                filter_response_headers(
                    &response_headers,
                    &ctx.config.primary_fragment_response_headers_to_pass,
                ),
            ))
        }
        .boxed()
    })
}

/// Retains the parent request headers matching the forwarding allow-list.
/// Matching is case-insensitive; multi-valued headers keep all values.
pub(crate) fn filter_request_headers(
    parent_headers: &HeaderMap,
    allow_list: &[&str],
) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in parent_headers {
        if allow_list
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(name.as_str()))
        {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

/// Retains the response headers matching the primary-propagation
/// allow-list, keys lowercased, value order preserved
pub(crate) fn filter_response_headers(
    response_headers: &HeaderMap,
    allow_list: &[String],
) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for name in allow_list {
        let Ok(header_name) =
            HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
        else {
            continue;
        };
        for value in response_headers.get_all(&header_name) {
            filtered.append(header_name.clone(), value.clone());
        }
    }
    filtered
}

fn parse_timeout_millis(
    value: Option<String>,
    attribute: &str,
) -> Option<Duration> {
    let value = value?;
    match value.parse::<u64>() {
        Ok(millis) => Some(Duration::from_millis(millis)),
        Err(_) => {
            warn!("ignoring invalid {attribute} '{value}'");
            None
        }
    }
}

fn build_include_id(
    id_attribute: Option<String>,
    raw_include_tag: &str,
) -> String {
    id_attribute
        .map(|id| {
            id.chars()
                .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
                .collect::<String>()
        })
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| {
            format!("{:x}", fnv1a32(raw_include_tag.as_bytes()))
        })
}

/// 32-bit FNV-1a, stable across platforms and releases
fn fnv1a32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5_u32, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(0x0100_0193)
    })
}
