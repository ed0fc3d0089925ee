use std::time::Duration;

/// Request headers forwarded to fragment origins unless overridden via
/// [`AbleronConfig::fragment_request_headers_to_pass`].
pub const DEFAULT_FRAGMENT_REQUEST_HEADERS_TO_PASS: &[&str] = &[
    "Accept-Language",
    "Correlation-ID",
    "Forwarded",
    "Referer",
    "User-Agent",
    "X-Correlation-ID",
    "X-Forwarded-For",
    "X-Forwarded-Proto",
    "X-Forwarded-Host",
    "X-Real-IP",
    "X-Request-ID",
];

/// Response headers of a primary fragment propagated to the outer response
/// unless overridden via
/// [`AbleronConfig::primary_fragment_response_headers_to_pass`].
pub const DEFAULT_PRIMARY_FRAGMENT_RESPONSE_HEADERS_TO_PASS: &[&str] =
    &["Content-Language", "Location", "Refresh"];

/// Configuration of the transclusion engine.
///
/// Plain struct with public fields, intended to be used with struct update
/// syntax:
///
/// ```
/// use ableron::AbleronConfig;
/// use std::time::Duration;
///
/// let config = AbleronConfig {
///     fragment_request_timeout: Duration::from_secs(5),
///     cache_auto_refresh_enabled: true,
///     ..Default::default()
/// };
/// assert!(config.enabled);
/// ```
#[derive(Debug, Clone)]
pub struct AbleronConfig {
    /// Whether the engine is enabled. When `false`, content is returned
    /// unchanged with zero processed includes.
    pub enabled: bool,
    /// Global per-fetch deadline applied to fragment requests that carry no
    /// tag-specific timeout
    pub fragment_request_timeout: Duration,
    /// Case-insensitive allow-list of request headers forwarded to fragment
    /// origins
    pub fragment_request_headers_to_pass: Vec<String>,
    /// Extends [`Self::fragment_request_headers_to_pass`] without replacing
    /// the defaults
    pub fragment_additional_request_headers_to_pass: Vec<String>,
    /// Response headers propagated from a primary fragment to the outer
    /// response
    pub primary_fragment_response_headers_to_pass: Vec<String>,
    /// Weight budget of the fragment cache in bytes. An entry weighs its
    /// cache key length plus its body length.
    pub cache_max_size_in_bytes: u64,
    /// Request headers whose values become part of the fragment cache key
    pub cache_vary_by_request_headers: Vec<String>,
    /// Whether cached fragments are proactively refreshed before they expire
    pub cache_auto_refresh_enabled: bool,
    /// How often a failed refresh of a cached fragment is retried before
    /// giving up
    pub cache_auto_refresh_max_attempts: u32,
    /// How often a fragment that nobody reads is refreshed before refreshing
    /// stops until the next read
    pub cache_auto_refresh_inactive_fragments_max_refreshs: u32,
    /// Whether resolution stats are appended to the composed content as an
    /// HTML comment
    pub stats_append_to_content: bool,
    /// Whether fragment URLs are exposed in the appended stats
    pub stats_expose_fragment_url: bool,
}

impl Default for AbleronConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fragment_request_timeout: Duration::from_secs(3),
            fragment_request_headers_to_pass:
                DEFAULT_FRAGMENT_REQUEST_HEADERS_TO_PASS
                    .iter()
                    .map(|h| (*h).to_string())
                    .collect(),
            fragment_additional_request_headers_to_pass: Vec::new(),
            primary_fragment_response_headers_to_pass:
                DEFAULT_PRIMARY_FRAGMENT_RESPONSE_HEADERS_TO_PASS
                    .iter()
                    .map(|h| (*h).to_string())
                    .collect(),
            cache_max_size_in_bytes: 1024 * 1024 * 10,
            cache_vary_by_request_headers: Vec::new(),
            cache_auto_refresh_enabled: false,
            cache_auto_refresh_max_attempts: 3,
            cache_auto_refresh_inactive_fragments_max_refreshs: 2,
            stats_append_to_content: false,
            stats_expose_fragment_url: false,
        }
    }
}

impl AbleronConfig {
    /// Returns the union of the configured request header allow-lists
    pub(crate) fn request_headers_to_pass(&self) -> Vec<&str> {
        self.fragment_request_headers_to_pass
            .iter()
            .chain(self.fragment_additional_request_headers_to_pass.iter())
            .map(String::as_str)
            .collect()
    }
}
