//! The outcome of one transclusion pass: the composed content plus the
//! metadata the caller needs to finish the outer response.

use std::time::{Duration, SystemTime};

use http::HeaderMap;
use log::debug;

use crate::fragment::Fragment;
use crate::http_util;
use crate::include::{FragmentSource, Include};
use crate::stats::CacheStatsSnapshot;

/// Composed content plus derived caching headers, primary-include
/// propagation and resolution stats.
#[derive(Debug)]
pub struct TransclusionResult {
    content: String,
    content_expiration_time: Option<SystemTime>,
    has_primary_include: bool,
    status_code_override: Option<u16>,
    response_headers_to_pass: HeaderMap,
    processed_include_count: usize,
    processing_time: Duration,
    append_stats: bool,
    expose_fragment_url: bool,
    include_stats: Vec<IncludeStat>,
    cache_stats: Option<CacheStatsSnapshot>,
}

#[derive(Debug)]
struct IncludeStat {
    include_id: String,
    source: FragmentSource,
    time_millis: u128,
    url: Option<String>,
}

impl TransclusionResult {
    pub(crate) fn new(
        content: &str,
        append_stats: bool,
        expose_fragment_url: bool,
    ) -> Self {
        Self {
            content: content.to_string(),
            content_expiration_time: None,
            has_primary_include: false,
            status_code_override: None,
            response_headers_to_pass: HeaderMap::new(),
            processed_include_count: 0,
            processing_time: Duration::ZERO,
            append_stats,
            expose_fragment_url,
            include_stats: Vec::new(),
            cache_stats: None,
        }
    }

    /// Result for content that was not processed at all
    pub(crate) fn unchanged(content: &str) -> Self {
        Self::new(content, false, false)
    }

    /// The composed content
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Consumes the result, returning the composed content
    pub fn into_content(self) -> String {
        self.content
    }

    /// Number of unique includes processed
    pub fn processed_include_count(&self) -> usize {
        self.processed_include_count
    }

    /// Wall time the whole transclusion pass took
    pub fn processing_time(&self) -> Duration {
        self.processing_time
    }

    /// Whether a primary include was processed
    pub fn has_primary_include(&self) -> bool {
        self.has_primary_include
    }

    /// Status code of the first primary include in document order, to be
    /// used as the outer response status
    pub fn status_code_override(&self) -> Option<u16> {
        self.status_code_override
    }

    /// Response headers of the first primary include to be set on the
    /// outer response
    pub fn response_headers_to_pass(&self) -> &HeaderMap {
        &self.response_headers_to_pass
    }

    /// Earliest expiration among the resolved fragments, if any fragment
    /// carried one
    pub fn content_expiration_time(&self) -> Option<SystemTime> {
        self.content_expiration_time
    }

    /// Cache counters snapshot taken at the end of the transclusion pass
    pub fn cache_stats(&self) -> Option<CacheStatsSnapshot> {
        self.cache_stats
    }

    /// Derives the `Cache-Control` value of the outer response from the
    /// fragment expirations and the given page max age.
    ///
    /// The effective allowance is the minimum of the page max age and the
    /// remaining fragment TTL, each unlimited when absent. Without any
    /// finite source, or with an allowance of zero, the result is
    /// `no-store`.
    pub fn cache_control_header_value(
        &self,
        page_max_age: Option<Duration>,
    ) -> String {
        let now = SystemTime::now();
        let fragment_ttl = self.content_expiration_time.map(|expiration| {
            expiration.duration_since(now).unwrap_or(Duration::ZERO)
        });
        let allowance = match (fragment_ttl, page_max_age) {
            (Some(fragment), Some(page)) => Some(fragment.min(page)),
            (Some(fragment), None) => Some(fragment),
            (None, Some(page)) => Some(page),
            (None, None) => None,
        };
        match allowance {
            Some(allowance) if allowance.as_secs() > 0 => {
                format!("max-age={}", allowance.as_secs())
            }
            _ => "no-store".to_string(),
        }
    }

    /// Same as [`Self::cache_control_header_value`], with the page max age
    /// taken from the outer response's `Cache-Control: max-age` directive.
    /// One second is subtracted from the origin's max age as a safety
    /// margin.
    pub fn cache_control_header_value_from_response_headers(
        &self,
        response_headers: &HeaderMap,
    ) -> String {
        let page_max_age =
            http_util::cache_control_directive(response_headers, "max-age")
                .map(|seconds| Duration::from_secs(seconds.saturating_sub(1)));
        self.cache_control_header_value(page_max_age)
    }

    /// Splices the fragment into the content and folds its metadata into
    /// the result. Every occurrence of the raw tag text is replaced.
    pub(crate) fn add_resolved_include(
        &mut self,
        include: &Include,
        fragment: &Fragment,
        source: FragmentSource,
        resolution_time: Duration,
    ) {
        if include.is_primary() {
            if self.has_primary_include {
                debug!(
                    "include '{}' is primary, but the primary include of \
                     this page was already decided",
                    include.id()
                );
            } else {
                self.has_primary_include = true;
                self.status_code_override = Some(fragment.status_code());
                for (name, value) in fragment.response_headers() {
                    self.response_headers_to_pass
                        .append(name.clone(), value.clone());
                }
            }
        }
        self.track_content_expiration(fragment.expiration());
        self.content =
            self.content.replace(include.raw_tag(), fragment.content());
        self.processed_include_count += 1;
        if self.append_stats {
            self.include_stats.push(IncludeStat {
                include_id: include.id().to_string(),
                source,
                time_millis: resolution_time.as_millis(),
                url: fragment.url().map(|url| url.to_string()),
            });
        }
    }

    pub(crate) fn set_processing_time(&mut self, processing_time: Duration) {
        self.processing_time = processing_time;
    }

    pub(crate) fn set_cache_stats(&mut self, snapshot: CacheStatsSnapshot) {
        self.cache_stats = Some(snapshot);
    }

    /// Appends the stats comment to the content when configured
    pub(crate) fn finalize(&mut self) {
        if self.append_stats {
            let comment = self.build_stats_comment();
            self.content.push_str(&comment);
        }
    }

    fn track_content_expiration(&mut self, expiration: SystemTime) {
        match self.content_expiration_time {
            Some(current) if current <= expiration => {}
            _ => self.content_expiration_time = Some(expiration),
        }
    }

    fn build_stats_comment(&self) -> String {
        let mut comment = String::from("\n<!-- Ableron stats:\n");
        comment.push_str(&format!(
            "Processed {} include(s) in {}ms\n",
            self.processed_include_count,
            self.processing_time.as_millis()
        ));
        for stat in &self.include_stats {
            match &stat.url {
                Some(url) if self.expose_fragment_url => {
                    comment.push_str(&format!(
                        "Resolved include '{}' with {} in {}ms ({url})\n",
                        stat.include_id, stat.source, stat.time_millis
                    ));
                }
                _ => {
                    comment.push_str(&format!(
                        "Resolved include '{}' with {} in {}ms\n",
                        stat.include_id, stat.source, stat.time_millis
                    ));
                }
            }
        }
        if let Some(cache) = &self.cache_stats {
            comment.push_str(&format!(
                "Cache: {} items, {} hits, {} misses, {} successful \
                 refreshs, {} failed refreshs\n",
                cache.item_count,
                cache.hits,
                cache.misses,
                cache.refresh_successes,
                cache.refresh_failures
            ));
        }
        comment.push_str("-->");
        comment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn local_fragment(content: &str) -> Fragment {
        Fragment::local(content)
    }

    fn include(tag: &str, attributes: &[(&str, &str)]) -> Include {
        Include::new(
            tag.to_string(),
            attributes
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            None,
        )
    }

    #[test]
    fn all_tag_occurrences_are_replaced() {
        let tag = "<ableron-include src=\"http://h/a\"/>";
        let mut result =
            TransclusionResult::new(&format!("{tag}-{tag}"), false, false);
        result.add_resolved_include(
            &include(tag, &[]),
            &local_fragment("X"),
            FragmentSource::FallbackContent,
            Duration::ZERO,
        );
        assert_eq!(result.content(), "X-X");
        assert_eq!(result.processed_include_count(), 1);
    }

    #[test]
    fn first_primary_include_wins() {
        let mut result = TransclusionResult::new("<a/><b/>", false, false);
        let first = include("<a/>", &[("primary", "")]);
        let second = include("<b/>", &[("primary", "")]);

        let errored = Fragment::remote(
            url::Url::parse("http://h/a").unwrap(),
            503,
            "oops".to_string(),
            UNIX_EPOCH,
            HeaderMap::new(),
        );
        result.add_resolved_include(
            &first,
            &errored,
            FragmentSource::RemoteSrc,
            Duration::ZERO,
        );
        result.add_resolved_include(
            &second,
            &local_fragment("fine"),
            FragmentSource::FallbackContent,
            Duration::ZERO,
        );

        assert!(result.has_primary_include());
        assert_eq!(result.status_code_override(), Some(503));
    }

    #[test]
    fn primary_headers_are_propagated() {
        let mut headers = HeaderMap::new();
        headers.insert("location", "/target".parse().unwrap());
        let fragment = Fragment::remote(
            url::Url::parse("http://h/a").unwrap(),
            301,
            String::new(),
            UNIX_EPOCH,
            headers,
        );
        let mut result = TransclusionResult::new("<a/>", false, false);
        result.add_resolved_include(
            &include("<a/>", &[("primary", "")]),
            &fragment,
            FragmentSource::RemoteSrc,
            Duration::ZERO,
        );
        assert_eq!(
            result.response_headers_to_pass().get("location").unwrap(),
            "/target"
        );
    }

    #[test]
    fn cache_control_without_any_source_is_no_store() {
        let result = TransclusionResult::new("page", false, false);
        assert_eq!(result.cache_control_header_value(None), "no-store");
    }

    #[test]
    fn cache_control_uses_page_max_age_without_fragments() {
        let result = TransclusionResult::new("page", false, false);
        assert_eq!(
            result.cache_control_header_value(Some(Duration::from_secs(300))),
            "max-age=300"
        );
    }

    #[test]
    fn cache_control_is_limited_by_earliest_fragment_expiration() {
        let mut result = TransclusionResult::new("<a/>", false, false);
        let fragment = Fragment::remote(
            url::Url::parse("http://h/a").unwrap(),
            200,
            "A".to_string(),
            SystemTime::now() + Duration::from_secs(120),
            HeaderMap::new(),
        );
        result.add_resolved_include(
            &include("<a/>", &[]),
            &fragment,
            FragmentSource::RemoteSrc,
            Duration::ZERO,
        );

        let value =
            result.cache_control_header_value(Some(Duration::from_secs(600)));
        let seconds: u64 =
            value.strip_prefix("max-age=").unwrap().parse().unwrap();
        assert!((118..=120).contains(&seconds));
    }

    #[test]
    fn cache_control_is_monotone_under_stricter_fragments() {
        let mut result = TransclusionResult::new("<a/><b/>", false, false);
        let loose = Fragment::remote(
            url::Url::parse("http://h/a").unwrap(),
            200,
            "A".to_string(),
            SystemTime::now() + Duration::from_secs(600),
            HeaderMap::new(),
        );
        result.add_resolved_include(
            &include("<a/>", &[]),
            &loose,
            FragmentSource::RemoteSrc,
            Duration::ZERO,
        );
        let before = result.cache_control_header_value(None);

        let strict = Fragment::remote(
            url::Url::parse("http://h/b").unwrap(),
            200,
            "B".to_string(),
            SystemTime::now() + Duration::from_secs(60),
            HeaderMap::new(),
        );
        result.add_resolved_include(
            &include("<b/>", &[]),
            &strict,
            FragmentSource::RemoteSrc,
            Duration::ZERO,
        );
        let after = result.cache_control_header_value(None);

        let parse = |value: &str| -> u64 {
            value
                .strip_prefix("max-age=")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        };
        assert!(parse(&after) <= parse(&before));
    }

    #[test]
    fn epoch_expiration_forces_no_store() {
        let mut result = TransclusionResult::new("<a/>", false, false);
        result.add_resolved_include(
            &include("<a/>", &[]),
            &local_fragment("fb"),
            FragmentSource::FallbackContent,
            Duration::ZERO,
        );
        assert_eq!(
            result.cache_control_header_value(Some(Duration::from_secs(600))),
            "no-store"
        );
    }

    #[test]
    fn page_max_age_from_outer_headers_gets_a_safety_margin() {
        let mut headers = HeaderMap::new();
        headers.insert("cache-control", "max-age=600".parse().unwrap());
        let result = TransclusionResult::new("page", false, false);
        assert_eq!(
            result.cache_control_header_value_from_response_headers(&headers),
            "max-age=599"
        );
    }

    #[test]
    fn outer_headers_without_max_age_mean_no_store() {
        let result = TransclusionResult::new("page", false, false);
        assert_eq!(
            result.cache_control_header_value_from_response_headers(
                &HeaderMap::new()
            ),
            "no-store"
        );
    }

    #[test]
    fn stats_comment_lists_includes_and_cache() {
        let mut result = TransclusionResult::new("<a/>", true, false);
        result.add_resolved_include(
            &include("<a/>", &[("id", "nav")]),
            &local_fragment("fb"),
            FragmentSource::FallbackContent,
            Duration::from_millis(7),
        );
        result.set_cache_stats(CacheStatsSnapshot {
            item_count: 1,
            hits: 2,
            misses: 3,
            refresh_successes: 0,
            refresh_failures: 0,
        });
        result.set_processing_time(Duration::from_millis(12));
        result.finalize();

        let content = result.content();
        assert!(content.contains("<!-- Ableron stats:"));
        assert!(content.contains("Processed 1 include(s) in 12ms"));
        assert!(content
            .contains("Resolved include 'nav' with fallback content in 7ms"));
        assert!(content.contains("Cache: 1 items, 2 hits, 3 misses"));
        assert!(content.ends_with("-->"));
    }

    #[test]
    fn fragment_urls_are_only_exposed_when_configured() {
        let fragment = Fragment::remote(
            url::Url::parse("http://h/a").unwrap(),
            200,
            "A".to_string(),
            UNIX_EPOCH,
            HeaderMap::new(),
        );

        let mut hidden = TransclusionResult::new("<a/>", true, false);
        hidden.add_resolved_include(
            &include("<a/>", &[]),
            &fragment,
            FragmentSource::RemoteSrc,
            Duration::ZERO,
        );
        hidden.finalize();
        assert!(!hidden.content().contains("http://h/a"));

        let mut exposed = TransclusionResult::new("<a/>", true, true);
        exposed.add_resolved_include(
            &include("<a/>", &[]),
            &fragment,
            FragmentSource::RemoteSrc,
            Duration::ZERO,
        );
        exposed.finalize();
        assert!(exposed.content().contains("(http://h/a)"));
    }
}
