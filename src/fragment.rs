use std::time::{SystemTime, UNIX_EPOCH};

use http::HeaderMap;
use url::Url;

use crate::http_util;

/// The fetched or locally synthesized content used to replace an include.
///
/// A fragment without a URL was built locally from fallback content; its
/// status is 200 by construction. Fragments are immutable once built, so
/// the cache hands out shared references to the same instance.
#[derive(Debug, Clone)]
pub struct Fragment {
    url: Option<Url>,
    status_code: u16,
    content: String,
    expiration: SystemTime,
    response_headers: HeaderMap,
}

impl Fragment {
    /// Builds a fragment from a remote response
    pub(crate) fn remote(
        url: Url,
        status_code: u16,
        content: String,
        expiration: SystemTime,
        response_headers: HeaderMap,
    ) -> Self {
        Self { url: Some(url), status_code, content, expiration, response_headers }
    }

    /// Builds a local, non-cacheable fragment from fallback content
    pub(crate) fn local(content: impl Into<String>) -> Self {
        Self::local_expiring(content, UNIX_EPOCH)
    }

    /// Builds a local fragment with an explicit expiration
    pub(crate) fn local_expiring(
        content: impl Into<String>,
        expiration: SystemTime,
    ) -> Self {
        Self {
            url: None,
            status_code: 200,
            content: content.into(),
            expiration,
            response_headers: HeaderMap::new(),
        }
    }

    /// The origin URL this fragment was fetched from, absent for locally
    /// built fragments
    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    /// HTTP status code of the fragment response, `200` for local fragments
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// The decoded fragment body
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Absolute expiration time; `UNIX_EPOCH` marks a non-cacheable or
    /// already expired fragment
    pub fn expiration(&self) -> SystemTime {
        self.expiration
    }

    /// Response headers retained for primary-include propagation, keys
    /// lowercased
    pub fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    /// Whether this fragment was built locally instead of fetched
    pub fn is_local(&self) -> bool {
        self.url.is_none()
    }

    /// Whether this fragment may enter the cache: cacheable status and an
    /// expiration that still lies in the future
    pub(crate) fn is_cacheable(&self) -> bool {
        http_util::is_status_cacheable(self.status_code)
            && self.expiration > SystemTime::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn local_fragment_defaults() {
        let fragment = Fragment::local("fallback");
        assert!(fragment.is_local());
        assert_eq!(fragment.status_code(), 200);
        assert_eq!(fragment.content(), "fallback");
        assert_eq!(fragment.expiration(), UNIX_EPOCH);
        assert!(fragment.response_headers().is_empty());
        assert!(!fragment.is_cacheable());
    }

    #[test]
    fn remote_fragment_cacheability() {
        let in_a_minute = SystemTime::now() + Duration::from_secs(60);
        let fragment = Fragment::remote(
            Url::parse("http://fragments.example/a").unwrap(),
            200,
            "body".to_string(),
            in_a_minute,
            HeaderMap::new(),
        );
        assert!(!fragment.is_local());
        assert!(fragment.is_cacheable());

        let errored = Fragment::remote(
            Url::parse("http://fragments.example/b").unwrap(),
            500,
            "oops".to_string(),
            in_a_minute,
            HeaderMap::new(),
        );
        assert!(!errored.is_cacheable());

        let expired = Fragment::remote(
            Url::parse("http://fragments.example/c").unwrap(),
            200,
            "body".to_string(),
            UNIX_EPOCH,
            HeaderMap::new(),
        );
        assert!(!expired.is_cacheable());
    }
}
