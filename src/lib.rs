#![forbid(unsafe_code, future_incompatible)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    nonstandard_style,
    unused_qualifications,
    unused_import_braces,
    unused_extern_crates,
    trivial_casts,
    trivial_numeric_casts
)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! Server-side UI composition via transclusion of HTML fragments.
//!
//! A page body is scanned for `<ableron-include>` tags, each referenced
//! fragment is fetched concurrently from its origin, and the tags are
//! replaced with the fetched content. The composed document comes back
//! together with the metadata needed to finish the outer HTTP response:
//! a derived `Cache-Control` value and, for primary includes, the status
//! code and selected headers of the fragment response.
//!
//! ## Include tags
//!
//! ```html
//! <ableron-include src="https://fragments.example/header" />
//! <ableron-include src="https://fragments.example/cart"
//!                  fallback-src="https://fallback.example/cart"
//!                  src-timeout-millis="800">Your cart</ableron-include>
//! ```
//!
//! Resolution precedence per include: `src`, then `fallback-src`, then the
//! inline fallback content, then an empty body. An include marked
//! `primary` additionally propagates its response status and selected
//! headers to the outer response. This includes error responses, so an
//! origin's 503 page wins over the inline fallback.
//!
//! ## Basic usage
//!
//! ```no_run
//! use ableron::{AbleronConfig, TransclusionProcessor};
//! use http::HeaderMap;
//!
//! #[tokio::main]
//! async fn main() -> ableron::Result<()> {
//!     let processor =
//!         TransclusionProcessor::new(AbleronConfig::default())?;
//!
//!     let result = processor
//!         .resolve_includes(
//!             "<html><ableron-include src=\"https://fragments.example/nav\">\
//!              <nav>fallback</nav></ableron-include></html>",
//!             &HeaderMap::new(),
//!         )
//!         .await;
//!
//!     // The composed page plus the caching metadata for the outer response
//!     let cache_control = result.cache_control_header_value(None);
//!     let status = result.status_code_override().unwrap_or(200);
//!     println!("{status} {cache_control} {}", result.content());
//!     Ok(())
//! }
//! ```
//!
//! ## Fragment caching
//!
//! Cacheable fragment responses (derived from `Cache-Control`, `Age`,
//! `Expires` and `Date`) are kept in a size-bounded in-memory cache and
//! served from there until they expire. With
//! [`AbleronConfig::cache_auto_refresh_enabled`], cached fragments are
//! re-fetched shortly before expiring, so hot includes never wait on the
//! origin.
//!
//! ```
//! use ableron::AbleronConfig;
//!
//! let config = AbleronConfig {
//!     cache_max_size_in_bytes: 50 * 1024 * 1024,
//!     cache_auto_refresh_enabled: true,
//!     ..Default::default()
//! };
//! ```
//!
//! Fragments are fetched via GET with `Accept-Encoding: gzip`, without
//! following redirects, and with the parent request headers from the
//! configured allow-list forwarded as-is. Nested includes inside fetched
//! fragments are deliberately not resolved.

mod cache;
mod config;
mod error;
mod fragment;
mod http_util;
mod include;
mod processor;
mod result;
mod scanner;
mod stats;

pub use cache::{FragmentCache, FragmentRefreshFn};
pub use config::{
    AbleronConfig, DEFAULT_FRAGMENT_REQUEST_HEADERS_TO_PASS,
    DEFAULT_PRIMARY_FRAGMENT_RESPONSE_HEADERS_TO_PASS,
};
pub use error::{Result, TransclusionError};
pub use fragment::Fragment;
pub use include::{FragmentSource, Include};
pub use processor::TransclusionProcessor;
pub use result::TransclusionResult;
pub use stats::{CacheStats, CacheStatsSnapshot};
