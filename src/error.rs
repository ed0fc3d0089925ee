use std::time::Duration;

use thiserror::Error;

/// A `Result` typedef to use with the [`TransclusionError`] type
pub type Result<T> = std::result::Result<T, TransclusionError>;

/// Errors raised while constructing the engine or fetching fragments.
///
/// None of these cross [`resolve_includes`]: a failed fragment fetch is
/// absorbed into the include's fallback precedence and only logged.
///
/// [`resolve_includes`]: crate::TransclusionProcessor::resolve_includes
#[derive(Error, Debug)]
pub enum TransclusionError {
    /// Transport-level error from the HTTP client
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    /// A fragment request exceeded its per-attempt deadline
    #[error("fragment request to '{url}' timed out after {timeout:?}")]
    RequestTimeout {
        /// The fragment URL the request was sent to
        url: String,
        /// The effective deadline that was exceeded
        timeout: Duration,
    },
    /// A concurrent include resolution task died unexpectedly
    #[error("include resolution task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}
