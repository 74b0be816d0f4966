//! Error types for the loader-context cache.
//!
//! Cache operations return [`CacheResult<T>`]. Probe failures use their own
//! [`ProbeError`] type and never escape the cache: they are folded into
//! "assume changed" during construction and refresh.

use std::error::Error as StdError;
use std::time::Duration;
use thiserror::Error;

/// Boxed error produced by a host-supplied context factory.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors surfaced to callers of the cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The request was rejected before touching the cache.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The context factory failed; nothing was inserted for the key.
    #[error("failed to construct loader context for [{resources}]: {source}")]
    ConstructionFailed {
        resources: String,
        #[source]
        source: BoxError,
    },
}

impl CacheError {
    pub(crate) fn construction_failed(resources: &[url::Url], source: BoxError) -> Self {
        let resources = resources
            .iter()
            .map(url::Url::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        CacheError::ConstructionFailed { resources, source }
    }
}

/// Reasons a freshness probe could not produce a token.
///
/// Every variant means the same thing to the cache: the resource must be
/// assumed changed.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("metadata for {location} unavailable: {reason}")]
    Unavailable { location: String, reason: String },

    #[error("metadata probe for {location} timed out after {timeout:?}")]
    Timeout { location: String, timeout: Duration },

    #[error("metadata probe for {location} returned HTTP {status}")]
    Status { location: String, status: u16 },

    #[error("no metadata probe available for scheme '{scheme}' ({location})")]
    UnsupportedScheme { location: String, scheme: String },
}

impl ProbeError {
    pub(crate) fn unavailable(location: &url::Url, reason: impl ToString) -> Self {
        ProbeError::Unavailable {
            location: location.to_string(),
            reason: reason.to_string(),
        }
    }

    /// The location the failed probe was aimed at.
    pub fn location(&self) -> &str {
        match self {
            ProbeError::Unavailable { location, .. }
            | ProbeError::Timeout { location, .. }
            | ProbeError::Status { location, .. }
            | ProbeError::UnsupportedScheme { location, .. } => location,
        }
    }
}
