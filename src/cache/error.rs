use std::sync::Arc;

use thiserror::Error;

use super::keys::{Category, ResourceKey};

/// Failure reported by a remote fetch function.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("`{url}` answered with status {status}")]
    Status { status: u16, url: String },
    #[error("failed to decode response payload: {0}")]
    Decode(String),
    #[error("resource unavailable: {0}")]
    Unavailable(String),
}

impl FetchError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The category has no freshness policy. Programmer error.
    #[error("no cache policy configured for category `{0}`")]
    UnknownCategory(Category),
    #[error("unknown category token `{0}`")]
    UnknownCategoryToken(String),
    #[error("invalid key pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    /// Fetch failed with no cached fallback. Every reader sharing the
    /// in-flight request observes the same source error.
    #[error("failed to fetch `{key}`")]
    Fetch {
        key: ResourceKey,
        #[source]
        source: Arc<FetchError>,
    },
}
