//! Remote fetch seam.

use async_trait::async_trait;
use serde_json::Value;

use super::error::FetchError;
use super::keys::ResourceKey;

/// Remote origin of cached resources.
///
/// Implementations own their timeout policy; the cache layer never cancels
/// a fetch once it has started.
#[async_trait]
pub trait ResourceSource: Send + Sync {
    async fn fetch(&self, key: &ResourceKey) -> Result<Value, FetchError>;

    /// Ask the backend to warm its own cache for an event.
    async fn warm_event(&self, event: &str) -> Result<(), FetchError> {
        let _ = event;
        Ok(())
    }
}
