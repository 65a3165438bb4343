//! Storefront API client backing the cache.

use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde_json::Value;
use tracing::debug;

use crate::cache::{FetchError, ResourceKey, ResourceSource};
use crate::config::ApiSettings;

use super::error::InfraError;

const HEALTH_SEGMENT: &str = "health";

/// Fetches resources from `{base}/{category}/{params...}`.
#[derive(Clone, Debug)]
pub struct HttpSource {
    client: Client,
    base: Url,
}

impl HttpSource {
    pub fn new(settings: &ApiSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(settings.timeout)
            .build()?;
        Ok(Self::with_client(client, settings.base_url.clone()))
    }

    pub fn with_client(client: Client, base: Url) -> Self {
        Self { client, base }
    }

    pub fn user_agent() -> &'static str {
        concat!("fotocache/", env!("CARGO_PKG_VERSION"))
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// URL of a resource: the key's category token and params as path
    /// segments under the base.
    pub fn resource_url(&self, key: &ResourceKey) -> Result<Url, FetchError> {
        let params: Vec<String> = key.params().iter().map(ToString::to_string).collect();
        let mut segments = vec![key.category().token()];
        segments.extend(params.iter().map(String::as_str));
        self.url(&segments)
    }

    pub fn warm_url(&self, event: &str) -> Result<Url, FetchError> {
        self.url(&["cache", "warm", event])
    }

    pub fn health_url(&self) -> Result<Url, FetchError> {
        self.url(&[HEALTH_SEGMENT])
    }

    /// Whether the API answers its health endpoint with a success status.
    pub async fn check_health(&self) -> bool {
        let Ok(url) = self.health_url() else {
            return false;
        };
        match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(error = %err, "Health probe failed");
                false
            }
        }
    }

    fn url(&self, segments: &[&str]) -> Result<Url, FetchError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| {
                FetchError::unavailable(format!("`{}` cannot be a base URL", self.base))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn check_status(response: Response) -> Result<Response, FetchError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(FetchError::Status {
            status: status.as_u16(),
            url: response.url().to_string(),
        })
    }
}

#[async_trait]
impl ResourceSource for HttpSource {
    async fn fetch(&self, key: &ResourceKey) -> Result<Value, FetchError> {
        let url = self.resource_url(key)?;
        debug!(key = %key, url = %url, "Fetching resource");

        let response = Self::check_status(self.client.get(url).send().await?)?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| FetchError::Decode(err.to_string()))
    }

    async fn warm_event(&self, event: &str) -> Result<(), FetchError> {
        let url = self.warm_url(event)?;
        Self::check_status(self.client.post(url).send().await?)?;
        Ok(())
    }
}
