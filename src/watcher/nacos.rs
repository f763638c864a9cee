//! HTTP client for the Nacos configuration store.

use crate::config::NacosConfig;
use crate::core::ConfigSource;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("request to configuration store failed: {0}")]
    Transport(String),
    #[error("configuration store answered HTTP {0}")]
    Status(u16),
}

/// Fetches one config entry (`dataId` + `group`, optionally scoped to a
/// tenant) with a plain GET.
#[derive(Debug, Clone)]
pub struct NacosClient {
    client: reqwest::Client,
    url: String,
    query: Vec<(&'static str, String)>,
}

impl NacosClient {
    pub fn new(config: &NacosConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .connect_timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let mut query = vec![("dataId", config.data_id.clone()), ("group", config.group.clone())];
        if let Some(tenant) = config.namespace.as_ref().filter(|t| !t.is_empty()) {
            query.push(("tenant", tenant.clone()));
        }
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            query.push(("username", username.clone()));
            query.push(("password", password.clone()));
        }

        Ok(Self {
            client,
            url: format!("{}{}", config.server_addr.trim_end_matches('/'), config.path),
            query,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ConfigSource for NacosClient {
    async fn fetch(&self) -> Result<String, FetchError> {
        trace!(url = %self.url, "Fetching remote configuration");
        let response = self
            .client
            .get(&self.url)
            .query(&self.query)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        response
            .text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))
    }
}
