//! HTTP extraction backend over `reqwest`.

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::router::{Backend, BackendConfig, ExtractionRequest};
use crate::errors::{Result, VdpflowError};

/// An extraction backend reached over HTTP.
///
/// Timeouts are enforced by the router, so the client itself is built
/// without one.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    config: BackendConfig,
}

impl HttpBackend {
    /// Creates a backend with a fresh client.
    ///
    /// # Errors
    ///
    /// Returns [`VdpflowError::Config`] if the client cannot be built.
    pub fn new(config: BackendConfig) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| VdpflowError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self::with_client(config, client))
    }

    /// Creates a backend sharing an existing client.
    #[must_use]
    pub fn with_client(config: BackendConfig, client: Client) -> Self {
        Self { client, config }
    }

    /// Returns the backend configuration.
    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn map_send_error(&self, err: &reqwest::Error) -> VdpflowError {
        if err.is_timeout() {
            VdpflowError::transient(format!("{}: request timeout", self.config.name))
        } else if err.is_connect() {
            VdpflowError::transient(format!("{}: connection failed: {err}", self.config.name))
        } else {
            VdpflowError::backend(&self.config.name, err.to_string())
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn health_probe(&self) -> Result<()> {
        let url = self.config.health_url();
        debug!(backend = %self.config.name, %url, "Probing backend");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_send_error(&e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(VdpflowError::backend(
                &self.config.name,
                format!("health probe returned HTTP {}", response.status()),
            ))
        }
    }

    async fn call(&self, request: &ExtractionRequest) -> Result<serde_json::Value> {
        let url = self.config.extract_url();
        debug!(backend = %self.config.name, %url, source_uri = %request.source_uri, "Calling backend");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| self.map_send_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VdpflowError::backend(
                &self.config.name,
                format!(
                    "HTTP {status}: {}",
                    body.chars().take(200).collect::<String>()
                ),
            ));
        }

        response.json::<serde_json::Value>().await.map_err(|e| {
            VdpflowError::backend(&self.config.name, format!("Failed to parse response: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureKind;

    #[tokio::test]
    async fn test_unreachable_backend_is_transient() {
        // Nothing listens on the discard port.
        let client = Client::builder().no_proxy().build().unwrap();
        let backend = HttpBackend::with_client(BackendConfig::new("local", "http://127.0.0.1:9"), client);

        let err = backend.health_probe().await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Transient);
    }

    #[test]
    fn test_name_comes_from_config() {
        let backend = HttpBackend::new(BackendConfig::new("t3-secondary", "http://localhost:8083")).unwrap();
        assert_eq!(backend.name(), "t3-secondary");
        assert_eq!(backend.config().health_path, "/health");
    }
}
