//! Health-checked router across redundant extraction backends.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::breaker::{BreakerConfig, BreakerRegistry, CircuitBreaker};
use crate::cancellation::{run_time_boxed, CancellationToken};
use crate::errors::{Result, VdpflowError};
use crate::observability::SpanTimer;

/// Metadata sent with every extraction request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionMetadata {
    /// Source platform (e.g. "youtube").
    pub platform: String,
    /// Content language.
    #[serde(default)]
    pub language: String,
    /// Public URL of the content.
    #[serde(default)]
    pub source_url: String,
}

/// Body of a backend extraction call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    /// Location of the fetched media.
    pub source_uri: String,
    /// Request metadata.
    pub metadata: ExtractionMetadata,
}

impl ExtractionRequest {
    /// Creates a request for `source_uri` on `platform`.
    #[must_use]
    pub fn new(source_uri: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            source_uri: source_uri.into(),
            metadata: ExtractionMetadata {
                platform: platform.into(),
                ..ExtractionMetadata::default()
            },
        }
    }

    /// Sets the language.
    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.metadata.language = language.into();
        self
    }

    /// Sets the public source URL.
    #[must_use]
    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.metadata.source_url = url.into();
        self
    }
}

/// One extraction backend behind the router.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable backend name, also the breaker key.
    fn name(&self) -> &str;

    /// Cheap liveness check. `Ok` means the backend answered 2xx.
    async fn health_probe(&self) -> Result<()>;

    /// The extraction call itself.
    async fn call(&self, request: &ExtractionRequest) -> Result<serde_json::Value>;
}

/// Router timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Health probe timeout in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Primary call timeout in milliseconds.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_probe_timeout_ms() -> u64 {
    1_500
}

fn default_call_timeout_ms() -> u64 {
    120_000
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl RouterConfig {
    /// Sets the probe timeout.
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the call timeout.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Probe timeout as a duration.
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Call timeout as a duration.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Address of one HTTP extraction backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend name, unique within a router.
    pub name: String,
    /// Base URL, without a trailing slash.
    pub base_url: String,
    /// Health probe path.
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Extraction endpoint path.
    #[serde(default = "default_extract_path")]
    pub extract_path: String,
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_extract_path() -> String {
    "/api/vdp/extract".to_string()
}

impl BackendConfig {
    /// Creates a backend config with the default paths.
    #[must_use]
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            health_path: default_health_path(),
            extract_path: default_extract_path(),
        }
    }

    /// Full health probe URL.
    #[must_use]
    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.health_path)
    }

    /// Full extraction URL.
    #[must_use]
    pub fn extract_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.extract_path)
    }
}

/// A successful routed call.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedResponse {
    /// Backend that answered.
    pub backend: String,
    /// Parsed response body.
    pub body: serde_json::Value,
}

struct RouteEntry {
    backend: Arc<dyn Backend>,
    breaker: Arc<CircuitBreaker>,
}

/// Tries backends in priority order, each gated by its circuit breaker.
///
/// The first backend whose probe and call both succeed wins. Breakers come
/// from a shared [`BreakerRegistry`], so routers built from the same
/// registry see the same backend health.
pub struct HealthCheckedRouter {
    config: RouterConfig,
    entries: Vec<RouteEntry>,
}

impl std::fmt::Debug for HealthCheckedRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthCheckedRouter")
            .field("config", &self.config)
            .field("backends", &self.backend_names())
            .finish()
    }
}

impl HealthCheckedRouter {
    /// Creates a router with no backends.
    #[must_use]
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            entries: Vec::new(),
        }
    }

    /// Creates a router over `backends` (highest priority first), taking
    /// breakers from `registry`.
    #[must_use]
    pub fn from_registry(
        config: RouterConfig,
        breaker_config: &BreakerConfig,
        registry: &BreakerRegistry,
        backends: Vec<Arc<dyn Backend>>,
    ) -> Self {
        let mut router = Self::new(config);
        for backend in backends {
            let breaker = registry.get_or_create(backend.name(), breaker_config);
            router = router.with_backend(backend, breaker);
        }
        router
    }

    /// Appends a backend at the lowest priority.
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn Backend>, breaker: Arc<CircuitBreaker>) -> Self {
        self.entries.push(RouteEntry { backend, breaker });
        self
    }

    /// Backend names in priority order.
    #[must_use]
    pub fn backend_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| e.backend.name().to_string())
            .collect()
    }

    /// Returns the breaker guarding `name`.
    #[must_use]
    pub fn breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.entries
            .iter()
            .find(|e| e.backend.name() == name)
            .map(|e| e.breaker.clone())
    }

    /// Returns the router configuration.
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Routes one extraction request.
    ///
    /// # Errors
    ///
    /// Returns [`VdpflowError::BackendUnavailable`] once, after every
    /// backend was skipped or failed, and [`VdpflowError::Cancelled`] as
    /// soon as `token` fires.
    pub async fn route(
        &self,
        request: &ExtractionRequest,
        token: &CancellationToken,
    ) -> Result<RoutedResponse> {
        let mut attempted = Vec::with_capacity(self.entries.len());

        for entry in &self.entries {
            let name = entry.backend.name();
            attempted.push(name.to_string());

            if !entry.breaker.allow_request() {
                debug!(backend = %name, "Breaker open, skipping backend");
                continue;
            }

            let timer = SpanTimer::start(format!("{name}.health_probe"));
            let probe = run_time_boxed(
                "health probe",
                self.config.probe_timeout(),
                token,
                entry.backend.health_probe(),
            )
            .await;
            match probe {
                Ok(()) => {}
                Err(VdpflowError::Cancelled(reason)) => return Err(VdpflowError::Cancelled(reason)),
                Err(err) => {
                    warn!(backend = %name, error = %err, "Health probe failed");
                    entry.breaker.record_failure(timer.finish());
                    continue;
                }
            }

            let timer = SpanTimer::start(format!("{name}.call"));
            let call = run_time_boxed(
                "extraction call",
                self.config.call_timeout(),
                token,
                entry.backend.call(request),
            )
            .await;
            match call {
                Ok(body) => {
                    let elapsed = timer.finish();
                    entry.breaker.record_success(elapsed);
                    info!(backend = %name, elapsed = ?elapsed, "Extraction call succeeded");
                    return Ok(RoutedResponse {
                        backend: name.to_string(),
                        body,
                    });
                }
                Err(VdpflowError::Cancelled(reason)) => return Err(VdpflowError::Cancelled(reason)),
                Err(err) => {
                    warn!(backend = %name, error = %err, "Extraction call failed");
                    entry.breaker.record_failure(timer.finish());
                }
            }
        }

        warn!(attempted = ?attempted, "All backends unavailable");
        Err(VdpflowError::BackendUnavailable { attempted })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureKind;
    use crate::resilience::BreakerState;
    use crate::testing::ScriptedBackend;
    use pretty_assertions::assert_eq;

    fn router_over(backends: &[Arc<ScriptedBackend>], threshold: u32) -> HealthCheckedRouter {
        let registry = BreakerRegistry::new();
        HealthCheckedRouter::from_registry(
            RouterConfig::default()
                .with_probe_timeout(Duration::from_millis(50))
                .with_call_timeout(Duration::from_millis(200)),
            &BreakerConfig::new().with_failure_threshold(threshold),
            &registry,
            backends
                .iter()
                .map(|b| b.clone() as Arc<dyn Backend>)
                .collect(),
        )
    }

    fn request() -> ExtractionRequest {
        ExtractionRequest::new("gs://bucket/yt/abc.mp4", "youtube").with_language("ko")
    }

    #[tokio::test]
    async fn test_first_healthy_backend_wins() {
        let primary = Arc::new(ScriptedBackend::healthy("primary"));
        let secondary = Arc::new(ScriptedBackend::healthy("secondary"));
        let router = router_over(&[primary.clone(), secondary.clone()], 5);

        let response = router.route(&request(), &CancellationToken::new()).await.unwrap();

        assert_eq!(response.backend, "primary");
        assert_eq!(primary.call_count(), 1);
        assert_eq!(secondary.probe_count(), 0);
        assert_eq!(secondary.call_count(), 0);
    }

    #[tokio::test]
    async fn test_probe_failure_falls_through_to_second() {
        let primary = Arc::new(ScriptedBackend::healthy("primary").with_probe_failure());
        let secondary = Arc::new(ScriptedBackend::healthy("secondary"));
        let router = router_over(&[primary.clone(), secondary.clone()], 5);

        let response = router.route(&request(), &CancellationToken::new()).await.unwrap();

        assert_eq!(response.backend, "secondary");
        assert_eq!(primary.probe_count(), 1);
        assert_eq!(primary.call_count(), 0);
        assert_eq!(router.breaker("primary").unwrap().failures(), 1);
    }

    #[tokio::test]
    async fn test_all_backends_fail_single_error() {
        let primary = Arc::new(ScriptedBackend::healthy("primary").with_probe_failure());
        let secondary = Arc::new(ScriptedBackend::healthy("secondary").with_call_failure());
        let router = router_over(&[primary.clone(), secondary.clone()], 5);

        let err = router
            .route(&request(), &CancellationToken::new())
            .await
            .unwrap_err();

        match &err {
            VdpflowError::BackendUnavailable { attempted } => {
                assert_eq!(attempted, &vec!["primary".to_string(), "secondary".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.kind(), FailureKind::BackendUnavailable);
        assert!(!err.is_retryable());
        assert_eq!(secondary.call_count(), 1);
    }

    #[tokio::test]
    async fn test_open_breaker_skips_backend() {
        let primary = Arc::new(ScriptedBackend::healthy("primary").with_call_failure());
        let secondary = Arc::new(ScriptedBackend::healthy("secondary"));
        let router = router_over(&[primary.clone(), secondary.clone()], 1);

        router.route(&request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(router.breaker("primary").unwrap().state(), BreakerState::Open);

        router.route(&request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(primary.probe_count(), 1);
        assert_eq!(secondary.call_count(), 2);
    }

    #[tokio::test]
    async fn test_slow_call_times_out_and_counts_as_failure() {
        let primary = Arc::new(
            ScriptedBackend::healthy("primary").with_call_delay(Duration::from_secs(5)),
        );
        let secondary = Arc::new(ScriptedBackend::healthy("secondary"));
        let router = router_over(&[primary.clone(), secondary.clone()], 5);

        let response = router.route(&request(), &CancellationToken::new()).await.unwrap();

        assert_eq!(response.backend, "secondary");
        assert_eq!(router.breaker("primary").unwrap().failures(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_route_does_not_blame_backend() {
        let primary = Arc::new(ScriptedBackend::healthy("primary"));
        let router = router_over(&[primary.clone()], 5);
        let token = CancellationToken::new();
        token.cancel("shutdown");

        let err = router.route(&request(), &token).await.unwrap_err();

        assert!(matches!(err, VdpflowError::Cancelled(_)));
        assert_eq!(router.breaker("primary").unwrap().failures(), 0);
    }

    #[test]
    fn test_backend_urls() {
        let backend = BackendConfig::new("t3-primary", "http://localhost:8082/");
        assert_eq!(backend.health_url(), "http://localhost:8082/health");
        assert_eq!(backend.extract_url(), "http://localhost:8082/api/vdp/extract");
    }

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::to_value(request().with_source_url("https://youtu.be/abc")).unwrap();
        assert_eq!(json["source_uri"], "gs://bucket/yt/abc.mp4");
        assert_eq!(json["metadata"]["platform"], "youtube");
        assert_eq!(json["metadata"]["language"], "ko");
        assert_eq!(json["metadata"]["source_url"], "https://youtu.be/abc");
    }
}
