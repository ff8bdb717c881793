//! Orchestrator configuration.
//!
//! Every section has serde defaults, so a config file only needs the
//! backends:
//!
//! ```json
//! {
//!   "backends": [
//!     { "name": "t3-primary", "base_url": "http://10.0.0.5:8080" },
//!     { "name": "t3-secondary", "base_url": "http://10.0.0.6:8080" }
//!   ],
//!   "breaker": { "failure_threshold": 3 }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::consensus::ConsensusPolicy;
use crate::dlq::DlqConfig;
use crate::errors::{Result, VdpflowError};
use crate::observability::LogFormat;
use crate::pipeline::DEFAULT_TABLE;
use crate::resilience::{BackendConfig, BreakerConfig, RouterConfig};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Per-backend circuit breaker settings.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Probe and call timeouts.
    #[serde(default)]
    pub router: RouterConfig,
    /// Retry budget and backoff.
    #[serde(default)]
    pub dlq: DlqConfig,
    /// Change-approval thresholds.
    #[serde(default)]
    pub consensus: ConsensusPolicy,
    /// Extraction backends, in priority order.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    /// Warehouse table for loaded items.
    #[serde(default = "default_table")]
    pub table: String,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            router: RouterConfig::default(),
            dlq: DlqConfig::default(),
            consensus: ConsensusPolicy::default(),
            backends: Vec::new(),
            table: default_table(),
            log_format: LogFormat::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Parses and validates a JSON config.
    ///
    /// # Errors
    ///
    /// Returns [`VdpflowError::Config`] for malformed or invalid input.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| VdpflowError::Config(format!("invalid config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`VdpflowError::Io`] if the file cannot be read, otherwise as
    /// [`Self::from_json_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    /// Adds a backend.
    #[must_use]
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backends.push(backend);
        self
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`VdpflowError::Config`] naming the first violation.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(VdpflowError::Config(msg));

        if self.breaker.failure_threshold == 0 {
            return fail("breaker.failure_threshold must be > 0".to_string());
        }
        if self.breaker.cooldown_ms == 0 {
            return fail("breaker.cooldown_ms must be > 0".to_string());
        }
        if self.breaker.response_window == 0 {
            return fail("breaker.response_window must be > 0".to_string());
        }
        if self.router.probe_timeout_ms == 0 || self.router.call_timeout_ms == 0 {
            return fail("router timeouts must be > 0".to_string());
        }
        if self.dlq.backoff.max_delay_ms < self.dlq.backoff.base_delay_ms {
            return fail("dlq.backoff.max_delay_ms must be >= base_delay_ms".to_string());
        }
        if self.dlq.max_outstanding == 0 {
            return fail("dlq.max_outstanding must be > 0".to_string());
        }
        if self.table.trim().is_empty() {
            return fail("table must not be empty".to_string());
        }
        self.consensus
            .validate()
            .map_err(|err| VdpflowError::Config(err.to_string()))?;

        if self.backends.is_empty() {
            return fail("at least one backend is required".to_string());
        }
        let mut names = HashSet::new();
        for backend in &self.backends {
            if backend.name.trim().is_empty() {
                return fail("backend name must not be empty".to_string());
            }
            if !names.insert(backend.name.as_str()) {
                return fail(format!("duplicate backend name '{}'", backend.name));
            }
            if !(backend.base_url.starts_with("http://") || backend.base_url.starts_with("https://")) {
                return fail(format!(
                    "backend '{}' base_url must be an http(s) URL",
                    backend.name
                ));
            }
        }
        Ok(())
    }

    /// Builds an HTTP router over the configured backends, sharing breakers
    /// through `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`VdpflowError::Config`] if an HTTP client cannot be built.
    #[cfg(feature = "http")]
    pub fn http_router(
        &self,
        registry: &crate::resilience::BreakerRegistry,
    ) -> Result<crate::resilience::HealthCheckedRouter> {
        use std::sync::Arc;

        let backends = self
            .backends
            .iter()
            .map(|backend| {
                crate::resilience::HttpBackend::new(backend.clone())
                    .map(|b| Arc::new(b) as Arc<dyn crate::resilience::Backend>)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(crate::resilience::HealthCheckedRouter::from_registry(
            self.router.clone(),
            &self.breaker,
            registry,
            backends,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const MINIMAL: &str = r#"{
        "backends": [
            { "name": "t3-primary", "base_url": "http://10.0.0.5:8080" },
            { "name": "t3-secondary", "base_url": "http://10.0.0.6:8080/", "health_path": "/healthz" }
        ]
    }"#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = OrchestratorConfig::from_json_str(MINIMAL).unwrap();

        assert_eq!(config.breaker, BreakerConfig::default());
        assert_eq!(config.router.probe_timeout_ms, 1_500);
        assert_eq!(config.router.call_timeout_ms, 120_000);
        assert_eq!(config.dlq.max_retries, 3);
        assert_eq!(config.dlq.max_outstanding, 10_000);
        assert_eq!(config.table, "vdp_gold");
        assert_eq!(config.backends[1].health_url(), "http://10.0.0.6:8080/healthz");
        assert_eq!(config.backends[0].extract_path, "/api/vdp/extract");
    }

    #[test]
    fn test_overrides() {
        let config = OrchestratorConfig::from_json_str(
            r#"{
                "breaker": { "failure_threshold": 3, "cooldown_ms": 5000 },
                "dlq": { "max_retries": 1, "backoff": { "base_delay_ms": 250 } },
                "consensus": { "proceed_threshold": 0.9, "weights": { "implementer": 2.0 } },
                "log_format": "json",
                "backends": [{ "name": "only", "base_url": "https://vdp.internal" }]
            }"#,
        )
        .unwrap();

        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.response_window, 100);
        assert_eq!(config.dlq.backoff.base_delay_ms, 250);
        assert_eq!(config.dlq.backoff.max_delay_ms, 300_000);
        assert_eq!(config.consensus.modify_threshold, 0.60);
        assert_eq!(
            config.consensus.weight(crate::consensus::AgentRole::Implementer),
            2.0
        );
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_validation_failures() {
        let base = || OrchestratorConfig::default().with_backend(BackendConfig::new("a", "http://a"));
        assert!(base().validate().is_ok());

        assert!(OrchestratorConfig::default().validate().is_err());

        let mut zero_threshold = base();
        zero_threshold.breaker.failure_threshold = 0;
        assert!(zero_threshold.validate().is_err());

        let mut zero_outstanding = base();
        zero_outstanding.dlq.max_outstanding = 0;
        assert!(zero_outstanding.validate().is_err());

        let mut zero_timeout = base();
        zero_timeout.router.probe_timeout_ms = 0;
        assert!(zero_timeout.validate().is_err());

        let mut thresholds = base();
        thresholds.consensus = ConsensusPolicy::default().with_thresholds(0.5, 0.8);
        assert!(thresholds.validate().is_err());

        let duplicate = base().with_backend(BackendConfig::new("a", "http://b"));
        let err = duplicate.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate backend name 'a'"));

        let bad_url = OrchestratorConfig::default().with_backend(BackendConfig::new("a", "ftp://a"));
        assert!(bad_url.validate().is_err());
    }

    #[test]
    fn test_from_file() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(MINIMAL.as_bytes())?;

        let config = OrchestratorConfig::from_file(file.path())?;
        assert_eq!(config.backends.len(), 2);

        assert!(matches!(
            OrchestratorConfig::from_file("/nonexistent/vdpflow.json"),
            Err(VdpflowError::Io(_))
        ));
        Ok(())
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        assert!(matches!(
            OrchestratorConfig::from_json_str("{ not json"),
            Err(VdpflowError::Config(_))
        ));
    }

    #[cfg(feature = "http")]
    #[test]
    fn test_http_router_uses_configured_order() {
        let config = OrchestratorConfig::from_json_str(MINIMAL).unwrap();
        let registry = crate::resilience::BreakerRegistry::new();

        let router = config.http_router(&registry).unwrap();

        assert_eq!(router.backend_names(), vec!["t3-primary", "t3-secondary"]);
        assert_eq!(registry.len(), 2);
    }
}
