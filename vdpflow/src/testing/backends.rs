//! Programmable extraction backends.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::errors::{Result, VdpflowError};
use crate::resilience::{Backend, ExtractionRequest};

/// A backend whose probe and call outcomes are scripted.
#[derive(Debug)]
pub struct ScriptedBackend {
    name: String,
    probe_ok: AtomicBool,
    failing_calls: AtomicUsize,
    call_delay: Mutex<Option<Duration>>,
    response: Mutex<serde_json::Value>,
    probes: AtomicUsize,
    calls: AtomicUsize,
    requests: Mutex<Vec<ExtractionRequest>>,
}

impl ScriptedBackend {
    /// A backend that passes probes and answers every call.
    #[must_use]
    pub fn healthy(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            response: Mutex::new(serde_json::json!({ "backend": name, "scenes": [] })),
            name,
            probe_ok: AtomicBool::new(true),
            failing_calls: AtomicUsize::new(0),
            call_delay: Mutex::new(None),
            probes: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Fails every health probe.
    #[must_use]
    pub fn with_probe_failure(self) -> Self {
        self.probe_ok.store(false, Ordering::SeqCst);
        self
    }

    /// Fails every call.
    #[must_use]
    pub fn with_call_failure(self) -> Self {
        self.failing_calls.store(usize::MAX, Ordering::SeqCst);
        self
    }

    /// Fails the next `n` calls, then succeeds.
    #[must_use]
    pub fn with_failing_calls(self, n: usize) -> Self {
        self.failing_calls.store(n, Ordering::SeqCst);
        self
    }

    /// Delays every call.
    #[must_use]
    pub fn with_call_delay(self, delay: Duration) -> Self {
        *self.call_delay.lock() = Some(delay);
        self
    }

    /// Sets the call response.
    #[must_use]
    pub fn with_response(self, response: serde_json::Value) -> Self {
        *self.response.lock() = response;
        self
    }

    /// Switches probe health at runtime.
    pub fn set_healthy(&self, healthy: bool) {
        self.probe_ok.store(healthy, Ordering::SeqCst);
    }

    /// Health probes received.
    #[must_use]
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Calls received.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received, oldest first.
    #[must_use]
    pub fn requests(&self) -> Vec<ExtractionRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_probe(&self) -> Result<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.probe_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(VdpflowError::backend(&self.name, "health probe returned HTTP 503"))
        }
    }

    async fn call(&self, request: &ExtractionRequest) -> Result<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        let delay = *self.call_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failing_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if failing {
            return Err(VdpflowError::transient(format!("{}: connection reset", self.name)));
        }
        Ok(self.response.lock().clone())
    }
}
