//! Span timing and attributes for saga steps and backend calls.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Attributes attached to saga and backend spans.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanAttributes {
    /// Owning saga.
    pub saga_id: Option<String>,
    /// Item or change correlation id.
    pub correlation_id: Option<String>,
    /// Content key of the item.
    pub content_key: Option<String>,
    /// Saga step.
    pub step_id: Option<String>,
    /// Backend handling the call.
    pub backend: Option<String>,
}

impl SpanAttributes {
    /// Creates empty attributes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the saga id.
    #[must_use]
    pub fn with_saga_id(mut self, id: impl Into<String>) -> Self {
        self.saga_id = Some(id.into());
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Sets the content key.
    #[must_use]
    pub fn with_content_key(mut self, key: impl Into<String>) -> Self {
        self.content_key = Some(key.into());
        self
    }

    /// Sets the step id.
    #[must_use]
    pub fn with_step_id(mut self, id: impl Into<String>) -> Self {
        self.step_id = Some(id.into());
        self
    }

    /// Sets the backend.
    #[must_use]
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    /// Flattens to dotted attribute names.
    #[must_use]
    pub fn to_attributes(&self) -> HashMap<String, String> {
        [
            ("saga.id", &self.saga_id),
            ("vdp.correlation_id", &self.correlation_id),
            ("vdp.content_key", &self.content_key),
            ("saga.step_id", &self.step_id),
            ("backend.name", &self.backend),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.as_ref().map(|v| (name.to_string(), v.clone())))
        .collect()
    }
}

/// Measures one span.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a new span timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Time since the span started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Finishes the span, logs it at debug level and returns its duration.
    pub fn finish(self) -> Duration {
        let elapsed = self.elapsed();
        tracing::debug!(
            span_name = %self.name,
            duration_ms = elapsed.as_secs_f64() * 1000.0,
            "Span finished"
        );
        elapsed
    }
}
