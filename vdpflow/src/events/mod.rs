//! Event sink system for the outbox.
//!
//! Publishers receive an `Arc<dyn EventSink>` explicitly; there is no
//! process-wide sink.

mod channel;
mod sink;

pub use channel::{ChannelEventSink, OutboxMetrics};
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use std::sync::Arc;

/// Returns a sink that discards everything.
#[must_use]
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpEventSink)
}
