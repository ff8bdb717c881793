//! Event sink trait and implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, Level};

use crate::core::{EventType, OutboxEvent};

/// Trait for sinks that receive outbox events.
///
/// Sagas, the pipeline state machine and the consensus gate publish
/// through this trait; nothing registers listeners on the publishers.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publishes an event, waiting for capacity if the sink is bounded.
    async fn publish(&self, event: OutboxEvent);

    /// Publishes an event without blocking.
    ///
    /// This method never fails. Events that cannot be accepted are
    /// counted or logged by the sink, not returned to the caller.
    fn try_publish(&self, event: OutboxEvent);
}

/// A no-op event sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn publish(&self, _event: OutboxEvent) {}

    fn try_publish(&self, _event: OutboxEvent) {}
}

/// An event sink that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a new logging event sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &OutboxEvent) {
        if self.level == Level::DEBUG {
            debug!(
                event_type = %event.event_type,
                correlation_id = %event.correlation_id,
                step_or_stage = %event.step_or_stage,
                saga_id = ?event.saga_id,
                detail = ?event.detail,
                "Event: {}", event.event_type
            );
        } else {
            info!(
                event_type = %event.event_type,
                correlation_id = %event.correlation_id,
                step_or_stage = %event.step_or_stage,
                saga_id = ?event.saga_id,
                detail = ?event.detail,
                "Event: {}", event.event_type
            );
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn publish(&self, event: OutboxEvent) {
        self.log_event(&event);
    }

    fn try_publish(&self, event: OutboxEvent) {
        self.log_event(&event);
    }
}

/// A collecting event sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<OutboxEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<OutboxEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events of one type, in publication order.
    #[must_use]
    pub fn events_of_type(&self, event_type: EventType) -> Vec<OutboxEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Returns the `step_or_stage` values of one event type, in order.
    #[must_use]
    pub fn names_of_type(&self, event_type: EventType) -> Vec<String> {
        self.events_of_type(event_type)
            .into_iter()
            .map(|e| e.step_or_stage)
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn publish(&self, event: OutboxEvent) {
        self.events.write().push(event);
    }

    fn try_publish(&self, event: OutboxEvent) {
        self.events.write().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PipelineStage;

    #[tokio::test]
    async fn test_noop_sink() {
        let sink = NoOpEventSink;
        sink.publish(OutboxEvent::stage_transition("c", PipelineStage::Ingest)).await;
        sink.try_publish(OutboxEvent::stage_transition("c", PipelineStage::Finalize));
    }

    #[tokio::test]
    async fn test_logging_sink() {
        let sink = LoggingEventSink::debug();
        sink.publish(OutboxEvent::step_completed("s", "c", "upload")).await;
        sink.try_publish(OutboxEvent::step_compensated("s", "c", "upload"));
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.publish(OutboxEvent::step_completed("s", "c", "one")).await;
        sink.try_publish(OutboxEvent::step_completed("s", "c", "two"));
        sink.try_publish(OutboxEvent::step_compensated("s", "c", "two"));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.names_of_type(EventType::StepCompleted), vec!["one", "two"]);
        assert_eq!(sink.events_of_type(EventType::StepCompensated).len(), 1);

        sink.clear();
        assert!(sink.is_empty());
    }
}
