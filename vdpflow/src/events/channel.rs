//! Channel-backed outbox sink.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use super::EventSink;
use crate::core::OutboxEvent;

/// Delivery counters for a [`ChannelEventSink`].
#[derive(Debug, Default)]
pub struct OutboxMetrics {
    published: AtomicU64,
    dropped: AtomicU64,
}

impl OutboxMetrics {
    /// Records a delivered event.
    pub fn record_publish(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a dropped event.
    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of delivered events.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Returns the number of dropped events.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Returns the drop rate as a percentage.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn drop_rate(&self) -> f64 {
        let published = self.published();
        let dropped = self.dropped();
        let total = published + dropped;
        if total == 0 {
            0.0
        } else {
            (dropped as f64 / total as f64) * 100.0
        }
    }

    /// Converts metrics to a dictionary.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "published": self.published(),
            "dropped": self.dropped(),
            "drop_rate_percent": (self.drop_rate() * 100.0).round() / 100.0
        })
    }
}

/// The explicit outbox: a bounded channel of [`OutboxEvent`]s.
///
/// `publish` waits for capacity and preserves order. `try_publish` drops
/// the event when the channel is full or the receiver is gone, and counts
/// the drop.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::Sender<OutboxEvent>,
    metrics: Arc<OutboxMetrics>,
}

impl ChannelEventSink {
    /// Creates a sink and the receiver that downstream consumers drain.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutboxEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                metrics: Arc::new(OutboxMetrics::default()),
            },
            rx,
        )
    }

    /// Returns the delivery counters.
    #[must_use]
    pub fn metrics(&self) -> Arc<OutboxMetrics> {
        self.metrics.clone()
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn publish(&self, event: OutboxEvent) {
        match self.tx.send(event).await {
            Ok(()) => self.metrics.record_publish(),
            Err(err) => {
                self.metrics.record_drop();
                warn!(event_type = %err.0.event_type, "Outbox receiver closed, event dropped");
            }
        }
    }

    fn try_publish(&self, event: OutboxEvent) {
        match self.tx.try_send(event) {
            Ok(()) => self.metrics.record_publish(),
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.metrics.record_drop();
                warn!(event_type = %event.event_type, "Outbox full, event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                self.metrics.record_drop();
                warn!(event_type = %event.event_type, "Outbox receiver closed, event dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EventType, PipelineStage};

    #[tokio::test]
    async fn test_channel_preserves_order() {
        let (sink, mut rx) = ChannelEventSink::new(8);

        sink.publish(OutboxEvent::step_completed("s", "c", "a")).await;
        sink.publish(OutboxEvent::step_completed("s", "c", "b")).await;
        sink.try_publish(OutboxEvent::step_compensated("s", "c", "b"));

        assert_eq!(rx.recv().await.unwrap().step_or_stage, "a");
        assert_eq!(rx.recv().await.unwrap().step_or_stage, "b");
        assert_eq!(rx.recv().await.unwrap().event_type, EventType::StepCompensated);
        assert_eq!(sink.metrics().published(), 3);
    }

    #[tokio::test]
    async fn test_try_publish_drops_when_full() {
        let (sink, _rx) = ChannelEventSink::new(1);

        sink.try_publish(OutboxEvent::stage_transition("c", PipelineStage::Ingest));
        sink.try_publish(OutboxEvent::stage_transition("c", PipelineStage::FetchMedia));

        let metrics = sink.metrics();
        assert_eq!(metrics.published(), 1);
        assert_eq!(metrics.dropped(), 1);
        assert!((metrics.drop_rate() - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_publish_after_receiver_dropped() {
        let (sink, rx) = ChannelEventSink::new(4);
        drop(rx);

        sink.publish(OutboxEvent::stage_transition("c", PipelineStage::Ingest)).await;
        assert_eq!(sink.metrics().dropped(), 1);
    }
}
