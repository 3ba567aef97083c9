//! Router - dispatches a classification to exactly one destination
//!
//! In-jurisdiction plates go to the violation queue under a single FIFO
//! message group, everything else to the external event bus.

use crate::domain::error::PipelineError;
use crate::domain::types::{BusEvent, Classification, ViolationEvent, ViolationMetadata};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::collaborators::{EventBus, MessageQueue, OutboundMessage};
use std::sync::Arc;
use tracing::info;

/// Where a routed event ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Sent to the violation queue; `duplicate` means the dedup window absorbed it
    Enqueued { message_id: String, duplicate: bool },
    /// Published to the event bus
    Published,
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub group_id: String,
    pub bus_name: String,
    pub source: String,
    pub detail_type: String,
}

impl RouterSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            group_id: config.violation_group_id().to_string(),
            bus_name: config.bus_name().to_string(),
            source: config.bus_source().to_string(),
            detail_type: config.bus_detail_type().to_string(),
        }
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct Router {
    queue: Arc<dyn MessageQueue>,
    bus: Arc<dyn EventBus>,
    settings: RouterSettings,
    metrics: Arc<Metrics>,
}

impl Router {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        bus: Arc<dyn EventBus>,
        settings: RouterSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { queue, bus, settings, metrics }
    }

    pub async fn route(
        &self,
        classification: &Classification,
        metadata: &ViolationMetadata,
        image_key: &str,
    ) -> Result<RouteOutcome, PipelineError> {
        let event = ViolationEvent::new(&classification.plate_number, metadata, image_key);

        if !classification.is_in_jurisdiction {
            let bus_event = BusEvent {
                bus_name: self.settings.bus_name.clone(),
                source: self.settings.source.clone(),
                detail_type: self.settings.detail_type.clone(),
                detail: event,
            };
            self.bus.publish(bus_event).await.map_err(|e| PipelineError::io("event_bus", e))?;
            self.metrics.record_routed(false);
            info!(image_key = %image_key, bus = %self.settings.bus_name, "out_of_jurisdiction_published");
            return Ok(RouteOutcome::Published);
        }

        let message = OutboundMessage {
            body: serde_json::to_string(&event)?,
            group_id: self.settings.group_id.clone(),
            dedup_id: event.dedup_key(),
        };
        let receipt =
            self.queue.send(message).await.map_err(|e| PipelineError::io("violation_queue", e))?;

        self.metrics.record_routed(true);
        if receipt.duplicate {
            self.metrics.record_duplicate_suppressed();
        }
        info!(
            image_key = %image_key,
            plate = %event.plate,
            message_id = %receipt.message_id,
            duplicate = receipt.duplicate,
            "violation_enqueued"
        );
        Ok(RouteOutcome::Enqueued { message_id: receipt.message_id, duplicate: receipt.duplicate })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::memory::MemoryEventBus;
    use crate::io::queue::{MemoryQueue, QueueSettings};
    use std::time::Duration;

    fn metadata() -> ViolationMetadata {
        ViolationMetadata {
            violation_type: "no_stop".to_string(),
            timestamp: "2024-05-01T10:00:00Z".to_string(),
            location: "Main St".to_string(),
        }
    }

    fn router() -> (Router, Arc<MemoryQueue>, Arc<MemoryEventBus>, Arc<Metrics>) {
        let queue = Arc::new(MemoryQueue::new("violations", QueueSettings::default()));
        let bus = Arc::new(MemoryEventBus::default());
        let metrics = Arc::new(Metrics::new());
        let router =
            Router::new(queue.clone(), bus.clone(), RouterSettings::default(), metrics.clone());
        (router, queue, bus, metrics)
    }

    fn in_jurisdiction() -> Classification {
        Classification { plate_number: "3ABC123".to_string(), is_in_jurisdiction: true }
    }

    #[tokio::test]
    async fn test_in_jurisdiction_enqueues_only() {
        let (router, queue, bus, _) = router();
        let outcome = router.route(&in_jurisdiction(), &metadata(), "car.jpg").await.unwrap();
        assert!(matches!(outcome, RouteOutcome::Enqueued { duplicate: false, .. }));
        assert!(bus.published().is_empty());

        let message = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(message.group_id, "violations");
        let event: ViolationEvent = serde_json::from_str(&message.body).unwrap();
        assert_eq!(event.plate, "3ABC123");
        assert_eq!(event.image_key, "car.jpg");
    }

    #[tokio::test]
    async fn test_out_of_jurisdiction_publishes_only() {
        let (router, queue, bus, metrics) = router();
        let outcome = router
            .route(&Classification::out_of_jurisdiction(), &metadata(), "car.jpg")
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Published);
        assert_eq!(queue.depth().ready, 0);

        let published = bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].bus_name, "out-of-jurisdiction");
        assert_eq!(published[0].source, "custom.imageProcessing");
        assert_eq!(published[0].detail_type, "Image Processed");
        assert_eq!(published[0].detail.plate, "");
        assert_eq!(metrics.report().routed_out_of_jurisdiction, 1);
    }

    #[tokio::test]
    async fn test_retried_route_is_suppressed() {
        let (router, queue, _, metrics) = router();
        let first = router.route(&in_jurisdiction(), &metadata(), "car.jpg").await.unwrap();
        let second = router.route(&in_jurisdiction(), &metadata(), "car.jpg").await.unwrap();

        let (RouteOutcome::Enqueued { message_id: a, .. }, RouteOutcome::Enqueued { message_id: b, duplicate }) =
            (first, second)
        else {
            panic!("expected both routes to enqueue");
        };
        assert_eq!(a, b);
        assert!(duplicate);
        assert_eq!(queue.depth().ready, 1);
        assert_eq!(metrics.report().duplicates_suppressed, 1);
    }

    #[tokio::test]
    async fn test_dispatch_failure_propagates() {
        let (router, queue, bus, _) = router();
        queue.fail_next_sends(1);
        let err = router.route(&in_jurisdiction(), &metadata(), "car.jpg").await.unwrap_err();
        assert!(err.is_transient());

        bus.fail_next(1);
        let err = router
            .route(&Classification::out_of_jurisdiction(), &metadata(), "car.jpg")
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
