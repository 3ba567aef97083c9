//! Enricher - joins queued violations with registry data
//!
//! A found plate becomes an `EnrichedViolation` on the notification queue,
//! keyed by the source violation's dedup key so a redelivered violation
//! cannot produce a second enriched record inside the dedup window.

use crate::domain::error::PipelineError;
use crate::domain::types::{EnrichedViolation, RejectReason, ViolationEvent};
use crate::infra::metrics::Metrics;
use crate::io::collaborators::{MessageQueue, OutboundMessage, Registry};
use crate::services::worker::{Handled, MessageHandler};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Result of a registry lookup for one violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enrichment {
    Found(EnrichedViolation),
    NotFound,
}

pub struct Enricher {
    registry: Arc<dyn Registry>,
    output: Arc<dyn MessageQueue>,
    group_id: String,
    metrics: Arc<Metrics>,
}

impl Enricher {
    pub fn new(
        registry: Arc<dyn Registry>,
        output: Arc<dyn MessageQueue>,
        group_id: &str,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { registry, output, group_id: group_id.to_string(), metrics }
    }

    /// Look the plate up by exact match
    pub async fn enrich(&self, event: &ViolationEvent) -> Result<Enrichment, PipelineError> {
        let record =
            self.registry.lookup(&event.plate).await.map_err(|e| PipelineError::io("registry", e))?;
        Ok(match record {
            Some(record) => Enrichment::Found(EnrichedViolation::merge(event.clone(), record)),
            None => Enrichment::NotFound,
        })
    }
}

#[async_trait]
impl MessageHandler for Enricher {
    fn stage(&self) -> &'static str {
        "enricher"
    }

    async fn handle(&self, body: &str) -> Result<Handled, PipelineError> {
        let event: ViolationEvent = serde_json::from_str(body)?;

        let enriched = match self.enrich(&event).await? {
            Enrichment::Found(enriched) => enriched,
            Enrichment::NotFound => {
                self.metrics.record_plate_miss();
                info!(plate = %event.plate, image_key = %event.image_key, "plate_not_found");
                return Ok(Handled::Rejected {
                    reason: RejectReason::PlateNotFound,
                    detail: format!("plate {} not in registry", event.plate),
                });
            }
        };

        let message = OutboundMessage {
            body: serde_json::to_string(&enriched)?,
            group_id: self.group_id.clone(),
            dedup_id: enriched.dedup_key(),
        };
        let receipt =
            self.output.send(message).await.map_err(|e| PipelineError::io("enriched_queue", e))?;

        if receipt.duplicate {
            self.metrics.record_duplicate_suppressed();
        } else {
            self.metrics.record_enriched();
        }
        info!(
            plate = %enriched.plate,
            image_key = %enriched.image_key,
            message_id = %receipt.message_id,
            duplicate = receipt.duplicate,
            "violation_enriched"
        );
        Ok(Handled::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Owner, VehicleRecord};
    use crate::io::memory::MemoryRegistry;
    use crate::io::queue::{MemoryQueue, QueueSettings};
    use std::time::Duration;

    fn event(plate: &str) -> ViolationEvent {
        ViolationEvent {
            plate: plate.to_string(),
            violation_type: "no_stop".to_string(),
            timestamp: "2024-05-01T10:00:00Z".to_string(),
            location: "Main St".to_string(),
            image_key: "car.jpg".to_string(),
        }
    }

    fn enricher() -> (Enricher, Arc<MemoryRegistry>, Arc<MemoryQueue>) {
        let registry = Arc::new(MemoryRegistry::default());
        registry.insert(VehicleRecord {
            plate: "3ABC123".to_string(),
            make: "Toyota".to_string(),
            model: "Camry".to_string(),
            color: "Blue".to_string(),
            owner: Owner { name: "J Doe".to_string(), contact: "j@x.com".to_string() },
        });
        let output = Arc::new(MemoryQueue::new("enriched", QueueSettings::default()));
        let enricher = Enricher::new(registry.clone(), output.clone(), "enriched", Arc::new(Metrics::new()));
        (enricher, registry, output)
    }

    #[tokio::test]
    async fn test_found_plate_is_forwarded() {
        let (enricher, _, output) = enricher();
        let body = serde_json::to_string(&event("3ABC123")).unwrap();
        assert_eq!(enricher.handle(&body).await.unwrap(), Handled::Completed);

        let message = output.receive(Duration::ZERO).await.unwrap().unwrap();
        let enriched: EnrichedViolation = serde_json::from_str(&message.body).unwrap();
        assert_eq!(enriched.make, "Toyota");
        assert_eq!(enriched.owner.contact, "j@x.com");
        assert_eq!(enriched.location, "Main St");
        assert_eq!(message.group_id, "enriched");
    }

    #[tokio::test]
    async fn test_missing_plate_is_rejected() {
        let (enricher, _, output) = enricher();
        assert_eq!(enricher.enrich(&event("9ZZZ999")).await.unwrap(), Enrichment::NotFound);

        let body = serde_json::to_string(&event("9ZZZ999")).unwrap();
        let handled = enricher.handle(&body).await.unwrap();
        assert!(matches!(handled, Handled::Rejected { reason: RejectReason::PlateNotFound, .. }));
        assert_eq!(output.depth().ready, 0);
    }

    #[tokio::test]
    async fn test_repeated_violation_is_deduplicated() {
        let (enricher, _, output) = enricher();
        let body = serde_json::to_string(&event("3ABC123")).unwrap();
        enricher.handle(&body).await.unwrap();
        enricher.handle(&body).await.unwrap();
        assert_eq!(output.depth().ready, 1);
    }

    #[tokio::test]
    async fn test_registry_failure_is_transient() {
        let (enricher, registry, _) = enricher();
        registry.fail_next(1);
        let body = serde_json::to_string(&event("3ABC123")).unwrap();
        assert!(enricher.handle(&body).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let (enricher, _, _) = enricher();
        let err = enricher.handle(r#"{"plate":"3ABC123"}"#).await.unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
    }
}
