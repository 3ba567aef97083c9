//! Notifier - prices enriched violations and notifies the owner

use crate::domain::error::PipelineError;
use crate::domain::fines::{FineLookup, FineSchedule};
use crate::domain::notice::NoticeFormatter;
use crate::domain::types::{EnrichedViolation, NotificationMessage, RejectReason};
use crate::infra::metrics::Metrics;
use crate::io::collaborators::NotificationChannel;
use crate::services::worker::{Handled, MessageHandler};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct Notifier {
    fines: FineSchedule,
    formatter: NoticeFormatter,
    channel: Arc<dyn NotificationChannel>,
    metrics: Arc<Metrics>,
}

impl Notifier {
    pub fn new(
        fines: FineSchedule,
        formatter: NoticeFormatter,
        channel: Arc<dyn NotificationChannel>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { fines, formatter, channel, metrics }
    }

    /// Build the owner notice, or `None` when the violation type has no fine
    pub fn compose(&self, violation: &EnrichedViolation) -> Option<NotificationMessage> {
        match self.fines.lookup(&violation.violation_type) {
            FineLookup::Known(amount) => Some(self.formatter.format(violation, amount)),
            FineLookup::Unknown => None,
        }
    }
}

#[async_trait]
impl MessageHandler for Notifier {
    fn stage(&self) -> &'static str {
        "notifier"
    }

    async fn handle(&self, body: &str) -> Result<Handled, PipelineError> {
        let violation: EnrichedViolation = serde_json::from_str(body)?;

        let Some(notice) = self.compose(&violation) else {
            self.metrics.record_unknown_violation_type();
            info!(
                violation_type = %violation.violation_type,
                plate = %violation.plate,
                "unknown_violation_type"
            );
            return Ok(Handled::Rejected {
                reason: RejectReason::UnknownViolationType,
                detail: format!("no fine for violation type {:?}", violation.violation_type),
            });
        };

        self.channel
            .publish(notice)
            .await
            .map_err(|e| PipelineError::io("notification_channel", e))?;

        self.metrics.record_notice_published();
        info!(plate = %violation.plate, image_key = %violation.image_key, "notice_published");
        Ok(Handled::Completed)
    }
}
