//! Detector stage - one invocation per newly stored image
//!
//! Fetches the image and its capture metadata, runs text detection,
//! classifies the tokens and hands the result to the router. Invocations
//! share no state with each other.
//!
//! A trigger that fails on a collaborator call is invoked again after a
//! doubling back-off. Once its attempts are used up it is dead-lettered,
//! so no stored image disappears without a trace.

use crate::domain::error::PipelineError;
use crate::domain::plate;
use crate::domain::types::{CapturedImage, DeadLetter, RejectReason, ViolationMetadata};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::collaborators::{DeadLetterSink, ObjectStore, TextDetector};
use crate::io::object_store::{decode_object_key, StorageEvent};
use crate::services::router::{RouteOutcome, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

const STAGE: &str = "detector";

#[derive(Debug, Clone, Copy)]
pub struct DetectorSettings {
    /// Invocations per trigger, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt, doubled for each later one
    pub retry_backoff: Duration,
}

impl DetectorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.detector_max_attempts(),
            retry_backoff: Duration::from_millis(config.detector_retry_backoff_ms()),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff.saturating_mul(1 << attempt.saturating_sub(1).min(16))
    }
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct DetectorStage {
    store: Arc<dyn ObjectStore>,
    detector: Arc<dyn TextDetector>,
    router: Router,
    dead_letters: Arc<dyn DeadLetterSink>,
    metrics: Arc<Metrics>,
    settings: DetectorSettings,
}

impl DetectorStage {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        detector: Arc<dyn TextDetector>,
        router: Router,
        dead_letters: Arc<dyn DeadLetterSink>,
        metrics: Arc<Metrics>,
        settings: DetectorSettings,
    ) -> Self {
        Self { store, detector, router, dead_letters, metrics, settings }
    }

    /// Handle a raw JSON storage notification
    pub async fn handle_json(&self, payload: &str) -> Result<RouteOutcome, PipelineError> {
        match serde_json::from_str::<StorageEvent>(payload) {
            Ok(trigger) => self.handle(&trigger).await,
            Err(e) => {
                self.metrics.record_validation_failure();
                warn!(error = %e, "storage_trigger_invalid");
                Err(PipelineError::Validation(format!("unparseable trigger: {e}")))
            }
        }
    }

    pub async fn handle(&self, trigger: &StorageEvent) -> Result<RouteOutcome, PipelineError> {
        let result = self.process(trigger).await;
        match &result {
            Ok(_) => self.metrics.record_image_processed(),
            Err(PipelineError::Validation(reason)) => {
                self.metrics.record_validation_failure();
                warn!(reason = %reason, "storage_trigger_invalid");
            }
            Err(e) => {
                self.metrics.record_detector_failure();
                let key = trigger.records.first().map(|r| decode_object_key(&r.s3.object.key));
                warn!(image_key = ?key, error = %e, "image_processing_failed");
            }
        }
        result
    }

    /// Handle a trigger, retrying transient failures until the attempt bound
    pub async fn invoke(&self, trigger: &StorageEvent) -> Result<RouteOutcome, PipelineError> {
        let mut attempt = 1;
        loop {
            match self.handle(trigger).await {
                Err(e) if e.is_transient() && attempt < self.settings.max_attempts => {
                    let delay = self.settings.backoff(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "image_processing_retry_scheduled");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    self.dead_letter(trigger, &e, attempt).await;
                    return Err(e);
                }
                result => return result,
            }
        }
    }

    async fn dead_letter(&self, trigger: &StorageEvent, cause: &PipelineError, attempts: u32) {
        let body = match serde_json::to_string(trigger) {
            Ok(body) => body,
            Err(e) => format!("unserializable trigger: {e}"),
        };
        let letter = DeadLetter::now(STAGE, RejectReason::RetriesExhausted, cause.to_string(), attempts, body);
        match self.dead_letters.put(letter).await {
            Ok(()) => {
                self.metrics.record_dead_lettered();
                warn!(attempts, error = %cause, "storage_trigger_dead_lettered");
            }
            Err(e) => {
                error!(attempts, error = %format!("{e:#}"), cause = %cause, "storage_trigger_lost");
            }
        }
    }

    async fn process(&self, trigger: &StorageEvent) -> Result<RouteOutcome, PipelineError> {
        let record = trigger
            .records
            .first()
            .ok_or_else(|| PipelineError::Validation("trigger has no records".to_string()))?;
        let bucket = record.s3.bucket.name.clone();
        let key = decode_object_key(&record.s3.object.key);
        if bucket.is_empty() || key.is_empty() {
            return Err(PipelineError::Validation("trigger record lacks bucket or key".to_string()));
        }

        let object =
            self.store.get(&bucket, &key).await.map_err(|e| PipelineError::io("object_store", e))?;
        let metadata = ViolationMetadata::from_map(&object.metadata).map_err(|field| {
            PipelineError::Validation(format!("object {key} has no {field} metadata"))
        })?;
        let image = CapturedImage { bucket, key, bytes: object.bytes, metadata };

        let detections =
            self.detector.detect(&image).await.map_err(|e| PipelineError::io("text_detector", e))?;
        let classification = plate::classify(&detections);
        debug!(
            image_key = %image.key,
            tokens = detections.len(),
            plate = %classification.plate_number,
            in_jurisdiction = classification.is_in_jurisdiction,
            "image_classified"
        );

        self.router.route(&classification, &image.metadata, &image.key).await
    }

    /// Spawn one invocation per trigger until shutdown or the channel closes
    pub async fn run(
        self: Arc<Self>,
        mut triggers: mpsc::Receiver<StorageEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("detector_stage_started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("detector_stage_shutdown");
                        return;
                    }
                }
                trigger = triggers.recv() => {
                    let Some(trigger) = trigger else {
                        info!("detector_stage_channel_closed");
                        return;
                    };
                    let stage = self.clone();
                    tokio::spawn(async move {
                        // Failures are logged, counted and dead-lettered by invoke()
                        let _ = stage.invoke(&trigger).await;
                    });
                }
            }
        }
    }
}
