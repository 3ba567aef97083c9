//! In-memory collaborators
//!
//! Deterministic stand-ins for the external systems, used by tests and for
//! running the pipeline without cloud services. Each one can be told to
//! fail its next N calls.

use crate::domain::types::{
    BusEvent, CapturedImage, DeadLetter, NotificationMessage, StoredObject, TextDetection,
    VehicleRecord,
};
use crate::io::collaborators::{
    DeadLetterSink, EventBus, NotificationChannel, ObjectStore, Registry, TextDetector,
};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Counts down injected failures
#[derive(Debug, Default)]
pub struct FailureBudget {
    remaining: AtomicU32,
}

impl FailureBudget {
    pub fn fail_next(&self, n: u32) {
        self.remaining.store(n, Ordering::SeqCst);
    }

    /// Consume one failure if any are pending
    pub fn check(&self, collaborator: &str) -> anyhow::Result<()> {
        let consumed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            bail!("{collaborator}: injected failure");
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<FxHashMap<(String, String), StoredObject>>,
    failures: FailureBudget,
}

impl MemoryObjectStore {
    pub fn insert(&self, bucket: &str, key: &str, object: StoredObject) {
        self.objects.lock().insert((bucket.to_string(), key.to_string()), object);
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.fail_next(n);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> anyhow::Result<StoredObject> {
        self.failures.check("object_store")?;
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("object {bucket}/{key} not found"))
    }
}

/// Returns canned detections per image key; unknown keys yield no tokens
#[derive(Default)]
pub struct StaticTextDetector {
    detections: Mutex<FxHashMap<String, Vec<TextDetection>>>,
    failures: FailureBudget,
}

impl StaticTextDetector {
    pub fn insert(&self, key: &str, detections: Vec<TextDetection>) {
        self.detections.lock().insert(key.to_string(), detections);
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.fail_next(n);
    }
}

#[async_trait]
impl TextDetector for StaticTextDetector {
    async fn detect(&self, image: &CapturedImage) -> anyhow::Result<Vec<TextDetection>> {
        self.failures.check("text_detector")?;
        Ok(self.detections.lock().get(&image.key).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct MemoryRegistry {
    records: Mutex<FxHashMap<String, VehicleRecord>>,
    failures: FailureBudget,
}

impl MemoryRegistry {
    pub fn insert(&self, record: VehicleRecord) {
        self.records.lock().insert(record.plate.clone(), record);
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.fail_next(n);
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn lookup(&self, plate: &str) -> anyhow::Result<Option<VehicleRecord>> {
        self.failures.check("registry")?;
        Ok(self.records.lock().get(plate).cloned())
    }
}

#[derive(Default)]
pub struct MemoryEventBus {
    published: Mutex<Vec<BusEvent>>,
    failures: FailureBudget,
}

impl MemoryEventBus {
    pub fn published(&self) -> Vec<BusEvent> {
        self.published.lock().clone()
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.fail_next(n);
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, event: BusEvent) -> anyhow::Result<()> {
        self.failures.check("event_bus")?;
        self.published.lock().push(event);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryNotificationChannel {
    published: Mutex<Vec<NotificationMessage>>,
    failures: FailureBudget,
}

impl MemoryNotificationChannel {
    pub fn published(&self) -> Vec<NotificationMessage> {
        self.published.lock().clone()
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.fail_next(n);
    }
}

#[async_trait]
impl NotificationChannel for MemoryNotificationChannel {
    async fn publish(&self, message: NotificationMessage) -> anyhow::Result<()> {
        self.failures.check("notification_channel")?;
        self.published.lock().push(message);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
    failures: FailureBudget,
}

impl MemoryDeadLetterSink {
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.fail_next(n);
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn put(&self, letter: DeadLetter) -> anyhow::Result<()> {
        self.failures.check("dead_letter")?;
        self.letters.lock().push(letter);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_budget_counts_down() {
        let budget = FailureBudget::default();
        assert!(budget.check("x").is_ok());
        budget.fail_next(2);
        assert!(budget.check("x").is_err());
        assert!(budget.check("x").is_err());
        assert!(budget.check("x").is_ok());
    }

    #[tokio::test]
    async fn test_object_store_missing_key() {
        let store = MemoryObjectStore::default();
        let err = store.get("bucket", "missing.jpg").await.unwrap_err();
        assert!(err.to_string().contains("bucket/missing.jpg"));
    }
}
