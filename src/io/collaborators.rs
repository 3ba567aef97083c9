//! Collaborator interfaces injected into each pipeline stage
//!
//! Every external system the pipeline touches sits behind one of these
//! traits, so stages can run against production adapters or in-memory fakes.

use crate::domain::types::{
    BusEvent, CapturedImage, DeadLetter, NotificationMessage, StoredObject, TextDetection,
    VehicleRecord,
};
use async_trait::async_trait;
use std::time::Duration;

/// Message handed to a queue for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: String,
    /// FIFO ordering holds only within one group
    pub group_id: String,
    /// Duplicates within the queue's dedup window are suppressed
    pub dedup_id: String,
}

/// Acknowledgement of a send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: String,
    /// True when the dedup id was already seen and nothing was enqueued
    pub duplicate: bool,
}

/// Message delivered by a receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    /// Valid only until the visibility timeout expires
    pub receipt_handle: String,
    pub body: String,
    pub group_id: String,
    /// Number of times this message has been delivered, including this one
    pub receive_count: u32,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> anyhow::Result<StoredObject>;
}

#[async_trait]
pub trait TextDetector: Send + Sync {
    /// Tokens in detector order
    async fn detect(&self, image: &CapturedImage) -> anyhow::Result<Vec<TextDetection>>;
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Exact-plate lookup
    async fn lookup(&self, plate: &str) -> anyhow::Result<Option<VehicleRecord>>;
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> anyhow::Result<SendReceipt>;

    /// Long-poll for at most one message, waiting up to `wait`
    async fn receive(&self, wait: Duration) -> anyhow::Result<Option<ReceivedMessage>>;

    /// Acknowledge a received message
    async fn delete(&self, receipt_handle: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: BusEvent) -> anyhow::Result<()>;
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn publish(&self, message: NotificationMessage) -> anyhow::Result<()>;
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn put(&self, letter: DeadLetter) -> anyhow::Result<()>;
}
