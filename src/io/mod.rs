//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `collaborators` - Traits every stage depends on
//! - `queue` - In-process FIFO queue with visibility timeout and dedup
//! - `object_store` - Filesystem object store and new-object watcher
//! - `detector` - HTTP text detection client
//! - `registry` - File-backed vehicle registry
//! - `mqtt_bus` - Event bus and notification channel over MQTT
//! - `dead_letter` - Rejected messages to file (JSONL format)
//! - `memory` - In-memory collaborators for tests and local runs
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod collaborators;
pub mod dead_letter;
pub mod detector;
pub mod memory;
pub mod mqtt_bus;
pub mod object_store;
pub mod prometheus;
pub mod queue;
pub mod registry;

// Re-export commonly used types
pub use collaborators::{
    DeadLetterSink, EventBus, MessageQueue, NotificationChannel, ObjectStore, OutboundMessage,
    ReceivedMessage, Registry, SendReceipt, TextDetector,
};
pub use dead_letter::JsonlDeadLetterSink;
pub use detector::HttpTextDetector;
pub use mqtt_bus::{MqttEventBus, MqttNotificationChannel, MqttPublisher};
pub use object_store::{FsObjectStore, ObjectWatcher, StorageEvent};
pub use queue::{MemoryQueue, QueueSettings};
pub use registry::FileRegistry;
