//! Services - pipeline stages
//!
//! This module contains the stage logic:
//! - `detector` - Per-image detection and classification
//! - `router` - Dispatch to the violation queue or the event bus
//! - `worker` - Single-message poll loop with acknowledge-after-publish
//! - `enricher` - Registry lookup for queued violations
//! - `notifier` - Fine computation and owner notification

pub mod detector;
pub mod enricher;
pub mod notifier;
pub mod router;
pub mod worker;

// Re-export commonly used types
pub use detector::{DetectorSettings, DetectorStage};
pub use enricher::{Enricher, Enrichment};
pub use notifier::Notifier;
pub use router::{RouteOutcome, Router, RouterSettings};
pub use worker::{Handled, MessageHandler, PollOutcome, PollWorker, WorkerSettings};
