//! Domain models - core business types and pure pipeline logic
//!
//! This module contains the canonical data types and the pure functions
//! used by the pipeline stages:
//! - `types` - images, classifications, violations, vehicle records
//! - `plate` - jurisdiction plate classifier
//! - `fines` - fine schedule
//! - `notice` - owner notice formatting
//! - `error` - pipeline error taxonomy

pub mod error;
pub mod fines;
pub mod notice;
pub mod plate;
pub mod types;

// Re-export commonly used types at module level
pub use error::PipelineError;
pub use fines::{FineLookup, FineSchedule};
pub use notice::NoticeFormatter;
pub use types::{
    BusEvent, CapturedImage, Classification, DeadLetter, EnrichedViolation, NotificationMessage, Owner,
    RejectReason, StoredObject, TextDetection, VehicleRecord, ViolationEvent, ViolationMetadata,
};
