//! Shared types for the violation pipeline
//!
//! Wire representations use camelCase keys so queue bodies stay readable by
//! any downstream consumer.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Metadata keys attached to every captured image at upload time
pub const META_VIOLATION_TYPE: &str = "violationType";
pub const META_TIMESTAMP: &str = "timestamp";
pub const META_LOCATION: &str = "location";

/// Separator between hashed fields so ("ab","c") and ("a","bc") differ
const DEDUP_FIELD_SEPARATOR: u8 = 0x1f;

/// Violation metadata set at capture time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationMetadata {
    pub violation_type: String,
    pub timestamp: String,
    pub location: String,
}

impl ViolationMetadata {
    /// Extract violation metadata from an object-store metadata map.
    /// Returns the name of the first missing key on failure.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, &'static str> {
        let field = |key: &'static str| map.get(key).cloned().ok_or(key);
        Ok(Self {
            violation_type: field(META_VIOLATION_TYPE)?,
            timestamp: field(META_TIMESTAMP)?,
            location: field(META_LOCATION)?,
        })
    }

    pub fn to_map(&self) -> HashMap<String, String> {
        HashMap::from([
            (META_VIOLATION_TYPE.to_string(), self.violation_type.clone()),
            (META_TIMESTAMP.to_string(), self.timestamp.clone()),
            (META_LOCATION.to_string(), self.location.clone()),
        ])
    }
}

/// Raw object as returned by the object store
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Bytes,
    pub metadata: HashMap<String, String>,
}

/// An image plus its immutable capture metadata
#[derive(Debug, Clone)]
pub struct CapturedImage {
    pub bucket: String,
    pub key: String,
    pub bytes: Bytes,
    pub metadata: ViolationMetadata,
}

/// One text token returned by the detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextDetection {
    pub text: String,
    /// Reported by the detector, never consulted by classification
    #[serde(default)]
    pub confidence: f32,
}

impl TextDetection {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self { text: text.into(), confidence }
    }
}

/// Jurisdiction classification of one image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub plate_number: String,
    pub is_in_jurisdiction: bool,
}

impl Classification {
    pub fn out_of_jurisdiction() -> Self {
        Self { plate_number: String::new(), is_in_jurisdiction: false }
    }
}

/// Unit of work carried on the violation queue or the event bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationEvent {
    pub plate: String,
    pub violation_type: String,
    pub timestamp: String,
    pub location: String,
    pub image_key: String,
}

impl ViolationEvent {
    pub fn new(plate: &str, metadata: &ViolationMetadata, image_key: &str) -> Self {
        Self {
            plate: plate.to_string(),
            violation_type: metadata.violation_type.clone(),
            timestamp: metadata.timestamp.clone(),
            location: metadata.location.clone(),
            image_key: image_key.to_string(),
        }
    }

    /// Deterministic deduplication key derived from event content only
    pub fn dedup_key(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [
            &self.plate,
            &self.violation_type,
            &self.timestamp,
            &self.location,
            &self.image_key,
        ] {
            hasher.update(field.as_bytes());
            hasher.update([DEDUP_FIELD_SEPARATOR]);
        }
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub name: String,
    pub contact: String,
}

/// Registry reference data, read-only from the pipeline's perspective
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub plate: String,
    pub make: String,
    pub model: String,
    pub color: String,
    pub owner: Owner,
}

/// Violation joined with registry data, carried on the enriched queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedViolation {
    pub plate: String,
    pub violation_type: String,
    pub timestamp: String,
    pub location: String,
    pub image_key: String,
    pub make: String,
    pub model: String,
    pub color: String,
    pub owner: Owner,
}

impl EnrichedViolation {
    /// Merge a violation with its vehicle record. Violation fields win on collision.
    pub fn merge(event: ViolationEvent, record: VehicleRecord) -> Self {
        Self {
            plate: event.plate,
            violation_type: event.violation_type,
            timestamp: event.timestamp,
            location: event.location,
            image_key: event.image_key,
            make: record.make,
            model: record.model,
            color: record.color,
            owner: record.owner,
        }
    }

    /// The violation this record was built from
    pub fn violation(&self) -> ViolationEvent {
        ViolationEvent {
            plate: self.plate.clone(),
            violation_type: self.violation_type.clone(),
            timestamp: self.timestamp.clone(),
            location: self.location.clone(),
            image_key: self.image_key.clone(),
        }
    }

    /// Same key as the source violation so redelivered enrichments converge
    pub fn dedup_key(&self) -> String {
        self.violation().dedup_key()
    }
}

/// Event published to the bus for out-of-jurisdiction plates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusEvent {
    pub bus_name: String,
    pub source: String,
    pub detail_type: String,
    pub detail: ViolationEvent,
}

/// Terminal notice sent to a vehicle owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationMessage {
    pub recipient_contact: String,
    pub body: String,
}

/// Why a queue message was removed without producing downstream output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    PlateNotFound,
    UnknownViolationType,
    Malformed,
    MaxReceivesExceeded,
    /// Storage trigger still failing after its last retry
    RetriesExhausted,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlateNotFound => "plate_not_found",
            Self::UnknownViolationType => "unknown_violation_type",
            Self::Malformed => "malformed",
            Self::MaxReceivesExceeded => "max_receives_exceeded",
            Self::RetriesExhausted => "retries_exhausted",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected message preserved for audit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// RFC 3339 UTC time of rejection
    pub ts: String,
    pub stage: String,
    pub reason: RejectReason,
    pub detail: String,
    pub receive_count: u32,
    pub body: String,
}

impl DeadLetter {
    /// Letter stamped with the current UTC time
    pub fn now(stage: &str, reason: RejectReason, detail: String, receive_count: u32, body: String) -> Self {
        Self {
            ts: OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
            stage: stage.to_string(),
            reason,
            detail,
            receive_count,
            body,
        }
    }
}
