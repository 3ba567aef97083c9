//! Pipeline error taxonomy
//!
//! Plate misses and unknown violation types are not errors; they are tagged
//! outcomes (`Enrichment::NotFound`, `FineLookup::Unknown`). Errors here
//! either abort an invocation or leave a message for redelivery.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed trigger payload, fatal to the invocation
    #[error("invalid trigger: {0}")]
    Validation(String),

    /// Queue body that can never be parsed
    #[error("malformed message body: {0}")]
    Decode(#[from] serde_json::Error),

    /// Any collaborator call failure; the source message stays on its queue
    #[error("{collaborator} call failed: {source:#}")]
    Io {
        collaborator: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    pub fn io(collaborator: &'static str, source: anyhow::Error) -> Self {
        Self::Io { collaborator, source }
    }

    /// Transient failures are retried through the queue's visibility timeout
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}
