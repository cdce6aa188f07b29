//! Error types for the ingestion engine

use thiserror::Error;

/// Why a single observation was not accepted.
///
/// Local to one record: the rest of the batch is still processed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Unknown anchor: {0}")]
    UnknownAnchor(String),

    #[error("Invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Malformed observation: {0}")]
    Malformed(String),
}

/// Failures that reject a whole ingestion payload
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Empty scan data")]
    Empty,

    #[error("Expected an observation object or an array, got {0}")]
    UnexpectedType(&'static str),
}
