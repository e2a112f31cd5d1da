//! Error types for the item store collaborators and editing sessions.

use thiserror::Error;

use crate::model::{BatchId, ValidationError};

/// Failure while fetching a batch's items.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Batch {0} not found")]
    BatchNotFound(BatchId),
}

/// Failure while persisting coordinate changes.
#[derive(Debug, Error)]
pub enum SaveError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Save rejected: {status} - {message}")]
    Rejected { status: u16, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Batch {0} not found")]
    BatchNotFound(BatchId),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Could not fetch items: {0}")]
    Source(#[from] SourceError),

    #[error("Could not save items: {0}")]
    Save(#[from] SaveError),

    #[error("A commit is in progress; the plate is read-only until it finishes")]
    CommitInFlight,

    #[error("Malformed well key '{0}'")]
    MalformedWell(String),

    #[error("Commit task ended abnormally: {0}")]
    CommitAborted(String),
}
