//! Error types for leadpool.
//!
//! Every variant is recoverable by the caller; none should bring the
//! process down.

use thiserror::Error;

use crate::model::{DatabaseId, RecordId, RecordStatus, RequestId, RequestStatus};

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error(
        "insufficient available records in database {database_id}: requested {requested}, available {available}"
    )]
    InsufficientAvailable {
        database_id: DatabaseId,
        requested: u64,
        available: u64,
    },

    #[error("invalid transition for record {record_id}: {from} -> {to}")]
    InvalidTransition {
        record_id: RecordId,
        from: RecordStatus,
        to: RecordStatus,
    },

    #[error("request {request_id} already decided ({status})")]
    AlreadyDecided {
        request_id: RequestId,
        status: RequestStatus,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error(
        "database {database_id} has outstanding records ({requested} requested, {assigned} assigned)"
    )]
    DatabaseInUse {
        database_id: DatabaseId,
        requested: u64,
        assigned: u64,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
