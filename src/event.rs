//! Structured audit events emitted on every custody mutation.
//!
//! The admin UI reads these to show who moved which records and why.
//! Every record transition carries its before and after status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Actor, DatabaseId, Decision, RecordId, RecordStatus, RequestId, StaffId};

/// A structured event emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

/// Why a record changed status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    Reserve,
    Commit,
    Release,
    Exclude,
    Restore,
    Repair,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    DatabaseCreated {
        database_id: DatabaseId,
        filename: String,
        total_records: u64,
        uploaded_by: StaffId,
    },
    DatabaseDeleted {
        database_id: DatabaseId,
        deleted_by: StaffId,
        records_removed: u64,
        requests_removed: u64,
    },
    RecordsTransitioned {
        database_id: DatabaseId,
        record_ids: Vec<RecordId>,
        from: RecordStatus,
        to: RecordStatus,
        request_id: Option<RequestId>,
        cause: TransitionCause,
    },
    RequestSubmitted {
        request_id: RequestId,
        database_id: DatabaseId,
        staff_id: StaffId,
        requested_count: u64,
    },
    RequestDecided {
        request_id: RequestId,
        decision: Decision,
        decided_by: Actor,
    },
    PolicyUpdated {
        enabled: bool,
        max_records_per_request: Option<u64>,
        updated_by: StaffId,
    },
    RepairApplied {
        record_id: RecordId,
        request_id: Option<RequestId>,
        from: RecordStatus,
        to: RecordStatus,
        reason: String,
    },
    /// Fallback for rows this version cannot parse.
    Unknown { raw: String },
}
