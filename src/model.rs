//! Core data model.
//!
//! A database is an uploaded pool of customer-contact records. Staff draw
//! records from a pool by submitting requests; each record carries its own
//! custody status and a weak back-reference to the request that last touched it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Opaque, ordered column values of a single uploaded row.
///
/// The engine never interprets these.
pub type RowData = serde_json::Map<String, serde_json::Value>;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                s.parse()
                    .map(Self)
                    .map_err(|e| Error::Validation(format!("invalid {}: {e}", stringify!($name))))
            }
        }
    };
}

uuid_id!(
    /// Identifier of an uploaded database.
    DatabaseId
);
uuid_id!(
    /// Identifier of a single customer-contact record.
    RecordId
);
uuid_id!(
    /// Identifier of a staff request.
    RequestId
);

/// Staff member identity. Issued by the surrounding application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaffId(pub String);

impl StaffId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StaffId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StaffId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for StaffId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// An uploaded collection of records. Immutable except for deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    pub id: DatabaseId,
    /// Name of the file the rows were parsed from.
    pub filename: String,
    pub product_id: Option<String>,
    pub total_records: u64,
    pub uploaded_by: StaffId,
    pub uploaded_at: DateTime<Utc>,
}

/// Metadata for a database upload. Rows are supplied separately.
#[derive(Debug, Clone)]
pub struct NewDatabase {
    pub(crate) filename: String,
    pub(crate) product_id: Option<String>,
    pub(crate) uploaded_by: StaffId,
}

impl NewDatabase {
    pub fn new(filename: impl Into<String>, uploaded_by: impl Into<StaffId>) -> Self {
        Self {
            filename: filename.into(),
            product_id: None,
            uploaded_by: uploaded_by.into(),
        }
    }

    pub fn product(mut self, product_id: impl Into<String>) -> Self {
        self.product_id = Some(product_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One customer-contact row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub database_id: DatabaseId,
    /// Stable 1-based ordinal within the database. Never reused.
    pub row_number: u64,
    pub row_data: RowData,
    pub status: RecordStatus,
    /// Present iff `status == Assigned`.
    pub assigned_to: Option<StaffId>,
    /// The request that last touched this record. Present iff requested or assigned.
    pub request_id: Option<RequestId>,
    /// Present iff `status == Assigned`.
    pub assigned_at: Option<DateTime<Utc>>,
}

/// Custody status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Not claimed by any live request.
    Available,
    /// Tentatively reserved by a pending request.
    Requested,
    /// Permanently allocated to a staff member.
    Assigned,
    /// Withheld from allocation by an admin.
    Excluded,
}

impl RecordStatus {
    pub const ALL: [RecordStatus; 4] = [
        RecordStatus::Available,
        RecordStatus::Requested,
        RecordStatus::Assigned,
        RecordStatus::Excluded,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Available => "available",
            RecordStatus::Requested => "requested",
            RecordStatus::Assigned => "assigned",
            RecordStatus::Excluded => "excluded",
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "available" => Ok(RecordStatus::Available),
            "requested" => Ok(RecordStatus::Requested),
            "assigned" => Ok(RecordStatus::Assigned),
            "excluded" => Ok(RecordStatus::Excluded),
            _ => Err(Error::Other(format!("unknown record status: {s}"))),
        }
    }
}

/// Target of an out-of-band status correction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForceTarget {
    /// Return the record to the pool, clearing its links.
    Available,
    /// Hand the record to `staff_id` under `request_id`.
    Assigned {
        staff_id: StaffId,
        request_id: RequestId,
    },
}

impl ForceTarget {
    pub fn status(&self) -> RecordStatus {
        match self {
            ForceTarget::Available => RecordStatus::Available,
            ForceTarget::Assigned { .. } => RecordStatus::Assigned,
        }
    }
}

/// Per-status record counts for one database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub available: u64,
    pub requested: u64,
    pub assigned: u64,
    pub excluded: u64,
    pub total_records: u64,
}

impl StatusCounts {
    /// `available + requested + assigned + excluded == total_records`.
    pub fn is_balanced(&self) -> bool {
        self.available + self.requested + self.assigned + self.excluded == self.total_records
    }

    pub fn get(&self, status: RecordStatus) -> u64 {
        match status {
            RecordStatus::Available => self.available,
            RecordStatus::Requested => self.requested,
            RecordStatus::Assigned => self.assigned,
            RecordStatus::Excluded => self.excluded,
        }
    }
}

/// Filter for paging through a database's records.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub status: Option<RecordStatus>,
    pub offset: u64,
    pub limit: Option<u64>,
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A staff member's ask for a number of records from one database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub database_id: DatabaseId,
    pub staff_id: StaffId,
    /// Fixed at submission. Equals the size of the reserved set.
    pub requested_count: u64,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decided_by: Option<Actor>,
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Awaiting an admin decision.
    Pending,
    /// Records handed to the requester. Terminal.
    Approved,
    /// Records returned to the pool. Terminal.
    Rejected,
}

impl RequestStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!((self, to), (Pending, Approved) | (Pending, Rejected))
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Approved | RequestStatus::Rejected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "approved" => Ok(RequestStatus::Approved),
            "rejected" => Ok(RequestStatus::Rejected),
            _ => Err(Error::Other(format!("unknown request status: {s}"))),
        }
    }
}

/// An admin's verdict on a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn resulting_status(self) -> RequestStatus {
        match self {
            Decision::Approve => RequestStatus::Approved,
            Decision::Reject => RequestStatus::Rejected,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
        })
    }
}

impl std::str::FromStr for Decision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "approve" => Ok(Decision::Approve),
            "reject" => Ok(Decision::Reject),
            _ => Err(Error::Validation(format!(
                "decision must be 'approve' or 'reject', got '{s}'"
            ))),
        }
    }
}

/// Who made a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    /// The auto-approval fast path.
    System,
    Staff(StaffId),
}

impl Actor {
    pub(crate) fn to_column(&self) -> String {
        match self {
            Actor::System => "system".to_string(),
            Actor::Staff(id) => format!("staff:{id}"),
        }
    }

    pub(crate) fn from_column(s: &str) -> Result<Self> {
        match s {
            "system" => Ok(Actor::System),
            _ => s
                .strip_prefix("staff:")
                .map(|id| Actor::Staff(StaffId::new(id)))
                .ok_or_else(|| Error::Other(format!("unknown actor: {s}"))),
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Actor::System => f.write_str("system"),
            Actor::Staff(id) => write!(f, "{id}"),
        }
    }
}

/// Filter for listing requests. All fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub staff_id: Option<StaffId>,
    pub database_id: Option<DatabaseId>,
    pub status: Option<RequestStatus>,
}

// ---------------------------------------------------------------------------
// Allocation policy
// ---------------------------------------------------------------------------

/// Process-wide auto-approve configuration, persisted as a single row.
/// The default is disabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPolicy {
    pub enabled: bool,
    /// `None` means unlimited.
    pub max_records_per_request: Option<u64>,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by: Option<StaffId>,
}

impl AllocationPolicy {
    /// Whether a request for `count` records bypasses admin review.
    pub fn should_auto_approve(&self, count: u64) -> bool {
        self.enabled && self.max_records_per_request.is_none_or(|max| count <= max)
    }
}

/// Admin input for replacing the allocation policy.
///
/// The limit is signed so that nonsensical values reach validation
/// instead of being silently unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyUpdate {
    pub enabled: bool,
    pub max_records_per_request: Option<i64>,
}

impl PolicyUpdate {
    pub(crate) fn validate(&self) -> Result<Option<u64>> {
        match self.max_records_per_request {
            None => Ok(None),
            Some(max) if max <= 0 => Err(Error::Validation(format!(
                "max_records_per_request must be positive, got {max}"
            ))),
            Some(max) => Ok(Some(max as u64)),
        }
    }
}
