//! Consistency auditor: detect and repair drift between record status and
//! the status of the request a record points at.
//!
//! Two independent check-then-repair flows:
//!
//! - **Stuck records**: records left `requested` although their request is
//!   gone, rejected or approved.
//! - **Approved recovery**: approved requests whose reserved records are not
//!   all assigned to the requester.
//!
//! Diagnosis is a read-only snapshot and may be stale by the time a repair
//! runs. Repairs therefore never trust a diagnosis: they re-classify every
//! record inside the write transaction that corrects it. Each record is
//! corrected in its own transaction, so an interrupted repair keeps the
//! corrections already made and can simply be run again.

use std::collections::BTreeMap;
use std::time::Instant;

use opentelemetry::KeyValue;
use serde::Serialize;
use tracing::{info, warn};

use super::{optional, record_duration};
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::model::*;
use crate::storage::TxContext;
use crate::telemetry::metrics;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What a repair would do to a stuck record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    /// The request is still pending; nothing is wrong.
    None,
    ToAvailable,
    ToAssigned,
}

/// Diagnosis of records stuck in `requested`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StuckReport {
    pub total_requested_records: u64,
    /// Requested records with no request id at all.
    pub orphan_records_no_request_id: u64,
    /// Requested records whose request id resolves to nothing.
    pub missing_request_records: u64,
    pub needs_available: u64,
    pub needs_assigned: u64,
    /// Requested records legitimately held by a pending request.
    pub healthy_pending: u64,
    pub related_requests: Vec<RelatedRequest>,
}

/// A request referenced by one or more requested records.
#[derive(Debug, Clone, Serialize)]
pub struct RelatedRequest {
    pub request_id: RequestId,
    /// `None` when the request no longer exists.
    pub status: Option<RequestStatus>,
    pub staff_id: Option<StaffId>,
    pub record_count: u64,
    pub action: RepairAction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StuckRepair {
    pub total_processed: u64,
    pub fixed_to_assigned: u64,
    pub fixed_to_available: u64,
}

/// Diagnosis of approved requests whose records are not all assigned.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub total_approved_requests: u64,
    pub requests_needing_recovery: u64,
    pub details: Vec<RecoveryDetail>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryDetail {
    pub request_id: RequestId,
    pub database_id: DatabaseId,
    pub staff_id: StaffId,
    pub requested_count: u64,
    /// Reserved records currently assigned to the requester.
    pub assigned_count: u64,
    /// Reserved records not assigned to the requester.
    pub outstanding: u64,
    /// Outstanding records that belong to another live request or are
    /// excluded. Recovery leaves these alone.
    pub blocked: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoverySummary {
    pub total_recovered: u64,
    pub requests_processed: u64,
    pub skipped_blocked: u64,
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum StuckClass {
    Healthy,
    Orphan,
    MissingRequest(RequestId),
    Rejected(RequestId),
    Approved {
        request_id: RequestId,
        staff_id: StaffId,
    },
}

impl StuckClass {
    fn action(&self) -> RepairAction {
        match self {
            StuckClass::Healthy => RepairAction::None,
            StuckClass::Orphan | StuckClass::MissingRequest(_) | StuckClass::Rejected(_) => {
                RepairAction::ToAvailable
            }
            StuckClass::Approved { .. } => RepairAction::ToAssigned,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            StuckClass::Healthy => "pending request",
            StuckClass::Orphan => "requested record has no request id",
            StuckClass::MissingRequest(_) => "requested record points at a missing request",
            StuckClass::Rejected(_) => "requested record belongs to a rejected request",
            StuckClass::Approved { .. } => "requested record belongs to an approved request",
        }
    }
}

/// Classify a record in `requested` status by the request it points at.
fn classify_stuck(record: &Record, request: Option<&Request>) -> StuckClass {
    let Some(request_id) = record.request_id else {
        return StuckClass::Orphan;
    };
    match request {
        None => StuckClass::MissingRequest(request_id),
        Some(request) => match request.status {
            RequestStatus::Pending => StuckClass::Healthy,
            RequestStatus::Rejected => StuckClass::Rejected(request_id),
            RequestStatus::Approved => StuckClass::Approved {
                request_id,
                staff_id: request.staff_id.clone(),
            },
        },
    }
}

/// Where a reserved record of an approved request stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fulfilment {
    Assigned,
    Recoverable,
    Blocked,
}

/// `other` is the request the record currently points at, when that is
/// not the approved request itself.
fn classify_fulfilment(record: &Record, approved: &Request, other: Option<&Request>) -> Fulfilment {
    if record.status == RecordStatus::Assigned
        && record.assigned_to.as_ref() == Some(&approved.staff_id)
    {
        return Fulfilment::Assigned;
    }

    let linked_here = record.request_id.is_none() || record.request_id == Some(approved.id);
    let other_is_live = other.is_some_and(|r| {
        matches!(r.status, RequestStatus::Pending | RequestStatus::Approved)
    });

    match record.status {
        RecordStatus::Available => Fulfilment::Recoverable,
        RecordStatus::Excluded => Fulfilment::Blocked,
        // held under this request, under no request, or under a dead one
        RecordStatus::Requested | RecordStatus::Assigned if linked_here || !other_is_live => {
            Fulfilment::Recoverable
        }
        RecordStatus::Requested | RecordStatus::Assigned => Fulfilment::Blocked,
    }
}

/// Resolve the request a record points at, if it is not `exclude`.
fn linked_request(
    lookup: impl Fn(RequestId) -> Result<Request>,
    record: &Record,
    exclude: Option<RequestId>,
) -> Result<Option<Request>> {
    match record.request_id {
        Some(id) if Some(id) != exclude => optional(lookup(id)),
        _ => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Flows
// ---------------------------------------------------------------------------

impl super::Engine {
    /// Flow A diagnosis: classify every `requested` record, optionally
    /// restricted to one database. Read-only.
    pub fn diagnose_stuck(&self, database_id: Option<DatabaseId>) -> Result<StuckReport> {
        if let Some(id) = database_id {
            self.storage.get_database(id)?;
        }

        let records = self
            .storage
            .records_with_status(RecordStatus::Requested, database_id)?;

        let mut report = StuckReport {
            total_requested_records: records.len() as u64,
            ..Default::default()
        };
        let mut related: BTreeMap<RequestId, RelatedRequest> = BTreeMap::new();

        for record in &records {
            let request = linked_request(|id| self.storage.get_request(id), record, None)?;
            let class = classify_stuck(record, request.as_ref());

            match class.action() {
                RepairAction::None => report.healthy_pending += 1,
                RepairAction::ToAvailable => report.needs_available += 1,
                RepairAction::ToAssigned => report.needs_assigned += 1,
            }
            match class {
                StuckClass::Orphan => report.orphan_records_no_request_id += 1,
                StuckClass::MissingRequest(_) => report.missing_request_records += 1,
                _ => {}
            }

            if let Some(request_id) = record.request_id {
                related
                    .entry(request_id)
                    .or_insert_with(|| RelatedRequest {
                        request_id,
                        status: request.as_ref().map(|r| r.status),
                        staff_id: request.as_ref().map(|r| r.staff_id.clone()),
                        record_count: 0,
                        action: class.action(),
                    })
                    .record_count += 1;
            }
        }

        report.related_requests = related.into_values().collect();
        if report.needs_available + report.needs_assigned > 0 {
            warn!(
                needs_available = report.needs_available,
                needs_assigned = report.needs_assigned,
                orphans = report.orphan_records_no_request_id,
                "stuck requested records detected"
            );
        }
        Ok(report)
    }

    /// Flow A repair: move every stuck `requested` record to where its
    /// request says it belongs. Re-running with nothing changed in between
    /// processes zero records.
    pub fn repair_stuck(&mut self, database_id: Option<DatabaseId>) -> Result<StuckRepair> {
        let started = Instant::now();
        if let Some(id) = database_id {
            self.storage.get_database(id)?;
        }

        let candidates: Vec<RecordId> = self
            .storage
            .records_with_status(RecordStatus::Requested, database_id)?
            .into_iter()
            .map(|r| r.id)
            .collect();

        let mut summary = StuckRepair::default();
        for record_id in candidates {
            let applied = self
                .storage
                .with_transaction(|ctx| repair_stuck_record(ctx, record_id))?;

            match applied {
                Some(RecordStatus::Available) => summary.fixed_to_available += 1,
                Some(RecordStatus::Assigned) => summary.fixed_to_assigned += 1,
                _ => continue,
            }
            summary.total_processed += 1;
        }

        record_duration("audit.repair_stuck", started);
        info!(
            total_processed = summary.total_processed,
            fixed_to_assigned = summary.fixed_to_assigned,
            fixed_to_available = summary.fixed_to_available,
            "stuck record repair finished"
        );
        Ok(summary)
    }

    /// Flow B diagnosis: approved requests with reserved records that are
    /// not assigned to the requester. Fully assigned requests are omitted.
    pub fn diagnose_recovery_needed(&self) -> Result<RecoveryReport> {
        let approved = self.storage.list_requests(&RequestFilter {
            status: Some(RequestStatus::Approved),
            ..Default::default()
        })?;

        let mut report = RecoveryReport {
            total_approved_requests: approved.len() as u64,
            ..Default::default()
        };

        for request in &approved {
            let mut assigned_count = 0;
            let mut outstanding = 0;
            let mut blocked = 0;

            for record_id in self.storage.request_record_ids(request.id)? {
                let record = self.storage.get_record(record_id)?;
                let other =
                    linked_request(|id| self.storage.get_request(id), &record, Some(request.id))?;
                match classify_fulfilment(&record, request, other.as_ref()) {
                    Fulfilment::Assigned => assigned_count += 1,
                    Fulfilment::Recoverable => outstanding += 1,
                    Fulfilment::Blocked => {
                        outstanding += 1;
                        blocked += 1;
                    }
                }
            }

            if outstanding > 0 {
                report.details.push(RecoveryDetail {
                    request_id: request.id,
                    database_id: request.database_id,
                    staff_id: request.staff_id.clone(),
                    requested_count: request.requested_count,
                    assigned_count,
                    outstanding,
                    blocked,
                });
            }
        }

        report.requests_needing_recovery = report.details.len() as u64;
        if report.requests_needing_recovery > 0 {
            warn!(
                requests = report.requests_needing_recovery,
                "approved requests with unassigned records detected"
            );
        }
        Ok(report)
    }

    /// Flow B repair: assign every recoverable outstanding record of every
    /// approved request to that request's staff member. Records held by
    /// another live request are never taken.
    pub fn recover_approved(&mut self) -> Result<RecoverySummary> {
        let started = Instant::now();
        let approved = self.storage.list_requests(&RequestFilter {
            status: Some(RequestStatus::Approved),
            ..Default::default()
        })?;

        let mut summary = RecoverySummary::default();
        for request in &approved {
            let mut recovered_here = 0;
            for record_id in self.storage.request_record_ids(request.id)? {
                let outcome = self
                    .storage
                    .with_transaction(|ctx| recover_record(ctx, request.id, record_id))?;
                match outcome {
                    Some(Fulfilment::Recoverable) => recovered_here += 1,
                    Some(Fulfilment::Blocked) => summary.skipped_blocked += 1,
                    _ => {}
                }
            }

            if recovered_here > 0 {
                summary.total_recovered += recovered_here;
                summary.requests_processed += 1;
                info!(
                    request_id = %request.id,
                    staff_id = %request.staff_id,
                    recovered = recovered_here,
                    "approved request recovered"
                );
            }
        }

        record_duration("audit.recover_approved", started);
        info!(
            total_recovered = summary.total_recovered,
            requests_processed = summary.requests_processed,
            skipped_blocked = summary.skipped_blocked,
            "approved request recovery finished"
        );
        Ok(summary)
    }
}

/// Re-check and correct one stuck record. Returns the status it was moved
/// to, or `None` if it no longer needs correcting.
fn repair_stuck_record(ctx: &mut TxContext, record_id: RecordId) -> Result<Option<RecordStatus>> {
    let Some(record) = optional(ctx.get_record(record_id))? else {
        return Ok(None);
    };
    if record.status != RecordStatus::Requested {
        return Ok(None);
    }

    let request = linked_request(|id| ctx.get_request(id), &record, None)?;
    let class = classify_stuck(&record, request.as_ref());
    let target = match &class {
        StuckClass::Healthy => return Ok(None),
        StuckClass::Orphan | StuckClass::MissingRequest(_) | StuckClass::Rejected(_) => {
            ForceTarget::Available
        }
        StuckClass::Approved {
            request_id,
            staff_id,
        } => ForceTarget::Assigned {
            staff_id: staff_id.clone(),
            request_id: *request_id,
        },
    };

    apply_repair(ctx, &record, &target, "stuck", class.reason())?;
    Ok(Some(target.status()))
}

/// Re-check and, if recoverable, assign one reserved record of an approved
/// request. Returns how the record was classified, or `None` if the
/// request is no longer approved or the record is gone.
fn recover_record(
    ctx: &mut TxContext,
    request_id: RequestId,
    record_id: RecordId,
) -> Result<Option<Fulfilment>> {
    let Some(request) = optional(ctx.get_request(request_id))? else {
        return Ok(None);
    };
    if request.status != RequestStatus::Approved {
        return Ok(None);
    }
    let Some(record) = optional(ctx.get_record(record_id))? else {
        return Ok(None);
    };

    let other = linked_request(|id| ctx.get_request(id), &record, Some(request_id))?;
    let fulfilment = classify_fulfilment(&record, &request, other.as_ref());
    if fulfilment == Fulfilment::Recoverable {
        let target = ForceTarget::Assigned {
            staff_id: request.staff_id.clone(),
            request_id,
        };
        apply_repair(
            ctx,
            &record,
            &target,
            "recovery",
            "approved request record was not assigned to the requester",
        )?;
    }
    Ok(Some(fulfilment))
}

fn apply_repair(
    ctx: &mut TxContext,
    record: &Record,
    target: &ForceTarget,
    flow: &'static str,
    reason: &str,
) -> Result<()> {
    let from = ctx.force_status(record.id, target)?;
    let request_id = match target {
        ForceTarget::Assigned { request_id, .. } => Some(*request_id),
        ForceTarget::Available => record.request_id,
    };

    ctx.record_event(EventKind::RepairApplied {
        record_id: record.id,
        request_id,
        from,
        to: target.status(),
        reason: reason.to_string(),
    })?;
    metrics::repairs_applied().add(
        1,
        &[
            KeyValue::new("flow", flow),
            KeyValue::new("target", target.status().as_str()),
        ],
    );
    warn!(
        record_id = %record.id,
        database_id = %record.database_id,
        from = %from,
        to = %target.status(),
        reason,
        "record repaired"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(status: RecordStatus, request_id: Option<RequestId>) -> Record {
        Record {
            id: RecordId::new(),
            database_id: DatabaseId::new(),
            row_number: 1,
            row_data: RowData::new(),
            status,
            assigned_to: None,
            request_id,
            assigned_at: None,
        }
    }

    fn request(status: RequestStatus, staff: &str) -> Request {
        Request {
            id: RequestId::new(),
            database_id: DatabaseId::new(),
            staff_id: StaffId::new(staff),
            requested_count: 1,
            status,
            created_at: Utc::now(),
            decided_at: None,
            decided_by: None,
        }
    }

    #[test]
    fn stuck_classification_follows_request_status() {
        let orphan = record(RecordStatus::Requested, None);
        assert_eq!(classify_stuck(&orphan, None), StuckClass::Orphan);

        let dangling = record(RecordStatus::Requested, Some(RequestId::new()));
        assert!(matches!(
            classify_stuck(&dangling, None),
            StuckClass::MissingRequest(_)
        ));

        for (status, action) in [
            (RequestStatus::Pending, RepairAction::None),
            (RequestStatus::Rejected, RepairAction::ToAvailable),
            (RequestStatus::Approved, RepairAction::ToAssigned),
        ] {
            let req = request(status, "alice");
            let rec = record(RecordStatus::Requested, Some(req.id));
            assert_eq!(classify_stuck(&rec, Some(&req)).action(), action);
        }
    }

    #[test]
    fn fulfilment_never_takes_records_from_live_requests() {
        let approved = request(RequestStatus::Approved, "alice");

        let mut done = record(RecordStatus::Assigned, Some(approved.id));
        done.assigned_to = Some(StaffId::new("alice"));
        assert_eq!(
            classify_fulfilment(&done, &approved, None),
            Fulfilment::Assigned
        );

        let released = record(RecordStatus::Available, None);
        assert_eq!(
            classify_fulfilment(&released, &approved, None),
            Fulfilment::Recoverable
        );

        let pending = request(RequestStatus::Pending, "bob");
        let taken = record(RecordStatus::Requested, Some(pending.id));
        assert_eq!(
            classify_fulfilment(&taken, &approved, Some(&pending)),
            Fulfilment::Blocked
        );

        let rejected = request(RequestStatus::Rejected, "bob");
        let stale = record(RecordStatus::Requested, Some(rejected.id));
        assert_eq!(
            classify_fulfilment(&stale, &approved, Some(&rejected)),
            Fulfilment::Recoverable
        );

        let excluded = record(RecordStatus::Excluded, None);
        assert_eq!(
            classify_fulfilment(&excluded, &approved, None),
            Fulfilment::Blocked
        );
    }

    #[test]
    fn fulfilment_reclaims_assignments_without_a_live_owner() {
        let approved = request(RequestStatus::Approved, "alice");

        let mut unlinked = record(RecordStatus::Assigned, None);
        unlinked.assigned_to = Some(StaffId::new("bob"));
        assert_eq!(
            classify_fulfilment(&unlinked, &approved, None),
            Fulfilment::Recoverable
        );

        let mut dangling = record(RecordStatus::Assigned, Some(RequestId::new()));
        dangling.assigned_to = Some(StaffId::new("carol"));
        assert_eq!(
            classify_fulfilment(&dangling, &approved, None),
            Fulfilment::Recoverable
        );

        let rejected = request(RequestStatus::Rejected, "bob");
        let mut stale = record(RecordStatus::Assigned, Some(rejected.id));
        stale.assigned_to = Some(StaffId::new("bob"));
        assert_eq!(
            classify_fulfilment(&stale, &approved, Some(&rejected)),
            Fulfilment::Recoverable
        );

        let mut wrong_person = record(RecordStatus::Assigned, Some(approved.id));
        wrong_person.assigned_to = Some(StaffId::new("bob"));
        assert_eq!(
            classify_fulfilment(&wrong_person, &approved, None),
            Fulfilment::Recoverable
        );

        let other = request(RequestStatus::Approved, "bob");
        let mut owned = record(RecordStatus::Assigned, Some(other.id));
        owned.assigned_to = Some(StaffId::new("bob"));
        assert_eq!(
            classify_fulfilment(&owned, &approved, Some(&other)),
            Fulfilment::Blocked
        );
    }
}
