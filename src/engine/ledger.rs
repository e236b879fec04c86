//! Request ledger: submission and admin decisions.
//!
//! A request moves `pending -> approved` (by decision or auto-approval) or
//! `pending -> rejected` (by decision). Both are terminal.

use std::time::Instant;

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{info, warn};

use super::record_duration;
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::model::*;
use crate::telemetry::metrics;
use crate::telemetry::pool::{record_request, record_request_transition, start_pool_span};

impl super::Engine {
    /// Ask for `count` records from a database on behalf of `staff_id`.
    ///
    /// Reserves the `count` lowest-numbered available records. If the
    /// allocation policy allows it, the request is approved and the records
    /// assigned before this returns. If the pool is too small nothing is
    /// created and [`Error::InsufficientAvailable`] is returned.
    pub fn submit(
        &mut self,
        staff_id: &StaffId,
        database_id: DatabaseId,
        count: u64,
    ) -> Result<Request> {
        let span = start_pool_span("submit", Some(database_id));
        let _entered = span.enter();
        let started = Instant::now();

        if count == 0 {
            return Err(Error::Validation(
                "requested record count must be positive".to_string(),
            ));
        }

        let request = Request {
            id: RequestId::new(),
            database_id,
            staff_id: staff_id.clone(),
            requested_count: count,
            status: RequestStatus::Pending,
            created_at: Utc::now(),
            decided_at: None,
            decided_by: None,
        };
        record_request(&span, request.id);

        let result = self.storage.with_transaction(|ctx| {
            // Checked before the request row exists so an oversized count is
            // refused as insufficient rather than tripping a column constraint.
            let available = ctx.status_counts(database_id)?.available;
            if count > available {
                return Err(Error::InsufficientAvailable {
                    database_id,
                    requested: count,
                    available,
                });
            }
            ctx.insert_request(&request)?;
            ctx.record_event(EventKind::RequestSubmitted {
                request_id: request.id,
                database_id,
                staff_id: staff_id.clone(),
                requested_count: count,
            })?;

            let reserved = ctx.reserve(database_id, count, request.id)?;

            // Evaluated once, here. Later policy changes never touch this request.
            if ctx.get_policy()?.should_auto_approve(count) {
                ctx.commit_assignment(&reserved, staff_id)?;
                ctx.decide_request(request.id, RequestStatus::Approved, &Actor::System)?;
                ctx.record_event(EventKind::RequestDecided {
                    request_id: request.id,
                    decision: Decision::Approve,
                    decided_by: Actor::System,
                })?;
            }

            ctx.get_request(request.id)
        });

        let outcome = match &result {
            Ok(r) if r.status == RequestStatus::Approved => "auto_approved",
            Ok(_) => "pending",
            Err(Error::InsufficientAvailable { .. }) => "insufficient",
            Err(_) => "error",
        };
        metrics::requests_submitted().add(1, &[KeyValue::new("result", outcome)]);
        record_duration("request.submit", started);

        let submitted = result?;
        if submitted.status == RequestStatus::Approved {
            record_request_transition(&span, "pending", "approved");
        }
        info!(
            request_id = %submitted.id,
            staff_id = %staff_id,
            count,
            status = %submitted.status,
            "request submitted"
        );
        Ok(submitted)
    }

    /// Approve or reject a pending request.
    ///
    /// Approval assigns the reserved records to the requester; rejection
    /// returns them to the pool. Deciding an already-decided request fails
    /// with [`Error::AlreadyDecided`] and changes nothing.
    pub fn decide(
        &mut self,
        request_id: RequestId,
        decision: Decision,
        admin: &StaffId,
    ) -> Result<Request> {
        let span = start_pool_span("decide", None);
        let _entered = span.enter();
        record_request(&span, request_id);
        let started = Instant::now();

        let decided = self.storage.with_transaction(|ctx| {
            let request = ctx.get_request(request_id)?;
            if request.status.is_terminal() {
                return Err(Error::AlreadyDecided {
                    request_id,
                    status: request.status,
                });
            }

            // Only records still linked to this request are acted on. A
            // reserved record that drifted away may now belong to someone
            // else; recovery deals with it after approval.
            let reserved = ctx.request_record_ids(request_id)?;
            let mut held = Vec::with_capacity(reserved.len());
            for id in &reserved {
                let record = ctx.get_record(*id)?;
                if record.request_id == Some(request_id) {
                    held.push(record.id);
                }
            }
            if held.len() != reserved.len() {
                warn!(
                    request_id = %request_id,
                    reserved = reserved.len(),
                    held = held.len(),
                    "reservation drifted before decision"
                );
            }

            match decision {
                Decision::Approve => ctx.commit_assignment(&held, &request.staff_id)?,
                Decision::Reject => {
                    ctx.release(&held)?;
                }
            }

            let decided_by = Actor::Staff(admin.clone());
            ctx.decide_request(request_id, decision.resulting_status(), &decided_by)?;
            ctx.record_event(EventKind::RequestDecided {
                request_id,
                decision,
                decided_by,
            })?;

            ctx.get_request(request_id)
        })?;

        metrics::requests_decided().add(1, &[KeyValue::new("decision", decision.to_string())]);
        record_duration("request.decide", started);
        record_request_transition(&span, "pending", decided.status.as_str());

        info!(
            request_id = %request_id,
            decision = %decision,
            admin = %admin,
            "request decided"
        );
        Ok(decided)
    }

    pub fn get_request(&self, id: RequestId) -> Result<Request> {
        self.storage.get_request(id)
    }

    /// Requests matching the filter, newest first.
    pub fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<Request>> {
        self.storage.list_requests(filter)
    }

    /// The records reserved for a request at submission, in row order.
    pub fn request_records(&self, id: RequestId) -> Result<Vec<Record>> {
        self.storage.get_request(id)?;
        self.storage
            .request_record_ids(id)?
            .into_iter()
            .map(|record_id| self.storage.get_record(record_id))
            .collect()
    }
}
