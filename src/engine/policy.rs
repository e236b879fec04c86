//! Auto-approve policy.
//!
//! The policy is a persisted single-row entity rather than process state,
//! so every engine sharing a database file sees the same configuration.

use chrono::Utc;
use tracing::info;

use crate::error::Result;
use crate::event::EventKind;
use crate::model::{AllocationPolicy, PolicyUpdate, StaffId};

impl super::Engine {
    pub fn get_policy(&self) -> Result<AllocationPolicy> {
        self.storage.get_policy()
    }

    /// Replace the policy. A non-positive limit is a validation error.
    ///
    /// Pending requests are unaffected; the policy is only consulted at
    /// submission time.
    pub fn set_policy(&mut self, update: PolicyUpdate, admin: &StaffId) -> Result<AllocationPolicy> {
        let max_records_per_request = update.validate()?;
        let policy = AllocationPolicy {
            enabled: update.enabled,
            max_records_per_request,
            updated_at: Some(Utc::now()),
            updated_by: Some(admin.clone()),
        };

        self.storage.with_transaction(|ctx| {
            ctx.put_policy(&policy)?;
            ctx.record_event(EventKind::PolicyUpdated {
                enabled: policy.enabled,
                max_records_per_request: policy.max_records_per_request,
                updated_by: admin.clone(),
            })?;
            Ok(())
        })?;

        info!(
            enabled = policy.enabled,
            max_records_per_request = ?policy.max_records_per_request,
            admin = %admin,
            "allocation policy updated"
        );
        Ok(policy)
    }

    /// Would a request for `count` records be approved without review
    /// under the current policy?
    pub fn should_auto_approve(&self, count: u64) -> Result<bool> {
        Ok(self.storage.get_policy()?.should_auto_approve(count))
    }
}
