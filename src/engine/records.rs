//! Admin-facing record custody operations.
//!
//! Reservation, commit and forced correction are only reachable through
//! the ledger and the auditor; these are the moves an admin may make on
//! individual records directly.

use tracing::info;

use crate::error::Result;
use crate::model::{Record, RecordId};

impl super::Engine {
    pub fn get_record(&self, id: RecordId) -> Result<Record> {
        self.storage.get_record(id)
    }

    /// Return records to the available pool, clearing their request and
    /// assignee. Records that are already available are skipped.
    ///
    /// Returns how many records actually moved.
    pub fn release_records(&mut self, ids: &[RecordId]) -> Result<u64> {
        let released = self.storage.with_transaction(|ctx| ctx.release(ids))?;
        info!(requested = ids.len(), released, "records released");
        Ok(released)
    }

    /// Withhold available records from allocation.
    pub fn exclude_records(&mut self, ids: &[RecordId]) -> Result<u64> {
        let excluded = self
            .storage
            .with_transaction(|ctx| ctx.set_excluded(ids, true))?;
        info!(excluded, "records excluded");
        Ok(excluded)
    }

    /// Put excluded records back into the available pool.
    pub fn restore_records(&mut self, ids: &[RecordId]) -> Result<u64> {
        let restored = self
            .storage
            .with_transaction(|ctx| ctx.set_excluded(ids, false))?;
        info!(restored, "records restored");
        Ok(restored)
    }
}
