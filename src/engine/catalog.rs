//! Database uploads and read-only projections of the record pools.

use chrono::Utc;
use tracing::info;

use crate::config::DeletionPolicy;
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::model::*;

impl super::Engine {
    /// Register an uploaded database. Every row becomes an available record,
    /// numbered from 1 in upload order.
    pub fn create_database(&mut self, new: NewDatabase, rows: Vec<RowData>) -> Result<Database> {
        if rows.is_empty() {
            return Err(Error::Validation(format!(
                "database upload '{}' has no rows",
                new.filename
            )));
        }

        let database = Database {
            id: DatabaseId::new(),
            filename: new.filename,
            product_id: new.product_id,
            total_records: rows.len() as u64,
            uploaded_by: new.uploaded_by,
            uploaded_at: Utc::now(),
        };

        self.storage.with_transaction(|ctx| {
            ctx.insert_database(&database, &rows)?;
            ctx.record_event(EventKind::DatabaseCreated {
                database_id: database.id,
                filename: database.filename.clone(),
                total_records: database.total_records,
                uploaded_by: database.uploaded_by.clone(),
            })?;
            Ok(())
        })?;

        info!(
            database_id = %database.id,
            filename = %database.filename,
            total_records = database.total_records,
            "database created"
        );
        Ok(database)
    }

    pub fn get_database(&self, id: DatabaseId) -> Result<Database> {
        self.storage.get_database(id)
    }

    /// All databases, newest first.
    pub fn list_databases(&self) -> Result<Vec<Database>> {
        self.storage.list_databases()
    }

    /// Records of one database in row order, optionally filtered and paged.
    pub fn database_records(&self, id: DatabaseId, filter: &RecordFilter) -> Result<Vec<Record>> {
        self.storage.database_records(id, filter)
    }

    pub fn status_counts(&self, id: DatabaseId) -> Result<StatusCounts> {
        self.storage.status_counts(id)
    }

    /// Delete a database with its records and requests.
    ///
    /// Under [`DeletionPolicy::RefuseOutstanding`] this fails while any
    /// record is requested or assigned.
    pub fn delete_database(&mut self, id: DatabaseId, admin: &StaffId) -> Result<()> {
        let policy = self.deletion_policy;

        let (records_removed, requests_removed) = self.storage.with_transaction(|ctx| {
            let counts = ctx.status_counts(id)?;
            if policy == DeletionPolicy::RefuseOutstanding
                && (counts.requested > 0 || counts.assigned > 0)
            {
                return Err(Error::DatabaseInUse {
                    database_id: id,
                    requested: counts.requested,
                    assigned: counts.assigned,
                });
            }

            let removed = ctx.delete_database(id)?;
            ctx.record_event(EventKind::DatabaseDeleted {
                database_id: id,
                deleted_by: admin.clone(),
                records_removed: removed.0,
                requests_removed: removed.1,
            })?;
            Ok(removed)
        })?;

        info!(
            database_id = %id,
            admin = %admin,
            records_removed,
            requests_removed,
            "database deleted"
        );
        Ok(())
    }
}
