//! SQLite storage layer.
//!
//! Single source of truth for databases, records, requests, the allocation
//! policy and the audit event stream. WAL mode for concurrent readers; every
//! write runs in a `BEGIN IMMEDIATE` transaction so that at most one writer
//! touches a record pool at a time, across threads and processes alike.
//!
//! The record custody primitives (reserve, release, commit, force) live on
//! [`TxContext`] and are the only code that changes `records.status`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::error::{Error, Result};
use crate::event::{Event, EventKind, TransitionCause};
use crate::model::*;
use crate::telemetry::metrics;

const RECORD_COLUMNS: &str =
    "id, database_id, row_number, row_data, status, assigned_to, request_id, assigned_at";
const REQUEST_COLUMNS: &str =
    "id, database_id, staff_id, requested_count, status, created_at, decided_at, decided_by";
const DATABASE_COLUMNS: &str =
    "id, filename, product_id, total_records, uploaded_by, uploaded_at";

/// Storage backend. Owns the SQLite connection.
pub struct Storage {
    conn: Connection,
}

/// Handle for performing storage operations within a transaction.
///
/// Either everything done through one context commits together or none of
/// it does. A dropped transaction rolls back, so a caller that gives up
/// halfway leaves no partial reservation behind.
pub(crate) struct TxContext<'a> {
    tx: &'a Connection,
}

impl TxContext<'_> {
    // --- catalog ---

    pub fn insert_database(&self, database: &Database, rows: &[RowData]) -> Result<()> {
        insert_database_on(self.tx, database, rows)
    }

    pub fn get_database(&self, id: DatabaseId) -> Result<Database> {
        get_database_on(self.tx, id)
    }

    pub fn delete_database(&self, id: DatabaseId) -> Result<(u64, u64)> {
        delete_database_on(self.tx, id)
    }

    pub fn status_counts(&self, id: DatabaseId) -> Result<StatusCounts> {
        status_counts_on(self.tx, id)
    }

    pub fn get_record(&self, id: RecordId) -> Result<Record> {
        get_record_on(self.tx, id)
    }

    // --- record custody ---

    pub fn reserve(
        &self,
        database_id: DatabaseId,
        count: u64,
        request_id: RequestId,
    ) -> Result<Vec<RecordId>> {
        reserve_on(self.tx, database_id, count, request_id)
    }

    pub fn release(&self, ids: &[RecordId]) -> Result<u64> {
        release_on(self.tx, ids)
    }

    pub fn commit_assignment(&self, ids: &[RecordId], staff_id: &StaffId) -> Result<()> {
        commit_assignment_on(self.tx, ids, staff_id)
    }

    pub fn force_status(&self, id: RecordId, target: &ForceTarget) -> Result<RecordStatus> {
        force_status_on(self.tx, id, target)
    }

    pub fn set_excluded(&self, ids: &[RecordId], excluded: bool) -> Result<u64> {
        set_excluded_on(self.tx, ids, excluded)
    }

    // --- requests ---

    pub fn insert_request(&self, request: &Request) -> Result<()> {
        insert_request_on(self.tx, request)
    }

    pub fn get_request(&self, id: RequestId) -> Result<Request> {
        get_request_on(self.tx, id)
    }

    pub fn decide_request(
        &self,
        id: RequestId,
        status: RequestStatus,
        decided_by: &Actor,
    ) -> Result<()> {
        decide_request_on(self.tx, id, status, decided_by)
    }

    pub fn request_record_ids(&self, id: RequestId) -> Result<Vec<RecordId>> {
        request_record_ids_on(self.tx, id)
    }

    // --- policy / events ---

    pub fn get_policy(&self) -> Result<AllocationPolicy> {
        get_policy_on(self.tx)
    }

    pub fn put_policy(&self, policy: &AllocationPolicy) -> Result<()> {
        put_policy_on(self.tx, policy)
    }

    pub fn record_event(&self, kind: EventKind) -> Result<Event> {
        record_event_on(self.tx, kind)
    }
}

impl Storage {
    /// Open or create a database file.
    ///
    /// `busy_timeout` bounds how long a writer waits for another writer's
    /// transaction before failing with `SQLITE_BUSY`.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let mut storage = Self { conn };
        storage.init()?;
        Ok(storage)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut storage = Self { conn };
        storage.init()?;
        Ok(storage)
    }

    fn init(&mut self) -> Result<()> {
        // WAL mode for concurrent readers
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS databases (
                id              TEXT PRIMARY KEY,
                filename        TEXT NOT NULL,
                product_id      TEXT,
                total_records   INTEGER NOT NULL,
                uploaded_by     TEXT NOT NULL,
                uploaded_at     TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS records (
                id              TEXT PRIMARY KEY,
                database_id     TEXT NOT NULL REFERENCES databases(id) ON DELETE CASCADE,
                row_number      INTEGER NOT NULL,
                row_data        TEXT NOT NULL DEFAULT '{}',
                status          TEXT NOT NULL DEFAULT 'available',
                assigned_to     TEXT,
                request_id      TEXT,
                assigned_at     TEXT,
                updated_at      TEXT NOT NULL,
                UNIQUE (database_id, row_number)
            );

            CREATE INDEX IF NOT EXISTS idx_records_pool
                ON records(database_id, status, row_number);
            CREATE INDEX IF NOT EXISTS idx_records_status ON records(status);
            CREATE INDEX IF NOT EXISTS idx_records_request ON records(request_id)
                WHERE request_id IS NOT NULL;

            CREATE TABLE IF NOT EXISTS requests (
                id              TEXT PRIMARY KEY,
                database_id     TEXT NOT NULL REFERENCES databases(id) ON DELETE CASCADE,
                staff_id        TEXT NOT NULL,
                requested_count INTEGER NOT NULL CHECK (requested_count > 0),
                status          TEXT NOT NULL DEFAULT 'pending',
                created_at      TEXT NOT NULL,
                decided_at      TEXT,
                decided_by      TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_requests_status ON requests(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_requests_staff ON requests(staff_id, created_at);

            CREATE TABLE IF NOT EXISTS request_records (
                request_id      TEXT NOT NULL REFERENCES requests(id) ON DELETE CASCADE,
                record_id       TEXT NOT NULL REFERENCES records(id) ON DELETE CASCADE,
                PRIMARY KEY (request_id, record_id)
            );

            CREATE INDEX IF NOT EXISTS idx_request_records_record
                ON request_records(record_id);

            CREATE TABLE IF NOT EXISTS allocation_policy (
                id                      INTEGER PRIMARY KEY CHECK (id = 1),
                enabled                 INTEGER NOT NULL DEFAULT 0,
                max_records_per_request INTEGER CHECK (max_records_per_request > 0),
                updated_at              TEXT,
                updated_by              TEXT
            );

            CREATE TABLE IF NOT EXISTS events (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp   TEXT NOT NULL,
                kind        TEXT NOT NULL
            );
            ",
        )?;

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Execute a closure within an immediate (write-locked) transaction.
    ///
    /// The transaction commits if the closure returns Ok, rolls back on Err.
    pub(crate) fn with_transaction<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut TxContext) -> Result<T>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut ctx = TxContext { tx: &tx };
        let result = f(&mut ctx)?;
        tx.commit()?;
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get_database(&self, id: DatabaseId) -> Result<Database> {
        get_database_on(&self.conn, id)
    }

    /// All databases, newest upload first.
    pub fn list_databases(&self) -> Result<Vec<Database>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DATABASE_COLUMNS} FROM databases ORDER BY uploaded_at DESC, rowid DESC"
        ))?;
        let databases = stmt
            .query_map([], row_to_database)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(databases)
    }

    pub fn status_counts(&self, id: DatabaseId) -> Result<StatusCounts> {
        status_counts_on(&self.conn, id)
    }

    pub fn get_record(&self, id: RecordId) -> Result<Record> {
        get_record_on(&self.conn, id)
    }

    /// A page of a database's records in row order.
    pub fn database_records(&self, id: DatabaseId, filter: &RecordFilter) -> Result<Vec<Record>> {
        get_database_on(&self.conn, id)?;

        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM records
             WHERE database_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY row_number ASC
             LIMIT ?3 OFFSET ?4"
        ))?;
        let records = stmt
            .query_map(
                params![
                    id.to_string(),
                    filter.status.map(RecordStatus::as_str),
                    limit,
                    filter.offset as i64,
                ],
                row_to_record,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn records_with_status(
        &self,
        status: RecordStatus,
        database_id: Option<DatabaseId>,
    ) -> Result<Vec<Record>> {
        records_with_status_on(&self.conn, status, database_id)
    }

    pub fn get_request(&self, id: RequestId) -> Result<Request> {
        get_request_on(&self.conn, id)
    }

    pub fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<Request>> {
        list_requests_on(&self.conn, filter)
    }

    pub fn request_record_ids(&self, id: RequestId) -> Result<Vec<RecordId>> {
        request_record_ids_on(&self.conn, id)
    }

    pub fn get_policy(&self) -> Result<AllocationPolicy> {
        get_policy_on(&self.conn)
    }

    /// Get events since a sequence number.
    pub fn get_events_since(&self, since_seq: u64) -> Result<Vec<Event>> {
        let mut stmt = self
            .conn
            .prepare("SELECT seq, timestamp, kind FROM events WHERE seq > ?1 ORDER BY seq ASC")?;

        let events = stmt
            .query_map(params![since_seq as i64], |row| {
                let kind_str: String = row.get(2)?;
                Ok(Event {
                    seq: row.get::<_, i64>(0)? as u64,
                    timestamp: parse_at(row, 1)?,
                    kind: serde_json::from_str(&kind_str)
                        .unwrap_or(EventKind::Unknown { raw: kind_str }),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(events)
    }
}

// ---------------------------------------------------------------------------
// Inner functions. They accept &Connection so they work with both
// Connection (auto-commit) and Transaction (deref to Connection).
// ---------------------------------------------------------------------------

fn insert_database_on(conn: &Connection, database: &Database, rows: &[RowData]) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO databases ({DATABASE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
        params![
            database.id.to_string(),
            database.filename,
            database.product_id,
            database.total_records as i64,
            database.uploaded_by.as_str(),
            database.uploaded_at.to_rfc3339(),
        ],
    )?;

    let now = database.uploaded_at.to_rfc3339();
    let mut stmt = conn.prepare_cached(
        "INSERT INTO records (id, database_id, row_number, row_data, status, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'available', ?5)",
    )?;
    for (idx, row) in rows.iter().enumerate() {
        stmt.execute(params![
            RecordId::new().to_string(),
            database.id.to_string(),
            (idx + 1) as i64,
            serde_json::to_string(row)?,
            now,
        ])?;
    }
    Ok(())
}

fn get_database_on(conn: &Connection, id: DatabaseId) -> Result<Database> {
    conn.query_row(
        &format!("SELECT {DATABASE_COLUMNS} FROM databases WHERE id = ?1"),
        params![id.to_string()],
        row_to_database,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("database {id}")))
}

/// Delete a database and everything hanging off it. Returns the number
/// of records and requests removed.
fn delete_database_on(conn: &Connection, id: DatabaseId) -> Result<(u64, u64)> {
    let counts = status_counts_on(conn, id)?;
    let requests: i64 = conn.query_row(
        "SELECT COUNT(*) FROM requests WHERE database_id = ?1",
        params![id.to_string()],
        |row| row.get(0),
    )?;

    // request_records and records cascade through the foreign keys
    conn.execute(
        "DELETE FROM databases WHERE id = ?1",
        params![id.to_string()],
    )?;

    Ok((counts.total_records, requests as u64))
}

fn status_counts_on(conn: &Connection, id: DatabaseId) -> Result<StatusCounts> {
    let database = get_database_on(conn, id)?;
    let mut counts = StatusCounts {
        total_records: database.total_records,
        ..Default::default()
    };

    let mut stmt = conn.prepare_cached(
        "SELECT status, COUNT(*) FROM records WHERE database_id = ?1 GROUP BY status",
    )?;
    let rows = stmt
        .query_map(params![id.to_string()], |row| {
            Ok((parse_at::<RecordStatus>(row, 0)?, row.get::<_, i64>(1)? as u64))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for (status, n) in rows {
        match status {
            RecordStatus::Available => counts.available = n,
            RecordStatus::Requested => counts.requested = n,
            RecordStatus::Assigned => counts.assigned = n,
            RecordStatus::Excluded => counts.excluded = n,
        }
    }
    Ok(counts)
}

fn get_record_on(conn: &Connection, id: RecordId) -> Result<Record> {
    conn.query_row(
        &format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1"),
        params![id.to_string()],
        row_to_record,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("record {id}")))
}

fn get_records_on(conn: &Connection, ids: &[RecordId]) -> Result<Vec<Record>> {
    ids.iter().map(|id| get_record_on(conn, *id)).collect()
}

fn records_with_status_on(
    conn: &Connection,
    status: RecordStatus,
    database_id: Option<DatabaseId>,
) -> Result<Vec<Record>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {RECORD_COLUMNS} FROM records
         WHERE status = ?1 AND (?2 IS NULL OR database_id = ?2)
         ORDER BY database_id ASC, row_number ASC"
    ))?;
    let records = stmt
        .query_map(
            params![status.as_str(), database_id.map(|id| id.to_string())],
            row_to_record,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Flip the `count` lowest-numbered available records of a database to
/// requested under `request_id`. All or nothing.
fn reserve_on(
    conn: &Connection,
    database_id: DatabaseId,
    count: u64,
    request_id: RequestId,
) -> Result<Vec<RecordId>> {
    let available = status_counts_on(conn, database_id)?.available;
    if count > available {
        return Err(Error::InsufficientAvailable {
            database_id,
            requested: count,
            available,
        });
    }

    let mut select = conn.prepare_cached(
        "SELECT id FROM records
         WHERE database_id = ?1 AND status = 'available'
         ORDER BY row_number ASC
         LIMIT ?2",
    )?;
    let ids = select
        .query_map(params![database_id.to_string(), count as i64], |row| {
            parse_at::<RecordId>(row, 0)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let now = Utc::now().to_rfc3339();
    let mut update = conn.prepare_cached(
        "UPDATE records
         SET status = 'requested', request_id = ?1, assigned_to = NULL, assigned_at = NULL,
             updated_at = ?2
         WHERE id = ?3 AND status = 'available'",
    )?;
    let mut link = conn
        .prepare_cached("INSERT INTO request_records (request_id, record_id) VALUES (?1, ?2)")?;

    for id in &ids {
        if update.execute(params![request_id.to_string(), now, id.to_string()])? != 1 {
            return Err(Error::InvalidTransition {
                record_id: *id,
                from: get_record_on(conn, *id)?.status,
                to: RecordStatus::Requested,
            });
        }
        link.execute(params![request_id.to_string(), id.to_string()])?;
    }

    record_transition_on(
        conn,
        TransitionGroup {
            database_id,
            from: RecordStatus::Available,
            request_id: Some(request_id),
        },
        ids.clone(),
        RecordStatus::Requested,
        TransitionCause::Reserve,
    )?;

    Ok(ids)
}

/// Return records to the pool. Already-available records are left alone.
fn release_on(conn: &Connection, ids: &[RecordId]) -> Result<u64> {
    let records = get_records_on(conn, ids)?;
    for record in &records {
        if record.status == RecordStatus::Excluded {
            return Err(Error::InvalidTransition {
                record_id: record.id,
                from: record.status,
                to: RecordStatus::Available,
            });
        }
    }

    let moved: Vec<&Record> = records
        .iter()
        .filter(|r| r.status != RecordStatus::Available)
        .collect();

    let now = Utc::now().to_rfc3339();
    let mut update = conn.prepare_cached(
        "UPDATE records
         SET status = 'available', request_id = NULL, assigned_to = NULL, assigned_at = NULL,
             updated_at = ?1
         WHERE id = ?2",
    )?;
    for record in &moved {
        update.execute(params![now, record.id.to_string()])?;
    }

    log_transitions_on(
        conn,
        &moved,
        RecordStatus::Available,
        TransitionCause::Release,
    )?;
    Ok(moved.len() as u64)
}

/// requested -> assigned for every record, or fail without touching any.
fn commit_assignment_on(conn: &Connection, ids: &[RecordId], staff_id: &StaffId) -> Result<()> {
    let records = get_records_on(conn, ids)?;
    if let Some(bad) = records
        .iter()
        .find(|r| r.status != RecordStatus::Requested)
    {
        return Err(Error::InvalidTransition {
            record_id: bad.id,
            from: bad.status,
            to: RecordStatus::Assigned,
        });
    }

    let now = Utc::now().to_rfc3339();
    let mut update = conn.prepare_cached(
        "UPDATE records
         SET status = 'assigned', assigned_to = ?1, assigned_at = ?2, updated_at = ?2
         WHERE id = ?3 AND status = 'requested'",
    )?;
    for record in &records {
        update.execute(params![staff_id.as_str(), now, record.id.to_string()])?;
    }

    let refs: Vec<&Record> = records.iter().collect();
    log_transitions_on(conn, &refs, RecordStatus::Assigned, TransitionCause::Commit)
}

/// Out-of-band correction. Returns the status the record had before.
fn force_status_on(conn: &Connection, id: RecordId, target: &ForceTarget) -> Result<RecordStatus> {
    let record = get_record_on(conn, id)?;
    let now = Utc::now().to_rfc3339();

    match target {
        ForceTarget::Available => {
            conn.execute(
                "UPDATE records
                 SET status = 'available', request_id = NULL, assigned_to = NULL,
                     assigned_at = NULL, updated_at = ?1
                 WHERE id = ?2",
                params![now, id.to_string()],
            )?;
        }
        ForceTarget::Assigned {
            staff_id,
            request_id,
        } => {
            conn.execute(
                "UPDATE records
                 SET status = 'assigned', request_id = ?1, assigned_to = ?2,
                     assigned_at = ?3, updated_at = ?3
                 WHERE id = ?4",
                params![request_id.to_string(), staff_id.as_str(), now, id.to_string()],
            )?;
        }
    }

    let request_id = match target {
        ForceTarget::Available => record.request_id,
        ForceTarget::Assigned { request_id, .. } => Some(*request_id),
    };
    record_transition_on(
        conn,
        TransitionGroup {
            database_id: record.database_id,
            from: record.status,
            request_id,
        },
        vec![id],
        target.status(),
        TransitionCause::Repair,
    )?;

    Ok(record.status)
}

/// available <-> excluded.
fn set_excluded_on(conn: &Connection, ids: &[RecordId], excluded: bool) -> Result<u64> {
    let (from, to, cause) = if excluded {
        (
            RecordStatus::Available,
            RecordStatus::Excluded,
            TransitionCause::Exclude,
        )
    } else {
        (
            RecordStatus::Excluded,
            RecordStatus::Available,
            TransitionCause::Restore,
        )
    };

    let records = get_records_on(conn, ids)?;
    if let Some(bad) = records.iter().find(|r| r.status != from && r.status != to) {
        return Err(Error::InvalidTransition {
            record_id: bad.id,
            from: bad.status,
            to,
        });
    }
    let moved: Vec<&Record> = records.iter().filter(|r| r.status == from).collect();

    let now = Utc::now().to_rfc3339();
    let mut update =
        conn.prepare_cached("UPDATE records SET status = ?1, updated_at = ?2 WHERE id = ?3")?;
    for record in &moved {
        update.execute(params![to.as_str(), now, record.id.to_string()])?;
    }

    log_transitions_on(conn, &moved, to, cause)?;
    Ok(moved.len() as u64)
}

fn insert_request_on(conn: &Connection, request: &Request) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO requests ({REQUEST_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
        params![
            request.id.to_string(),
            request.database_id.to_string(),
            request.staff_id.as_str(),
            i64::try_from(request.requested_count).map_err(|_| Error::Validation(format!(
                "requested count {} is out of range",
                request.requested_count
            )))?,
            request.status.as_str(),
            request.created_at.to_rfc3339(),
            request.decided_at.map(|t| t.to_rfc3339()),
            request.decided_by.as_ref().map(Actor::to_column),
        ],
    )?;
    Ok(())
}

fn get_request_on(conn: &Connection, id: RequestId) -> Result<Request> {
    conn.query_row(
        &format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = ?1"),
        params![id.to_string()],
        row_to_request,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("request {id}")))
}

/// pending -> approved | rejected, with optimistic check on the source state.
fn decide_request_on(
    conn: &Connection,
    id: RequestId,
    status: RequestStatus,
    decided_by: &Actor,
) -> Result<()> {
    let current = get_request_on(conn, id)?;
    if !current.status.can_transition_to(status) {
        return Err(Error::AlreadyDecided {
            request_id: id,
            status: current.status,
        });
    }

    let rows_affected = conn.execute(
        "UPDATE requests SET status = ?1, decided_at = ?2, decided_by = ?3
         WHERE id = ?4 AND status = 'pending'",
        params![
            status.as_str(),
            Utc::now().to_rfc3339(),
            decided_by.to_column(),
            id.to_string(),
        ],
    )?;

    if rows_affected == 0 {
        return Err(Error::AlreadyDecided {
            request_id: id,
            status: current.status,
        });
    }
    Ok(())
}

fn request_record_ids_on(conn: &Connection, id: RequestId) -> Result<Vec<RecordId>> {
    let mut stmt = conn.prepare_cached(
        "SELECT rr.record_id FROM request_records rr
         JOIN records r ON r.id = rr.record_id
         WHERE rr.request_id = ?1
         ORDER BY r.row_number ASC",
    )?;
    let ids = stmt
        .query_map(params![id.to_string()], |row| parse_at::<RecordId>(row, 0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn list_requests_on(conn: &Connection, filter: &RequestFilter) -> Result<Vec<Request>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {REQUEST_COLUMNS} FROM requests
         WHERE (?1 IS NULL OR staff_id = ?1)
           AND (?2 IS NULL OR database_id = ?2)
           AND (?3 IS NULL OR status = ?3)
         ORDER BY created_at DESC, rowid DESC"
    ))?;
    let requests = stmt
        .query_map(
            params![
                filter.staff_id.as_ref().map(StaffId::as_str),
                filter.database_id.map(|id| id.to_string()),
                filter.status.map(RequestStatus::as_str),
            ],
            row_to_request,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(requests)
}

fn get_policy_on(conn: &Connection) -> Result<AllocationPolicy> {
    let policy = conn
        .query_row(
            "SELECT enabled, max_records_per_request, updated_at, updated_by
             FROM allocation_policy WHERE id = 1",
            [],
            |row| {
                Ok(AllocationPolicy {
                    enabled: row.get(0)?,
                    max_records_per_request: row.get::<_, Option<i64>>(1)?.map(|n| n as u64),
                    updated_at: parse_opt_at(row, 2)?,
                    updated_by: row.get::<_, Option<String>>(3)?.map(StaffId),
                })
            },
        )
        .optional()?;
    Ok(policy.unwrap_or_default())
}

fn put_policy_on(conn: &Connection, policy: &AllocationPolicy) -> Result<()> {
    conn.execute(
        "INSERT INTO allocation_policy (id, enabled, max_records_per_request, updated_at, updated_by)
         VALUES (1, ?1, ?2, ?3, ?4)
         ON CONFLICT (id) DO UPDATE SET
            enabled = excluded.enabled,
            max_records_per_request = excluded.max_records_per_request,
            updated_at = excluded.updated_at,
            updated_by = excluded.updated_by",
        params![
            policy.enabled,
            policy.max_records_per_request.map(|n| n as i64),
            policy.updated_at.map(|t| t.to_rfc3339()),
            policy.updated_by.as_ref().map(StaffId::as_str),
        ],
    )?;
    Ok(())
}

fn record_event_on(conn: &Connection, kind: EventKind) -> Result<Event> {
    let now = Utc::now();

    conn.execute(
        "INSERT INTO events (timestamp, kind) VALUES (?1, ?2)",
        params![now.to_rfc3339(), serde_json::to_string(&kind)?],
    )?;

    let seq = conn.last_insert_rowid();

    Ok(Event {
        seq: seq as u64,
        timestamp: now,
        kind,
    })
}

// ---------------------------------------------------------------------------
// Transition audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TransitionGroup {
    database_id: DatabaseId,
    from: RecordStatus,
    request_id: Option<RequestId>,
}

/// Log a batch of moved records, one event per (database, from, request).
fn log_transitions_on(
    conn: &Connection,
    moved: &[&Record],
    to: RecordStatus,
    cause: TransitionCause,
) -> Result<()> {
    let mut groups: BTreeMap<TransitionGroup, Vec<RecordId>> = BTreeMap::new();
    for record in moved {
        groups
            .entry(TransitionGroup {
                database_id: record.database_id,
                from: record.status,
                request_id: record.request_id,
            })
            .or_default()
            .push(record.id);
    }

    for (group, ids) in groups {
        record_transition_on(conn, group, ids, to, cause)?;
    }
    Ok(())
}

fn record_transition_on(
    conn: &Connection,
    group: TransitionGroup,
    record_ids: Vec<RecordId>,
    to: RecordStatus,
    cause: TransitionCause,
) -> Result<()> {
    if record_ids.is_empty() {
        return Ok(());
    }

    tracing::debug!(
        database_id = %group.database_id,
        from = %group.from,
        to = %to,
        count = record_ids.len(),
        ?cause,
        "record_transition"
    );
    metrics::record_transitions().add(
        record_ids.len() as u64,
        &[
            KeyValue::new("from", group.from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );

    record_event_on(
        conn,
        EventKind::RecordsTransitioned {
            database_id: group.database_id,
            record_ids,
            from: group.from,
            to,
            request_id: group.request_id,
            cause,
        },
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row parsing helpers
// ---------------------------------------------------------------------------

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_at<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn parse_opt_at<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    row.get::<_, Option<String>>(idx)?
        .map(|raw| raw.parse().map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn row_to_database(row: &rusqlite::Row) -> rusqlite::Result<Database> {
    Ok(Database {
        id: parse_at(row, 0)?,
        filename: row.get(1)?,
        product_id: row.get(2)?,
        total_records: row.get::<_, i64>(3)? as u64,
        uploaded_by: StaffId(row.get(4)?),
        uploaded_at: parse_at::<DateTime<Utc>>(row, 5)?,
    })
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<Record> {
    let row_data: String = row.get(3)?;
    Ok(Record {
        id: parse_at(row, 0)?,
        database_id: parse_at(row, 1)?,
        row_number: row.get::<_, i64>(2)? as u64,
        row_data: serde_json::from_str(&row_data).map_err(|e| conversion_error(3, e))?,
        status: parse_at(row, 4)?,
        assigned_to: row.get::<_, Option<String>>(5)?.map(StaffId),
        request_id: parse_opt_at(row, 6)?,
        assigned_at: parse_opt_at(row, 7)?,
    })
}

fn row_to_request(row: &rusqlite::Row) -> rusqlite::Result<Request> {
    Ok(Request {
        id: parse_at(row, 0)?,
        database_id: parse_at(row, 1)?,
        staff_id: StaffId(row.get(2)?),
        requested_count: row.get::<_, i64>(3)? as u64,
        status: parse_at(row, 4)?,
        created_at: parse_at(row, 5)?,
        decided_at: parse_opt_at(row, 6)?,
        decided_by: row
            .get::<_, Option<String>>(7)?
            .map(|raw| Actor::from_column(&raw).map_err(|e| conversion_error(7, e)))
            .transpose()?,
    })
}
