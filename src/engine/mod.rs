//! Core engine. The public API for allocating and reconciling records.
//!
//! The engine owns the storage and event stream. Every custody change goes
//! through here, in one immediate transaction per operation, so no state
//! transition bypasses the record-pool invariants.

mod auditor;
mod catalog;
mod ledger;
mod policy;
mod records;

pub use auditor::{
    RecoveryDetail, RecoveryReport, RecoverySummary, RelatedRequest, RepairAction, StuckRepair,
    StuckReport,
};

use std::path::Path;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;

use crate::config::{Config, DeletionPolicy};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::storage::Storage;
use crate::telemetry::metrics;

/// The allocation engine. Owns all state and enforces all invariants.
pub struct Engine {
    storage: Storage,
    /// What `delete_database` does with pools that still have records in custody.
    pub deletion_policy: DeletionPolicy,
}

impl Engine {
    /// Create an engine with in-memory storage (for testing).
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            storage: Storage::in_memory()?,
            deletion_policy: DeletionPolicy::default(),
        })
    }

    /// Create an engine backed by a file.
    ///
    /// Several engines (threads or processes) may open the same file;
    /// their writes are serialized by SQLite's write lock.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        Ok(Self {
            storage: Storage::open(path, busy_timeout)?,
            deletion_policy: DeletionPolicy::default(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let mut engine = Self::open(&config.database_path, config.busy_timeout)?;
        engine.deletion_policy = config.deletion_policy;
        Ok(engine)
    }

    /// Get audit events since a sequence number.
    pub fn get_events_since(&self, since_seq: u64) -> Result<Vec<Event>> {
        self.storage.get_events_since(since_seq)
    }
}

fn record_duration(operation: &'static str, started: Instant) {
    metrics::operation_duration_ms().record(
        started.elapsed().as_secs_f64() * 1000.0,
        &[KeyValue::new("operation", operation)],
    );
}

/// Treat a missing row as absent rather than as an error.
fn optional<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
