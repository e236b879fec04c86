//! # leadpool
//!
//! Allocation engine for pools of customer-contact records.
//!
//! Staff draw records from uploaded databases by submitting requests; admins
//! approve or reject them, optionally bypassed by an auto-approve policy. The
//! engine tracks each record's custody status, serializes all writes to a
//! pool, and can diagnose and repair drift between record status and request
//! status left behind by crashes or manual edits.

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
mod storage;
pub mod telemetry;
