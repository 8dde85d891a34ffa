//! Storage engine for Syncwright
//!
//! Handles SQLite database operations, WAL mode, and schema management.

mod audit;
pub(crate) mod columns;
mod connection;
pub mod entities;
mod migrations;

pub use audit::*;
pub use connection::{Storage, StorageStatus};
pub use entities::{EntityFilter, EntityStore, SqliteEntityStore, UpsertOutcome};
pub use migrations::{schema_version, SCHEMA_VERSION};

use chrono::{DateTime, SecondsFormat, Utc};

/// Fixed-width RFC 3339 so timestamp columns compare correctly as text
pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
