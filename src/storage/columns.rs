//! Typed reads of TEXT columns
//!
//! Enums, JSON and timestamps are stored as text. A value that no longer
//! parses is reported as `FromSqlConversionFailure` so a damaged row fails
//! the read instead of passing for a different record.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::Row;
use serde::de::DeserializeOwned;
use std::fmt::Display;
use std::str::FromStr;

use crate::types::parse_timestamp;

fn conversion_error(row: &Row, column: &str, message: String) -> rusqlite::Error {
    let index = row.as_ref().column_index(column).unwrap_or(0);
    rusqlite::Error::FromSqlConversionFailure(
        index,
        Type::Text,
        format!("{}: {}", column, message).into(),
    )
}

/// Column parsed through `FromStr`
pub(crate) fn parsed<T>(row: &Row, column: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: String = row.get(column)?;
    raw.parse()
        .map_err(|e: T::Err| conversion_error(row, column, e.to_string()))
}

pub(crate) fn parsed_opt<T>(row: &Row, column: &str) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: Option<String> = row.get(column)?;
    raw.map(|raw| {
        raw.parse()
            .map_err(|e: T::Err| conversion_error(row, column, e.to_string()))
    })
    .transpose()
}

/// Column holding a JSON document
pub(crate) fn json<T: DeserializeOwned>(row: &Row, column: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(row, column, e.to_string()))
}

pub(crate) fn timestamp(row: &Row, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    parse_timestamp(&raw)
        .ok_or_else(|| conversion_error(row, column, format!("invalid timestamp {:?}", raw)))
}

pub(crate) fn timestamp_opt(row: &Row, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|raw| {
        parse_timestamp(&raw)
            .ok_or_else(|| conversion_error(row, column, format!("invalid timestamp {:?}", raw)))
    })
    .transpose()
}
