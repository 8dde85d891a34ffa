//! Field conflicts between an incoming record and its stored copy
//!
//! Provides:
//! - Conflict detection during import (per field, rule driven)
//! - Persistence of every detected conflict, resolved or not
//! - Manual resolution and re-application of rules to open conflicts

mod detector;
mod resolver;

pub use detector::{ConflictDetector, Detection, PendingConflict};
pub use resolver::ConflictResolver;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncwrightError};
use crate::storage::{columns, fmt_ts, log_audit, AuditAction, AuditRecord};
use crate::types::EntityType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides hold different values and timestamps order them
    DataMismatch,
    /// Different values with equal (or ignored) timestamps
    VersionConflict,
    /// An incoming record lost a duplicate group to a stored record
    DuplicateKey,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::DataMismatch => "data_mismatch",
            ConflictType::VersionConflict => "version_conflict",
            ConflictType::DuplicateKey => "duplicate_key",
        }
    }
}

impl std::str::FromStr for ConflictType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "data_mismatch" => Ok(ConflictType::DataMismatch),
            "version_conflict" => Ok(ConflictType::VersionConflict),
            "duplicate_key" => Ok(ConflictType::DuplicateKey),
            _ => Err(format!("Unknown conflict type: {}", s)),
        }
    }
}

/// Which side a resolution kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    SourceWins,
    DestinationWins,
}

impl ResolutionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionAction::SourceWins => "source_wins",
            ResolutionAction::DestinationWins => "destination_wins",
        }
    }
}

impl std::str::FromStr for ResolutionAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "source_wins" | "source" => Ok(ResolutionAction::SourceWins),
            "destination_wins" | "destination" => Ok(ResolutionAction::DestinationWins),
            _ => Err(format!("Unknown resolution action: {}", s)),
        }
    }
}

/// A recorded decision point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: String,
    pub job_id: String,
    pub configuration_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    /// `None` for whole-record conflicts (duplicate keys)
    pub field: Option<String>,
    pub conflict_type: ConflictType,
    pub source_data: serde_json::Value,
    pub destination_data: serde_json::Value,
    pub resolution_required: bool,
    pub auto_resolved: bool,
    pub resolution_action: Option<ResolutionAction>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub detected_at: DateTime<Utc>,
}

impl SyncConflict {
    /// Conflict for a detected field difference, bound to a job
    pub fn from_pending(
        pending: &PendingConflict,
        job_id: &str,
        configuration_id: &str,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            configuration_id: configuration_id.to_string(),
            entity_type,
            entity_id: entity_id.to_string(),
            field: Some(pending.field.clone()),
            conflict_type: pending.conflict_type,
            source_data: pending.source.clone(),
            destination_data: pending.destination.clone(),
            resolution_required: pending.resolution_action.is_none(),
            auto_resolved: pending.resolution_action.is_some(),
            resolution_action: pending.resolution_action,
            resolved_at: pending.resolution_action.map(|_| now),
            resolved_by: pending.resolution_action.map(|_| "rules".to_string()),
            detected_at: now,
        }
    }
}

fn conflict_from_row(row: &Row) -> rusqlite::Result<SyncConflict> {
    Ok(SyncConflict {
        id: row.get("id")?,
        job_id: row.get("job_id")?,
        configuration_id: row.get("configuration_id")?,
        entity_type: columns::parsed(row, "entity_type")?,
        entity_id: row.get("entity_id")?,
        field: row.get("field")?,
        conflict_type: columns::parsed(row, "conflict_type")?,
        source_data: columns::json(row, "source_data")?,
        destination_data: columns::json(row, "destination_data")?,
        resolution_required: row.get::<_, i32>("resolution_required")? != 0,
        auto_resolved: row.get::<_, i32>("auto_resolved")? != 0,
        resolution_action: columns::parsed_opt(row, "resolution_action")?,
        resolved_at: columns::timestamp_opt(row, "resolved_at")?,
        resolved_by: row.get("resolved_by")?,
        detected_at: columns::timestamp(row, "detected_at")?,
    })
}

/// Persist a conflict and append it to the audit log
pub fn insert_conflict(conn: &Connection, conflict: &SyncConflict) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_conflicts
            (id, job_id, configuration_id, entity_type, entity_id, field, conflict_type,
             source_data, destination_data, resolution_required, auto_resolved,
             resolution_action, resolved_at, resolved_by, detected_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            conflict.id,
            conflict.job_id,
            conflict.configuration_id,
            conflict.entity_type.as_str(),
            conflict.entity_id,
            conflict.field,
            conflict.conflict_type.as_str(),
            serde_json::to_string(&conflict.source_data)?,
            serde_json::to_string(&conflict.destination_data)?,
            conflict.resolution_required as i32,
            conflict.auto_resolved as i32,
            conflict.resolution_action.map(|a| a.as_str()),
            conflict.resolved_at.as_ref().map(fmt_ts),
            conflict.resolved_by,
            fmt_ts(&conflict.detected_at)
        ],
    )?;

    log_audit(
        conn,
        &AuditRecord::new(AuditAction::ConflictDetected)
            .job(&conflict.configuration_id, &conflict.job_id)
            .entity(conflict.entity_type, &conflict.entity_id)
            .details(serde_json::json!({
                "conflict_id": conflict.id,
                "field": conflict.field,
                "conflict_type": conflict.conflict_type.as_str(),
                "resolution_required": conflict.resolution_required,
                "resolution_action": conflict.resolution_action.map(|a| a.as_str()),
            })),
    )?;
    Ok(())
}

/// Most recent conflict on one field of one record
pub fn latest_field_conflict(
    conn: &Connection,
    configuration_id: &str,
    entity_type: EntityType,
    entity_id: &str,
    field: &str,
) -> Result<Option<SyncConflict>> {
    Ok(conn
        .query_row(
            "SELECT * FROM sync_conflicts
             WHERE configuration_id = ? AND entity_type = ? AND entity_id = ? AND field = ?
             ORDER BY detected_at DESC, rowid DESC LIMIT 1",
            params![configuration_id, entity_type.as_str(), entity_id, field],
            conflict_from_row,
        )
        .optional()?)
}

/// Close an open conflict that a newer detection replaces
pub fn supersede_conflict(conn: &Connection, id: &str, superseded_by: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE sync_conflicts
         SET resolution_required = 0, resolved_at = ?, resolved_by = 'superseded'
         WHERE id = ? AND resolution_required = 1",
        params![fmt_ts(&Utc::now()), id],
    )?;
    if changed == 0 {
        return Ok(false);
    }

    let conflict = get_conflict(conn, id)?;
    log_audit(
        conn,
        &AuditRecord::new(AuditAction::ConflictResolved)
            .job(&conflict.configuration_id, &conflict.job_id)
            .entity(conflict.entity_type, &conflict.entity_id)
            .details(serde_json::json!({
                "conflict_id": id,
                "field": conflict.field,
                "resolved_by": "superseded",
                "superseded_by": superseded_by,
            })),
    )?;
    Ok(true)
}

/// Persist a detected field conflict unless the same values are already on
/// record for that field.
///
/// - an open conflict with identical values stays the one to decide
/// - an open conflict with different values is superseded by this one
/// - a closed conflict with identical values stands, unless this detection
///   resolves it differently
///
/// Returns whether a new conflict was written.
pub fn record_conflict(conn: &Connection, conflict: &SyncConflict) -> Result<bool> {
    let Some(field) = conflict.field.as_deref() else {
        insert_conflict(conn, conflict)?;
        return Ok(true);
    };

    if let Some(previous) = latest_field_conflict(
        conn,
        &conflict.configuration_id,
        conflict.entity_type,
        &conflict.entity_id,
        field,
    )? {
        let same_values = previous.source_data == conflict.source_data
            && previous.destination_data == conflict.destination_data;
        if previous.resolution_required {
            if same_values {
                return Ok(false);
            }
            supersede_conflict(conn, &previous.id, &conflict.id)?;
        } else if same_values
            && (conflict.resolution_action.is_none()
                || conflict.resolution_action == previous.resolution_action)
        {
            return Ok(false);
        }
    }

    insert_conflict(conn, conflict)?;
    Ok(true)
}

pub fn get_conflict(conn: &Connection, id: &str) -> Result<SyncConflict> {
    conn.query_row(
        "SELECT * FROM sync_conflicts WHERE id = ?",
        params![id],
        conflict_from_row,
    )
    .optional()?
    .ok_or_else(|| SyncwrightError::NotFound(format!("conflict {}", id)))
}

/// Filter for [`list_conflicts`]
#[derive(Debug, Clone, Default)]
pub struct ConflictFilter {
    pub job_id: Option<String>,
    pub configuration_id: Option<String>,
    /// Only conflicts still awaiting a decision
    pub open_only: bool,
    pub limit: Option<usize>,
}

/// Conflicts in detection order
pub fn list_conflicts(conn: &Connection, filter: &ConflictFilter) -> Result<Vec<SyncConflict>> {
    let mut sql = String::from("SELECT * FROM sync_conflicts WHERE 1=1");
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(ref job_id) = filter.job_id {
        sql.push_str(" AND job_id = ?");
        values.push(Box::new(job_id.clone()));
    }
    if let Some(ref config_id) = filter.configuration_id {
        sql.push_str(" AND configuration_id = ?");
        values.push(Box::new(config_id.clone()));
    }
    if filter.open_only {
        sql.push_str(" AND resolution_required = 1");
    }
    sql.push_str(" ORDER BY detected_at ASC, rowid ASC");
    if let Some(limit) = filter.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    let params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let conflicts = stmt
        .query_map(params.as_slice(), conflict_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(conflicts)
}

/// Close an open conflict. Returns false if it was already resolved.
pub fn mark_resolved(
    conn: &Connection,
    id: &str,
    action: ResolutionAction,
    resolved_by: &str,
    auto_resolved: bool,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE sync_conflicts
         SET resolution_required = 0, auto_resolved = ?, resolution_action = ?,
             resolved_at = ?, resolved_by = ?
         WHERE id = ? AND resolution_required = 1",
        params![
            auto_resolved as i32,
            action.as_str(),
            fmt_ts(&Utc::now()),
            resolved_by,
            id
        ],
    )?;
    if changed == 0 {
        return Ok(false);
    }

    let conflict = get_conflict(conn, id)?;
    log_audit(
        conn,
        &AuditRecord::new(AuditAction::ConflictResolved)
            .job(&conflict.configuration_id, &conflict.job_id)
            .entity(conflict.entity_type, &conflict.entity_id)
            .details(serde_json::json!({
                "conflict_id": id,
                "field": conflict.field,
                "resolution_action": action.as_str(),
                "resolved_by": resolved_by,
            })),
    )?;
    Ok(true)
}

/// Undo a resolution whose effect could not be applied
pub fn reopen_conflict(conn: &Connection, id: &str, resolved_by: &str, reason: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE sync_conflicts
         SET resolution_required = 1, auto_resolved = 0, resolution_action = NULL,
             resolved_at = NULL, resolved_by = NULL
         WHERE id = ? AND resolution_required = 0 AND resolved_by = ?",
        params![id, resolved_by],
    )?;
    if changed == 0 {
        return Ok(false);
    }

    let conflict = get_conflict(conn, id)?;
    log_audit(
        conn,
        &AuditRecord::new(AuditAction::ConflictReopened)
            .job(&conflict.configuration_id, &conflict.job_id)
            .entity(conflict.entity_type, &conflict.entity_id)
            .details(serde_json::json!({
                "conflict_id": id,
                "field": conflict.field,
                "error": reason,
            })),
    )?;
    Ok(true)
}
