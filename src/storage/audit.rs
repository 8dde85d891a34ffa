//! Append-only audit log for sync decisions
//!
//! Deduplication groups, conflict records and job lifecycle transitions are
//! written here, keyed by job and configuration id, so every decision the
//! engine took can be inspected after the fact.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{columns, fmt_ts};
use crate::error::Result;
use crate::types::EntityType;

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub configuration_id: Option<String>,
    pub job_id: Option<String>,
    pub action: AuditAction,
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
    pub details: serde_json::Value,
}

/// Types of auditable actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    JobQueued,
    JobStarted,
    JobCompleted,
    JobFailed,
    JobCancelled,
    DuplicateGroup,
    ConflictDetected,
    ConflictResolved,
    ConflictReopened,
    EntityExported,
    ConfigurationDeleted,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::JobQueued => "job_queued",
            AuditAction::JobStarted => "job_started",
            AuditAction::JobCompleted => "job_completed",
            AuditAction::JobFailed => "job_failed",
            AuditAction::JobCancelled => "job_cancelled",
            AuditAction::DuplicateGroup => "duplicate_group",
            AuditAction::ConflictDetected => "conflict_detected",
            AuditAction::ConflictResolved => "conflict_resolved",
            AuditAction::ConflictReopened => "conflict_reopened",
            AuditAction::EntityExported => "entity_exported",
            AuditAction::ConfigurationDeleted => "configuration_deleted",
        }
    }
}

impl std::str::FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "job_queued" => Ok(AuditAction::JobQueued),
            "job_started" => Ok(AuditAction::JobStarted),
            "job_completed" => Ok(AuditAction::JobCompleted),
            "job_failed" => Ok(AuditAction::JobFailed),
            "job_cancelled" => Ok(AuditAction::JobCancelled),
            "duplicate_group" => Ok(AuditAction::DuplicateGroup),
            "conflict_detected" => Ok(AuditAction::ConflictDetected),
            "conflict_resolved" => Ok(AuditAction::ConflictResolved),
            "conflict_reopened" => Ok(AuditAction::ConflictReopened),
            "entity_exported" => Ok(AuditAction::EntityExported),
            "configuration_deleted" => Ok(AuditAction::ConfigurationDeleted),
            _ => Err(format!("Unknown audit action: {}", s)),
        }
    }
}

/// Builder-ish record passed to [`log_audit`]
#[derive(Debug, Clone)]
pub struct AuditRecord<'a> {
    pub action: AuditAction,
    pub configuration_id: Option<&'a str>,
    pub job_id: Option<&'a str>,
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<&'a str>,
    pub details: serde_json::Value,
}

impl<'a> AuditRecord<'a> {
    pub fn new(action: AuditAction) -> Self {
        Self {
            action,
            configuration_id: None,
            job_id: None,
            entity_type: None,
            entity_id: None,
            details: serde_json::json!({}),
        }
    }

    pub fn job(mut self, configuration_id: &'a str, job_id: &'a str) -> Self {
        self.configuration_id = Some(configuration_id);
        self.job_id = Some(job_id);
        self
    }

    pub fn configuration(mut self, configuration_id: &'a str) -> Self {
        self.configuration_id = Some(configuration_id);
        self
    }

    pub fn entity(mut self, entity_type: EntityType, entity_id: &'a str) -> Self {
        self.entity_type = Some(entity_type);
        self.entity_id = Some(entity_id);
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Append an audit entry
pub fn log_audit(conn: &Connection, record: &AuditRecord<'_>) -> Result<i64> {
    conn.execute(
        "INSERT INTO sync_audit_log
            (timestamp, configuration_id, job_id, action, entity_type, entity_id, details)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
            fmt_ts(&Utc::now()),
            record.configuration_id,
            record.job_id,
            record.action.as_str(),
            record.entity_type.map(|t| t.as_str()),
            record.entity_id,
            record.details.to_string(),
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

/// Filter for querying the audit log
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub configuration_id: Option<String>,
    pub job_id: Option<String>,
    pub action: Option<AuditAction>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// Query audit log entries, oldest first
pub fn query_audit_log(conn: &Connection, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
    let mut sql = String::from(
        "SELECT id, timestamp, configuration_id, job_id, action, entity_type, entity_id, details
         FROM sync_audit_log WHERE 1=1",
    );
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(ref configuration_id) = filter.configuration_id {
        sql.push_str(" AND configuration_id = ?");
        params_vec.push(Box::new(configuration_id.clone()));
    }

    if let Some(ref job_id) = filter.job_id {
        sql.push_str(" AND job_id = ?");
        params_vec.push(Box::new(job_id.clone()));
    }

    if let Some(ref action) = filter.action {
        sql.push_str(" AND action = ?");
        params_vec.push(Box::new(action.as_str().to_string()));
    }

    if let Some(ref since) = filter.since {
        sql.push_str(" AND timestamp >= ?");
        params_vec.push(Box::new(fmt_ts(since)));
    }

    sql.push_str(" ORDER BY id ASC");

    if let Some(limit) = filter.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    let params_ref: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;

    let entries = stmt
        .query_map(params_ref.as_slice(), |row| {
            Ok(AuditEntry {
                id: row.get("id")?,
                timestamp: columns::timestamp(row, "timestamp")?,
                configuration_id: row.get("configuration_id")?,
                job_id: row.get("job_id")?,
                action: columns::parsed(row, "action")?,
                entity_type: columns::parsed_opt(row, "entity_type")?,
                entity_id: row.get("entity_id")?,
                details: columns::json(row, "details")?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(entries)
}

/// Count of audit entries per action for one job
pub fn job_audit_summary(conn: &Connection, job_id: &str) -> Result<HashMap<AuditAction, i64>> {
    let mut stmt = conn.prepare(
        "SELECT action, COUNT(*) FROM sync_audit_log WHERE job_id = ? GROUP BY action",
    )?;
    let rows = stmt.query_map([job_id], |row| {
        let action: String = row.get(0)?;
        let count: i64 = row.get(1)?;
        Ok((action, count))
    })?;

    let mut summary = HashMap::new();
    for row in rows {
        let (action, count) = row?;
        if let Ok(action) = action.parse() {
            summary.insert(action, count);
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    #[test]
    fn test_audit_action_roundtrip() {
        for action in [
            AuditAction::JobStarted,
            AuditAction::DuplicateGroup,
            AuditAction::ConflictResolved,
            AuditAction::ConflictReopened,
        ] {
            let parsed: AuditAction = action.as_str().parse().unwrap();
            assert_eq!(action, parsed);
        }
    }

    #[test]
    fn test_log_and_query_by_job() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                log_audit(
                    conn,
                    &AuditRecord::new(AuditAction::JobStarted).job("cfg-1", "job-1"),
                )?;
                log_audit(
                    conn,
                    &AuditRecord::new(AuditAction::DuplicateGroup)
                        .job("cfg-1", "job-1")
                        .entity(EntityType::Products, "p1")
                        .details(serde_json::json!({"reason": "exact_key"})),
                )?;
                log_audit(
                    conn,
                    &AuditRecord::new(AuditAction::JobStarted).job("cfg-2", "job-2"),
                )?;

                let entries = query_audit_log(
                    conn,
                    &AuditFilter {
                        job_id: Some("job-1".into()),
                        ..Default::default()
                    },
                )?;
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[1].action, AuditAction::DuplicateGroup);
                assert_eq!(entries[1].entity_type, Some(EntityType::Products));
                assert_eq!(entries[1].details["reason"], "exact_key");

                let summary = job_audit_summary(conn, "job-1")?;
                assert_eq!(summary.get(&AuditAction::DuplicateGroup), Some(&1));
                Ok(())
            })
            .unwrap();
    }
}
