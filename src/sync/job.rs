//! Sync jobs: one execution of a configuration
//!
//! Every status change is a conditional single-row update guarded on the
//! current status, so terminal statuses are never overwritten.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::config::SyncConfiguration;
use super::conflict::{list_conflicts, ConflictFilter, SyncConflict};
use crate::error::{Result, SyncwrightError};
use crate::storage::{columns, fmt_ts, log_audit, AuditAction, AuditRecord};
use crate::types::{parse_timestamp, EntityType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    FullSync,
    #[default]
    Incremental,
    /// Re-apply conflict rules to open conflicts
    ConflictResolution,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FullSync => "full_sync",
            JobType::Incremental => "incremental",
            JobType::ConflictResolution => "conflict_resolution",
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "full_sync" | "full" => Ok(JobType::FullSync),
            "incremental" => Ok(JobType::Incremental),
            "conflict_resolution" => Ok(JobType::ConflictResolution),
            _ => Err(format!("Unknown job type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl JobPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
            JobPriority::Critical => "critical",
        }
    }

    /// Work queue priority (higher runs first)
    pub fn queue_priority(&self) -> i32 {
        match self {
            JobPriority::Low => 0,
            JobPriority::Normal => 5,
            JobPriority::High => 10,
            JobPriority::Critical => 20,
        }
    }
}

impl std::str::FromStr for JobPriority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(JobPriority::Low),
            "normal" => Ok(JobPriority::Normal),
            "high" => Ok(JobPriority::High),
            "critical" => Ok(JobPriority::Critical),
            _ => Err(format!("Unknown job priority: {}", s)),
        }
    }
}

/// Entity-level failure; the job keeps going
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncError {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl SyncError {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Counters persisted while a job runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub total_items: i64,
    pub processed_items: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub conflict_count: i64,
}

impl JobCounters {
    pub fn progress_percentage(&self) -> i64 {
        if self.total_items <= 0 {
            return 0;
        }
        ((self.processed_items * 100) / self.total_items).clamp(0, 100)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: String,
    pub configuration_id: String,
    pub adapter_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress_percentage: i64,
    pub counters: JobCounters,
    pub cancel_requested: bool,
    pub error_message: Option<String>,
    #[serde(default)]
    pub errors: Vec<SyncError>,
    #[serde(default)]
    pub conflicts: Vec<SyncConflict>,
}

fn job_from_row(row: &Row) -> rusqlite::Result<SyncJob> {
    Ok(SyncJob {
        id: row.get("id")?,
        configuration_id: row.get("configuration_id")?,
        adapter_id: row.get("adapter_id")?,
        job_type: columns::parsed(row, "job_type")?,
        status: columns::parsed(row, "status")?,
        priority: columns::parsed(row, "priority")?,
        scheduled_at: columns::timestamp(row, "scheduled_at")?,
        started_at: columns::timestamp_opt(row, "started_at")?,
        completed_at: columns::timestamp_opt(row, "completed_at")?,
        progress_percentage: row.get("progress_percentage")?,
        counters: JobCounters {
            total_items: row.get("total_items")?,
            processed_items: row.get("processed_items")?,
            success_count: row.get("success_count")?,
            error_count: row.get("error_count")?,
            conflict_count: row.get("conflict_count")?,
        },
        cancel_requested: row.get::<_, i32>("cancel_requested")? != 0,
        error_message: row.get("error_message")?,
        errors: Vec::new(),
        conflicts: Vec::new(),
    })
}

/// Create a queued job for a configuration
pub fn create_job(
    conn: &Connection,
    config: &SyncConfiguration,
    job_type: JobType,
    priority: JobPriority,
) -> Result<SyncJob> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now();
    conn.execute(
        "INSERT INTO sync_jobs
            (id, configuration_id, adapter_id, job_type, status, priority, scheduled_at)
         VALUES (?, ?, ?, ?, 'queued', ?, ?)",
        params![
            id,
            config.id,
            config.adapter_id,
            job_type.as_str(),
            priority.as_str(),
            fmt_ts(&now)
        ],
    )?;

    log_audit(
        conn,
        &AuditRecord::new(AuditAction::JobQueued)
            .job(&config.id, &id)
            .details(serde_json::json!({
                "job_type": job_type.as_str(),
                "priority": priority.as_str(),
            })),
    )?;

    get_job_row(conn, &id)
}

fn get_job_row(conn: &Connection, id: &str) -> Result<SyncJob> {
    conn.query_row("SELECT * FROM sync_jobs WHERE id = ?", params![id], job_from_row)
        .optional()?
        .ok_or_else(|| SyncwrightError::NotFound(format!("sync job {}", id)))
}

/// Job with its errors and conflicts
pub fn get_job(conn: &Connection, id: &str) -> Result<SyncJob> {
    let mut job = get_job_row(conn, id)?;
    job.errors = list_job_errors(conn, id)?;
    job.conflicts = list_conflicts(
        conn,
        &ConflictFilter {
            job_id: Some(id.to_string()),
            ..Default::default()
        },
    )?;
    Ok(job)
}

/// Filter for [`list_jobs`]
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub configuration_id: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

/// Jobs without their error/conflict lists, newest first
pub fn list_jobs(conn: &Connection, filter: &JobFilter) -> Result<Vec<SyncJob>> {
    let mut sql = String::from("SELECT * FROM sync_jobs WHERE 1=1");
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(ref config_id) = filter.configuration_id {
        sql.push_str(" AND configuration_id = ?");
        values.push(Box::new(config_id.clone()));
    }
    if let Some(status) = filter.status {
        sql.push_str(" AND status = ?");
        values.push(Box::new(status.as_str().to_string()));
    }
    sql.push_str(" ORDER BY scheduled_at DESC, rowid DESC");
    if let Some(limit) = filter.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    let params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let jobs = stmt
        .query_map(params.as_slice(), job_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(jobs)
}

/// True when a job for the configuration is queued or running
pub fn has_active_job(conn: &Connection, configuration_id: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sync_jobs
         WHERE configuration_id = ? AND status IN ('queued', 'running')",
        params![configuration_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Claim a queued job: `queued → running`. Returns false if it was not queued.
pub fn start_job(conn: &Connection, id: &str, at: DateTime<Utc>) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE sync_jobs SET status = 'running', started_at = ?
         WHERE id = ? AND status = 'queued'",
        params![fmt_ts(&at), id],
    )?;
    Ok(changed > 0)
}

/// Persist counters of a running job
pub fn update_progress(conn: &Connection, id: &str, counters: &JobCounters) -> Result<()> {
    conn.execute(
        "UPDATE sync_jobs
         SET total_items = ?, processed_items = ?, success_count = ?, error_count = ?,
             conflict_count = ?, progress_percentage = ?
         WHERE id = ? AND status = 'running'",
        params![
            counters.total_items,
            counters.processed_items,
            counters.success_count,
            counters.error_count,
            counters.conflict_count,
            counters.progress_percentage(),
            id
        ],
    )?;
    Ok(())
}

/// Append an entity-level error
pub fn record_error(conn: &Connection, job_id: &str, error: &SyncError) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_job_errors (job_id, entity_type, entity_id, message, timestamp)
         VALUES (?, ?, ?, ?, ?)",
        params![
            job_id,
            error.entity_type.as_str(),
            error.entity_id,
            error.message,
            fmt_ts(&error.timestamp)
        ],
    )?;
    Ok(())
}

pub fn list_job_errors(conn: &Connection, job_id: &str) -> Result<Vec<SyncError>> {
    let mut stmt = conn.prepare(
        "SELECT entity_type, entity_id, message, timestamp
         FROM sync_job_errors WHERE job_id = ? ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![job_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(entity_type, entity_id, message, timestamp)| {
            Ok(SyncError {
                entity_type: entity_type.parse().map_err(SyncwrightError::Storage)?,
                entity_id,
                message,
                timestamp: parse_timestamp(&timestamp).ok_or_else(|| {
                    SyncwrightError::Storage(format!("invalid error timestamp {:?}", timestamp))
                })?,
            })
        })
        .collect()
}

/// `running → completed` with final counters
pub fn complete_job(
    conn: &Connection,
    id: &str,
    completed_at: DateTime<Utc>,
    counters: &JobCounters,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE sync_jobs
         SET status = 'completed', completed_at = ?, progress_percentage = 100,
             total_items = ?, processed_items = ?, success_count = ?, error_count = ?,
             conflict_count = ?
         WHERE id = ? AND status = 'running'",
        params![
            fmt_ts(&completed_at),
            counters.total_items,
            counters.processed_items,
            counters.success_count,
            counters.error_count,
            counters.conflict_count,
            id
        ],
    )?;
    Ok(changed > 0)
}

/// `queued|running → failed`
pub fn fail_job(conn: &Connection, id: &str, message: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE sync_jobs SET status = 'failed', completed_at = ?, error_message = ?
         WHERE id = ? AND status IN ('queued', 'running')",
        params![fmt_ts(&Utc::now()), message, id],
    )?;
    Ok(changed > 0)
}

/// `running → cancelled` once the engine has observed the cancel flag
pub fn mark_cancelled(conn: &Connection, id: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE sync_jobs SET status = 'cancelled', completed_at = ?
         WHERE id = ? AND status = 'running'",
        params![fmt_ts(&Utc::now()), id],
    )?;
    Ok(changed > 0)
}

pub fn is_cancel_requested(conn: &Connection, id: &str) -> Result<bool> {
    let flag: Option<i32> = conn
        .query_row(
            "SELECT cancel_requested FROM sync_jobs WHERE id = ?",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(flag.unwrap_or(0) != 0)
}

/// What [`cancel_job`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job had not started and is now cancelled
    Cancelled,
    /// The job is running; it stops before its next entity type
    Requested,
}

/// Cancel a job: queued jobs outright, running jobs cooperatively
pub fn cancel_job(conn: &Connection, id: &str) -> Result<CancelOutcome> {
    let job = get_job_row(conn, id)?;
    let now = fmt_ts(&Utc::now());

    let cancelled = conn.execute(
        "UPDATE sync_jobs SET status = 'cancelled', completed_at = ?
         WHERE id = ? AND status = 'queued'",
        params![now, id],
    )?;
    if cancelled > 0 {
        log_audit(
            conn,
            &AuditRecord::new(AuditAction::JobCancelled).job(&job.configuration_id, id),
        )?;
        tracing::info!(job_id = %id, "Queued sync job cancelled");
        return Ok(CancelOutcome::Cancelled);
    }

    let requested = conn.execute(
        "UPDATE sync_jobs SET cancel_requested = 1 WHERE id = ? AND status = 'running'",
        params![id],
    )?;
    if requested > 0 {
        tracing::info!(job_id = %id, "Cancellation requested for running sync job");
        return Ok(CancelOutcome::Requested);
    }

    Err(SyncwrightError::Conflict(format!(
        "sync job {} is already {}",
        id,
        job.status.as_str()
    )))
}

/// Return jobs left `running` by a previous process to the queue
///
/// Jobs that had a cancellation pending are cancelled instead. Returns
/// the number of jobs requeued.
pub fn requeue_interrupted(conn: &Connection) -> Result<usize> {
    let now = fmt_ts(&Utc::now());
    conn.execute(
        "UPDATE sync_jobs SET status = 'cancelled', completed_at = ?
         WHERE status = 'running' AND cancel_requested = 1",
        params![now],
    )?;
    conn.execute(
        "DELETE FROM sync_job_errors
         WHERE job_id IN (SELECT id FROM sync_jobs WHERE status = 'running')",
        [],
    )?;
    let requeued = conn.execute(
        "UPDATE sync_jobs
         SET status = 'queued', started_at = NULL, progress_percentage = 0,
             processed_items = 0, success_count = 0, error_count = 0, conflict_count = 0
         WHERE status = 'running'",
        [],
    )?;
    if requeued > 0 {
        tracing::warn!(requeued, "Requeued interrupted sync jobs");
    }
    Ok(requeued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::sync::config::{
        create_configuration, delete_configuration, CreateConfigurationInput,
    };

    fn setup(conn: &Connection) -> Result<SyncConfiguration> {
        create_configuration(
            conn,
            &CreateConfigurationInput {
                owner_id: "o".into(),
                adapter_id: "shop".into(),
                entities: vec![EntityType::Products],
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_status_transitions_are_guarded() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let config = setup(conn)?;
                let job = create_job(conn, &config, JobType::FullSync, JobPriority::High)?;
                assert_eq!(job.status, JobStatus::Queued);
                assert!(has_active_job(conn, &config.id)?);

                assert!(start_job(conn, &job.id, Utc::now())?);
                assert!(!start_job(conn, &job.id, Utc::now())?);

                assert!(complete_job(conn, &job.id, Utc::now(), &JobCounters::default())?);
                // Terminal statuses stay put
                assert!(!fail_job(conn, &job.id, "late failure")?);
                assert!(!mark_cancelled(conn, &job.id)?);

                let job = get_job(conn, &job.id)?;
                assert_eq!(job.status, JobStatus::Completed);
                assert_eq!(job.progress_percentage, 100);
                assert!(!has_active_job(conn, &config.id)?);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_cancel_queued_and_running() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let config = setup(conn)?;
                let queued = create_job(conn, &config, JobType::Incremental, JobPriority::Normal)?;
                assert_eq!(cancel_job(conn, &queued.id)?, CancelOutcome::Cancelled);
                assert_eq!(get_job(conn, &queued.id)?.status, JobStatus::Cancelled);
                assert!(cancel_job(conn, &queued.id).is_err());

                let running = create_job(conn, &config, JobType::Incremental, JobPriority::Normal)?;
                start_job(conn, &running.id, Utc::now())?;
                assert_eq!(cancel_job(conn, &running.id)?, CancelOutcome::Requested);
                assert!(is_cancel_requested(conn, &running.id)?);
                assert_eq!(get_job(conn, &running.id)?.status, JobStatus::Running);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_errors_are_ordered() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let config = setup(conn)?;
                let job = create_job(conn, &config, JobType::Incremental, JobPriority::Normal)?;
                record_error(conn, &job.id, &SyncError::new(EntityType::Products, "p1", "first"))?;
                record_error(conn, &job.id, &SyncError::new(EntityType::Orders, "o1", "second"))?;

                let errors = get_job(conn, &job.id)?.errors;
                let messages: Vec<&str> = errors.iter().map(|e| e.message.as_str()).collect();
                assert_eq!(messages, vec!["first", "second"]);
                assert_eq!(errors[1].entity_type, EntityType::Orders);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_delete_configuration_with_jobs() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let config = setup(conn)?;
                let running = create_job(conn, &config, JobType::Incremental, JobPriority::Normal)?;
                start_job(conn, &running.id, Utc::now())?;
                assert!(matches!(
                    delete_configuration(conn, &config.id),
                    Err(SyncwrightError::Conflict(_))
                ));

                complete_job(conn, &running.id, Utc::now(), &JobCounters::default())?;
                let queued = create_job(conn, &config, JobType::Incremental, JobPriority::Normal)?;
                delete_configuration(conn, &config.id)?;

                assert_eq!(get_job(conn, &queued.id)?.status, JobStatus::Cancelled);
                // History survives the configuration
                assert_eq!(get_job(conn, &running.id)?.status, JobStatus::Completed);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_progress_percentage() {
        let counters = JobCounters {
            total_items: 8,
            processed_items: 2,
            ..Default::default()
        };
        assert_eq!(counters.progress_percentage(), 25);
        assert_eq!(JobCounters::default().progress_percentage(), 0);
        assert!(JobPriority::Critical.queue_priority() > JobPriority::High.queue_priority());
    }

    #[test]
    fn test_requeue_interrupted() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let config = setup(conn)?;
                let plain = create_job(conn, &config, JobType::Incremental, JobPriority::Normal)?;
                let cancelling = create_job(conn, &config, JobType::FullSync, JobPriority::Normal)?;
                start_job(conn, &plain.id, Utc::now())?;
                start_job(conn, &cancelling.id, Utc::now())?;
                cancel_job(conn, &cancelling.id)?;

                assert_eq!(requeue_interrupted(conn)?, 1);
                let plain = get_job(conn, &plain.id)?;
                assert_eq!(plain.status, JobStatus::Queued);
                assert!(plain.started_at.is_none());
                assert_eq!(get_job(conn, &cancelling.id)?.status, JobStatus::Cancelled);
                Ok(())
            })
            .unwrap();
    }
}
