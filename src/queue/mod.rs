//! Durable work queue with retry and exponential backoff
//!
//! Jobs are rows in `queue_jobs`. Workers claim the highest-priority due job
//! with a conditional `pending|retry → running` update, so several workers
//! can share one queue. Jobs sharing a concurrency key never run at the
//! same time.

mod handlers;
mod worker;

pub use handlers::{
    enqueue_webhook_event, HandlerRegistry, JobHandler, SyncExecutionHandler, WebhookEvent,
    WebhookProcessingHandler, SYNC_EXECUTION, WEBHOOK_PROCESSING,
};
pub use worker::QueueWorker;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::config::QueueConfig;
use crate::error::{Result, SyncwrightError};
use crate::storage::{columns, fmt_ts, Storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueJobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Failed at least once, waiting for its backoff to elapse
    Retry,
}

impl QueueJobStatus {
    pub const ALL: [QueueJobStatus; 5] = [
        QueueJobStatus::Pending,
        QueueJobStatus::Running,
        QueueJobStatus::Completed,
        QueueJobStatus::Failed,
        QueueJobStatus::Retry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueJobStatus::Pending => "pending",
            QueueJobStatus::Running => "running",
            QueueJobStatus::Completed => "completed",
            QueueJobStatus::Failed => "failed",
            QueueJobStatus::Retry => "retry",
        }
    }
}

impl std::str::FromStr for QueueJobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueJobStatus::Pending),
            "running" => Ok(QueueJobStatus::Running),
            "completed" => Ok(QueueJobStatus::Completed),
            "failed" => Ok(QueueJobStatus::Failed),
            "retry" => Ok(QueueJobStatus::Retry),
            _ => Err(format!("Unknown queue job status: {}", s)),
        }
    }
}

/// One unit of background work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: QueueJobStatus,
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub scheduled_for: DateTime<Utc>,
    pub error_message: Option<String>,
    pub concurrency_key: Option<String>,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Options for [`WorkQueue::enqueue`]
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Higher runs first
    pub priority: i32,
    /// Queue default when `None`
    pub max_retries: Option<u32>,
    /// Earliest start, relative to now
    pub delay: Option<Duration>,
    /// Jobs with the same key never run concurrently
    pub concurrency_key: Option<String>,
}

/// Count of jobs per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub retry: i64,
}

fn queue_job_from_row(row: &Row) -> rusqlite::Result<QueueJob> {
    Ok(QueueJob {
        id: row.get("id")?,
        job_type: row.get("job_type")?,
        payload: columns::json(row, "payload")?,
        status: columns::parsed(row, "status")?,
        priority: row.get("priority")?,
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        scheduled_for: columns::timestamp(row, "scheduled_for")?,
        error_message: row.get("error_message")?,
        concurrency_key: row.get("concurrency_key")?,
        worker_id: row.get("worker_id")?,
        created_at: columns::timestamp(row, "created_at")?,
        started_at: columns::timestamp_opt(row, "started_at")?,
        completed_at: columns::timestamp_opt(row, "completed_at")?,
    })
}

/// Insert a pending job without consulting the handler registry
///
/// For built-in job types written in the same transaction as the record
/// they refer to.
pub(crate) fn insert_job(
    conn: &Connection,
    job_type: &str,
    payload: &serde_json::Value,
    options: &EnqueueOptions,
    default_max_retries: u32,
) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now();
    let scheduled_for = now + options.delay.unwrap_or_else(Duration::zero);

    conn.execute(
        "INSERT INTO queue_jobs
            (id, job_type, payload, status, priority, retry_count, max_retries,
             scheduled_for, concurrency_key, created_at)
         VALUES (?, ?, ?, 'pending', ?, 0, ?, ?, ?, ?)",
        params![
            id,
            job_type,
            serde_json::to_string(payload)?,
            options.priority,
            options.max_retries.unwrap_or(default_max_retries),
            fmt_ts(&scheduled_for),
            options.concurrency_key,
            fmt_ts(&now)
        ],
    )?;

    tracing::debug!(queue_job_id = %id, job_type = %job_type, "Job enqueued");
    Ok(id)
}

/// Handle on the durable queue; cheap to clone
#[derive(Clone)]
pub struct WorkQueue {
    storage: Storage,
    handlers: HandlerRegistry,
    config: QueueConfig,
}

impl WorkQueue {
    pub fn new(storage: Storage, handlers: HandlerRegistry, config: QueueConfig) -> Self {
        Self {
            storage,
            handlers,
            config,
        }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Add a job; unknown job types are rejected
    pub fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<String> {
        if !self.handlers.contains(job_type) {
            return Err(SyncwrightError::Queue(format!(
                "no handler registered for job type {}",
                job_type
            )));
        }
        self.storage.with_connection(|conn| {
            insert_job(
                conn,
                job_type,
                &payload,
                &options,
                self.config.default_max_retries,
            )
        })
    }

    pub fn get(&self, id: &str) -> Result<QueueJob> {
        self.storage.with_connection(|conn| {
            conn.query_row(
                "SELECT * FROM queue_jobs WHERE id = ?",
                params![id],
                queue_job_from_row,
            )
            .optional()?
            .ok_or_else(|| SyncwrightError::NotFound(format!("queue job {}", id)))
        })
    }

    /// Jobs, optionally of one status, highest priority first
    pub fn list(&self, status: Option<QueueJobStatus>, limit: usize) -> Result<Vec<QueueJob>> {
        self.storage.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM queue_jobs
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY priority DESC, created_at ASC, rowid ASC
                 LIMIT ?2",
            )?;
            let jobs = stmt
                .query_map(
                    params![status.map(|s| s.as_str()), limit as i64],
                    queue_job_from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(jobs)
        })
    }

    pub fn claim_next(&self, worker_id: &str) -> Result<Option<QueueJob>> {
        self.claim_next_at(worker_id, Utc::now())
    }

    /// Claim the next due job as of `now`
    ///
    /// Order: priority descending, then creation time. Jobs whose
    /// concurrency key matches a running job are skipped.
    pub fn claim_next_at(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<QueueJob>> {
        let now_ts = fmt_ts(&now);
        self.storage.with_transaction(|conn| {
            let candidate: Option<String> = conn
                .query_row(
                    "SELECT q.id FROM queue_jobs q
                     WHERE q.status IN ('pending', 'retry')
                       AND q.scheduled_for <= ?
                       AND (q.concurrency_key IS NULL OR NOT EXISTS (
                             SELECT 1 FROM queue_jobs r
                             WHERE r.status = 'running' AND r.concurrency_key = q.concurrency_key))
                     ORDER BY q.priority DESC, q.created_at ASC, q.rowid ASC
                     LIMIT 1",
                    params![now_ts],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(id) = candidate else {
                return Ok(None);
            };

            let claimed = conn.execute(
                "UPDATE queue_jobs SET status = 'running', started_at = ?, worker_id = ?
                 WHERE id = ? AND status IN ('pending', 'retry')",
                params![now_ts, worker_id, id],
            )?;
            if claimed == 0 {
                return Ok(None);
            }

            let job = conn.query_row(
                "SELECT * FROM queue_jobs WHERE id = ?",
                params![id],
                queue_job_from_row,
            )?;
            Ok(Some(job))
        })
    }

    /// `running → completed`
    pub fn complete(&self, id: &str) -> Result<bool> {
        self.storage.with_connection(|conn| {
            let changed = conn.execute(
                "UPDATE queue_jobs SET status = 'completed', completed_at = ?, error_message = NULL
                 WHERE id = ? AND status = 'running'",
                params![fmt_ts(&Utc::now()), id],
            )?;
            Ok(changed > 0)
        })
    }

    /// Delay before the `retry_count`-th retry: 2^n minutes, capped
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let cap = self.config.max_backoff_secs as i64;
        let minutes = 1i64.checked_shl(retry_count.min(62)).unwrap_or(i64::MAX);
        let secs = minutes.saturating_mul(60).min(cap);
        Duration::seconds(secs)
    }

    pub fn fail(&self, id: &str, error: &str) -> Result<QueueJobStatus> {
        self.fail_at(id, error, Utc::now())
    }

    /// Record a failed attempt: retry with backoff while attempts remain,
    /// otherwise fail permanently. A job that is no longer `running` is left
    /// as it is and its current status returned.
    pub fn fail_at(&self, id: &str, error: &str, now: DateTime<Utc>) -> Result<QueueJobStatus> {
        let job = self.get(id)?;
        let retry_count = job.retry_count + 1;
        let retrying = retry_count <= job.max_retries;
        let scheduled_for = now + self.backoff(retry_count);

        let changed = self.storage.with_connection(|conn| {
            let changed = if retrying {
                conn.execute(
                    "UPDATE queue_jobs
                     SET status = 'retry', retry_count = ?, scheduled_for = ?,
                         error_message = ?, worker_id = NULL
                     WHERE id = ? AND status = 'running'",
                    params![retry_count, fmt_ts(&scheduled_for), error, id],
                )?
            } else {
                conn.execute(
                    "UPDATE queue_jobs
                     SET status = 'failed', retry_count = ?, error_message = ?, completed_at = ?
                     WHERE id = ? AND status = 'running'",
                    params![retry_count, error, fmt_ts(&now), id],
                )?
            };
            Ok(changed)
        })?;

        if changed == 0 {
            let current = self.get(id)?;
            tracing::warn!(
                queue_job_id = %id,
                status = current.status.as_str(),
                error = %error,
                "Queue job failure not recorded: job is not running"
            );
            return Ok(current.status);
        }

        if retrying {
            tracing::warn!(
                queue_job_id = %id,
                retry_count,
                retry_at = %scheduled_for,
                error = %error,
                "Queue job failed, will retry"
            );
            Ok(QueueJobStatus::Retry)
        } else {
            tracing::warn!(queue_job_id = %id, retry_count, error = %error, "Queue job failed permanently");
            Ok(QueueJobStatus::Failed)
        }
    }

    /// Operator cancel: `pending|retry → failed`. Returns false when the job
    /// is running or already finished.
    pub fn cancel(&self, id: &str, reason: &str) -> Result<bool> {
        let changed = self.storage.with_connection(|conn| {
            Ok(conn.execute(
                "UPDATE queue_jobs
                 SET status = 'failed', error_message = ?, completed_at = ?, worker_id = NULL
                 WHERE id = ? AND status IN ('pending', 'retry')",
                params![reason, fmt_ts(&Utc::now()), id],
            )?)
        })?;
        if changed > 0 {
            tracing::info!(queue_job_id = %id, reason = %reason, "Queue job cancelled");
        }
        Ok(changed > 0)
    }

    pub fn retry_now(&self, id: &str) -> Result<bool> {
        self.retry_now_at(id, Utc::now())
    }

    /// Operator retry: `failed → pending`, due at `now`. The retry count is
    /// kept, so a job that used up its retries gets exactly one more attempt.
    pub fn retry_now_at(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = self.storage.with_connection(|conn| {
            Ok(conn.execute(
                "UPDATE queue_jobs
                 SET status = 'pending', scheduled_for = ?, completed_at = NULL,
                     started_at = NULL, worker_id = NULL
                 WHERE id = ? AND status = 'failed'",
                params![fmt_ts(&now), id],
            )?)
        })?;
        if changed > 0 {
            tracing::info!(queue_job_id = %id, "Failed queue job requeued");
        }
        Ok(changed > 0)
    }

    /// Fail without further retries
    pub fn fail_permanently(&self, id: &str, error: &str) -> Result<()> {
        self.storage.with_connection(|conn| {
            conn.execute(
                "UPDATE queue_jobs SET status = 'failed', error_message = ?, completed_at = ?
                 WHERE id = ? AND status IN ('pending', 'retry', 'running')",
                params![error, fmt_ts(&Utc::now()), id],
            )?;
            Ok(())
        })
    }

    /// Claim one due job and run its handler. Returns false when idle.
    pub async fn process_next(&self, worker_id: &str) -> Result<bool> {
        let Some(job) = self.claim_next(worker_id)? else {
            return Ok(false);
        };

        let Some(handler) = self.handlers.get(&job.job_type) else {
            let message = format!("no handler registered for job type {}", job.job_type);
            tracing::warn!(queue_job_id = %job.id, "{}", message);
            self.fail_permanently(&job.id, &message)?;
            return Ok(true);
        };

        tracing::debug!(queue_job_id = %job.id, job_type = %job.job_type, worker_id, "Running queue job");
        match handler.handle(&job).await {
            Ok(()) => {
                self.complete(&job.id)?;
            }
            Err(e) => {
                self.fail(&job.id, &e.to_string())?;
            }
        }
        Ok(true)
    }

    pub fn sweep_retention(&self) -> Result<usize> {
        self.sweep_retention_at(Utc::now())
    }

    /// Delete completed/failed jobs finished before `now - retention`
    pub fn sweep_retention_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = fmt_ts(&(now - self.config.retention()));
        let removed = self.storage.with_connection(|conn| {
            Ok(conn.execute(
                "DELETE FROM queue_jobs
                 WHERE status IN ('completed', 'failed') AND completed_at < ?",
                params![cutoff],
            )?)
        })?;
        if removed > 0 {
            tracing::info!(removed, "Queue retention sweep");
        }
        Ok(removed)
    }

    /// Put jobs left `running` by a previous process back in line
    pub fn recover_interrupted(&self) -> Result<usize> {
        self.storage.with_connection(|conn| {
            Ok(conn.execute(
                "UPDATE queue_jobs SET status = 'pending', worker_id = NULL, started_at = NULL
                 WHERE status = 'running'",
                [],
            )?)
        })
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.storage.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM queue_jobs GROUP BY status")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut stats = QueueStats::default();
            for (status, count) in rows {
                match status.parse::<QueueJobStatus>() {
                    Ok(QueueJobStatus::Pending) => stats.pending = count,
                    Ok(QueueJobStatus::Running) => stats.running = count,
                    Ok(QueueJobStatus::Completed) => stats.completed = count,
                    Ok(QueueJobStatus::Failed) => stats.failed = count,
                    Ok(QueueJobStatus::Retry) => stats.retry = count,
                    Err(_) => {}
                }
            }
            Ok(stats)
        })
    }
}
