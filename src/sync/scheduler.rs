//! Sync scheduler
//!
//! One loop, one tick: every tick reads the active configurations and
//! enqueues an incremental job for each one that is due. The scheduler
//! never runs job bodies; queue workers do.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::time::Duration;
use tokio::sync::watch;

use super::config::{get_configuration, list_configurations, SyncConfiguration};
use super::job::{create_job, has_active_job, JobPriority, JobType, SyncJob};
use crate::error::{Result, SyncwrightError};
use crate::queue::{insert_job, EnqueueOptions, WorkQueue, SYNC_EXECUTION};
use crate::storage::Storage;

/// Create a sync job and its `sync-execution` queue entry in one go
///
/// The queue entry is keyed on the configuration id so jobs of one
/// configuration never run concurrently. Call inside a transaction.
pub(crate) fn enqueue_sync_job(
    conn: &Connection,
    config: &SyncConfiguration,
    job_type: JobType,
    priority: JobPriority,
    default_max_retries: u32,
) -> Result<SyncJob> {
    let job = create_job(conn, config, job_type, priority)?;
    let queue_job_id = insert_job(
        conn,
        SYNC_EXECUTION,
        &serde_json::json!({ "sync_job_id": job.id }),
        &EnqueueOptions {
            priority: priority.queue_priority(),
            max_retries: None,
            delay: None,
            concurrency_key: Some(config.id.clone()),
        },
        default_max_retries,
    )?;
    tracing::debug!(job_id = %job.id, queue_job_id = %queue_job_id, "Sync job enqueued");
    Ok(job)
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Sync job ids created this tick
    pub enqueued: Vec<String>,
    /// Due configurations skipped because a job is already active
    pub skipped_active: usize,
    /// Configurations whose check failed
    pub failed: usize,
}

/// Periodic scheduler plus manual trigger entry point
#[derive(Clone)]
pub struct SyncScheduler {
    storage: Storage,
    queue: WorkQueue,
    tick_interval: Duration,
}

impl SyncScheduler {
    pub fn new(storage: Storage, queue: WorkQueue, tick_interval: Duration) -> Self {
        Self {
            storage,
            queue,
            tick_interval,
        }
    }

    pub fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now())
    }

    /// Enqueue a job for every configuration due at `now`
    pub fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let configs = self
            .storage
            .with_connection(|conn| list_configurations(conn, true))?;

        let mut report = TickReport::default();
        for config in configs {
            if !config.is_due(now) {
                continue;
            }
            match self.enqueue_if_idle(&config) {
                Ok(Some(job_id)) => report.enqueued.push(job_id),
                Ok(None) => report.skipped_active += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(config_id = %config.id, error = %e, "Scheduling failed");
                }
            }
        }

        if !report.enqueued.is_empty() {
            tracing::info!(enqueued = report.enqueued.len(), "Scheduler tick");
        }
        Ok(report)
    }

    fn enqueue_if_idle(&self, config: &SyncConfiguration) -> Result<Option<String>> {
        let max_retries = self.queue.config().default_max_retries;
        self.storage.with_transaction(|conn| {
            if has_active_job(conn, &config.id)? {
                return Ok(None);
            }
            let job = enqueue_sync_job(
                conn,
                config,
                JobType::Incremental,
                JobPriority::Normal,
                max_retries,
            )?;
            Ok(Some(job.id))
        })
    }

    /// Start a job now, bypassing the tick. Returns the new sync job id.
    pub fn trigger_sync(
        &self,
        config_id: &str,
        job_type: JobType,
        priority: JobPriority,
    ) -> Result<String> {
        if !self.queue.handlers().contains(SYNC_EXECUTION) {
            return Err(SyncwrightError::Queue(format!(
                "no handler registered for job type {}",
                SYNC_EXECUTION
            )));
        }
        let max_retries = self.queue.config().default_max_retries;

        let job = self.storage.with_transaction(|conn| {
            let config = get_configuration(conn, config_id)?;
            if !config.is_active {
                return Err(SyncwrightError::InvalidInput(format!(
                    "configuration {} is not active",
                    config_id
                )));
            }
            enqueue_sync_job(conn, &config, job_type, priority, max_retries)
        })?;

        tracing::info!(
            job_id = %job.id,
            config_id = %config_id,
            job_type = job_type.as_str(),
            "Manual sync triggered"
        );
        Ok(job.id)
    }

    /// Next time the configuration becomes due; `None` if it never auto-runs
    pub fn next_due_at(&self, config_id: &str) -> Result<Option<DateTime<Utc>>> {
        let config = self
            .storage
            .with_connection(|conn| get_configuration(conn, config_id))?;
        Ok(config.next_due_at())
    }

    /// Tick until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval_secs = self.tick_interval.as_secs(), "Scheduler started");
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick() {
                        tracing::error!(error = %e, "Scheduler tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Scheduler stopped");
    }
}
