//! Application context
//!
//! Everything the background loops share, built once at startup and handed
//! out by clone: storage, the entity store, both registries, the queue, the
//! engine and the scheduler.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{AdapterConfig, AdapterKind, SyncwrightConfig};
use crate::error::{Result, SyncwrightError};
use crate::queue::{
    HandlerRegistry, QueueWorker, SyncExecutionHandler, WebhookProcessingHandler, WorkQueue,
    SYNC_EXECUTION, WEBHOOK_PROCESSING,
};
use crate::storage::{EntityStore, SqliteEntityStore, Storage};
use crate::sync::config::list_configurations;
use crate::sync::job::{cancel_job, requeue_interrupted};
use crate::sync::{Adapter, AdapterRegistry, JsonDirAdapter, MemoryAdapter, SyncEngine, SyncScheduler};

/// Shared handles of a running instance
#[derive(Clone)]
pub struct AppContext {
    pub config: SyncwrightConfig,
    pub storage: Storage,
    pub store: Arc<dyn EntityStore>,
    pub adapters: AdapterRegistry,
    pub engine: Arc<SyncEngine>,
    pub queue: WorkQueue,
    pub scheduler: SyncScheduler,
}

impl AppContext {
    /// Wire the components together over an already open storage
    pub fn new(config: SyncwrightConfig, storage: Storage, adapters: AdapterRegistry) -> Self {
        let store: Arc<dyn EntityStore> = Arc::new(SqliteEntityStore::new(storage.clone()));
        let engine = Arc::new(SyncEngine::new(
            storage.clone(),
            store.clone(),
            adapters.clone(),
            config.engine.clone(),
            config.dedup.clone(),
        ));

        let handlers = HandlerRegistry::new();
        handlers.register(SYNC_EXECUTION, Arc::new(SyncExecutionHandler::new(engine.clone())));
        handlers.register(
            WEBHOOK_PROCESSING,
            Arc::new(WebhookProcessingHandler::new(
                storage.clone(),
                config.queue.default_max_retries,
            )),
        );

        let queue = WorkQueue::new(storage.clone(), handlers, config.queue.clone());
        let scheduler = SyncScheduler::new(
            storage.clone(),
            queue.clone(),
            config.scheduler.tick_interval(),
        );

        Self {
            config,
            storage,
            store,
            adapters,
            engine,
            queue,
            scheduler,
        }
    }

    /// Open the configured database and register the configured adapters
    pub fn open(config: SyncwrightConfig) -> Result<Self> {
        let mut storage_config = config.storage.clone();
        storage_config.db_path = shellexpand::tilde(&storage_config.db_path).to_string();
        let storage = Storage::open(storage_config)?;

        let adapters = AdapterRegistry::new();
        for adapter in &config.adapters {
            adapters.register(build_adapter(adapter)?);
        }

        Ok(Self::new(config, storage, adapters))
    }

    /// Fail fast when an active configuration points at an unknown adapter
    pub fn validate_registries(&self) -> Result<()> {
        let configs = self
            .storage
            .with_connection(|conn| list_configurations(conn, true))?;
        let missing: Vec<String> = configs
            .iter()
            .filter(|c| !self.adapters.contains(&c.adapter_id))
            .map(|c| format!("{} (adapter {})", c.id, c.adapter_id))
            .collect();
        if !missing.is_empty() {
            return Err(SyncwrightError::Config(format!(
                "active configurations reference unregistered adapters: {}",
                missing.join(", ")
            )));
        }

        for job_type in [SYNC_EXECUTION, WEBHOOK_PROCESSING] {
            if !self.queue.handlers().contains(job_type) {
                return Err(SyncwrightError::Config(format!(
                    "no handler registered for job type {}",
                    job_type
                )));
            }
        }
        Ok(())
    }

    /// Put work interrupted by a previous process back in line.
    /// Returns (sync jobs requeued, queue jobs recovered).
    pub fn recover_interrupted(&self) -> Result<(usize, usize)> {
        let jobs = self.storage.with_transaction(requeue_interrupted)?;
        let queue_jobs = self.queue.recover_interrupted()?;
        if jobs > 0 || queue_jobs > 0 {
            tracing::info!(jobs, queue_jobs, "Recovered interrupted work");
        }
        Ok((jobs, queue_jobs))
    }

    /// Cancel a waiting queue job. A sync execution also cancels its sync
    /// job, which would otherwise stay `queued` and block its configuration.
    pub fn cancel_queue_job(&self, id: &str, reason: &str) -> Result<bool> {
        let job = self.queue.get(id)?;
        if !self.queue.cancel(id, reason)? {
            return Ok(false);
        }

        if job.job_type == SYNC_EXECUTION {
            if let Some(sync_job_id) = job.payload.get("sync_job_id").and_then(|v| v.as_str()) {
                match self
                    .storage
                    .with_transaction(|conn| cancel_job(conn, sync_job_id))
                {
                    Ok(_) | Err(SyncwrightError::Conflict(_)) | Err(SyncwrightError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(true)
    }

    /// Spawn the scheduler, the workers and the retention sweeper. They all
    /// stop once `shutdown` flips to true.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if self.config.scheduler.enabled {
            handles.push(tokio::spawn(self.scheduler.clone().run(shutdown.clone())));
        } else {
            tracing::info!("Scheduler disabled; only manual and webhook syncs will run");
        }

        for n in 0..self.config.queue.workers {
            let worker = QueueWorker::new(self.queue.clone(), format!("worker-{}", n + 1));
            handles.push(tokio::spawn(worker.run(shutdown.clone())));
        }

        handles.push(tokio::spawn(run_retention_sweeper(
            self.storage.clone(),
            self.queue.clone(),
            Duration::from_secs(self.config.queue.sweep_interval_secs.max(1)),
            shutdown,
        )));

        handles
    }

    /// Validate, recover, then run the background loops until `shutdown`
    pub async fn serve(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.validate_registries()?;
        self.recover_interrupted()?;

        tracing::info!(
            db_path = %self.storage.db_path(),
            workers = self.config.queue.workers,
            adapters = self.adapters.ids().len(),
            "Syncwright started"
        );

        for handle in self.spawn(shutdown) {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Background task panicked");
            }
        }

        tracing::info!("Syncwright stopped");
        Ok(())
    }
}

fn build_adapter(config: &AdapterConfig) -> Result<Arc<dyn Adapter>> {
    match config.kind {
        AdapterKind::JsonDir => {
            let path = config.path.as_deref().ok_or_else(|| {
                SyncwrightError::Config(format!("adapter {} needs a path", config.id))
            })?;
            let dir = shellexpand::tilde(path).to_string();
            let adapter = if config.read_only {
                JsonDirAdapter::read_only(config.id.clone(), dir)
            } else {
                JsonDirAdapter::new(config.id.clone(), dir)
            };
            Ok(Arc::new(adapter))
        }
        AdapterKind::Memory => Ok(Arc::new(MemoryAdapter::new(config.id.clone()))),
    }
}

async fn run_retention_sweeper(
    storage: Storage,
    queue: WorkQueue,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match queue.sweep_retention() {
                    Ok(0) => {}
                    Ok(_) => {
                        if let Err(e) = storage.checkpoint() {
                            tracing::warn!(error = %e, "WAL checkpoint failed");
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Queue retention sweep failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueConfig, SchedulerConfig};
    use crate::sync::config::{create_configuration, get_configuration, CreateConfigurationInput};
    use crate::queue::QueueJobStatus;
    use crate::sync::job::{get_job, list_jobs, JobFilter, JobStatus};
    use crate::sync::{JobPriority, JobType, SyncFrequency};
    use crate::types::{Entity, EntityType, Product};

    fn test_config() -> SyncwrightConfig {
        SyncwrightConfig {
            scheduler: SchedulerConfig {
                enabled: true,
                tick_interval_secs: 1,
            },
            queue: QueueConfig {
                poll_interval_ms: 10,
                workers: 2,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn create(storage: &Storage, adapter_id: &str) -> String {
        storage
            .with_connection(|conn| {
                create_configuration(
                    conn,
                    &CreateConfigurationInput {
                        owner_id: "o".into(),
                        adapter_id: adapter_id.into(),
                        frequency: SyncFrequency::Hourly,
                        entities: vec![EntityType::Products],
                        ..Default::default()
                    },
                )
            })
            .unwrap()
            .id
    }

    #[test]
    fn test_unknown_adapter_fails_fast() {
        let storage = Storage::open_in_memory().unwrap();
        create(&storage, "ghost");
        let ctx = AppContext::new(test_config(), storage, AdapterRegistry::new());
        let err = ctx.validate_registries().unwrap_err();
        assert!(matches!(err, SyncwrightError::Config(_)));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_json_dir_adapter_needs_path() {
        let config = AdapterConfig {
            id: "files".into(),
            kind: AdapterKind::JsonDir,
            path: None,
            read_only: false,
        };
        assert!(build_adapter(&config).is_err());
    }

    #[test]
    fn test_cancelling_sync_execution_cancels_sync_job() {
        let storage = Storage::open_in_memory().unwrap();
        let adapters = AdapterRegistry::new();
        adapters.register(Arc::new(MemoryAdapter::new("shop")));
        let config_id = create(&storage, "shop");
        let ctx = AppContext::new(test_config(), storage, adapters);

        let job_id = ctx
            .scheduler
            .trigger_sync(&config_id, JobType::FullSync, JobPriority::Normal)
            .unwrap();
        let entry = ctx.queue.list(Some(QueueJobStatus::Pending), 10).unwrap().remove(0);

        assert!(ctx.cancel_queue_job(&entry.id, "operator").unwrap());
        assert_eq!(ctx.queue.get(&entry.id).unwrap().status, QueueJobStatus::Failed);
        let job = ctx
            .storage
            .with_connection(|conn| get_job(conn, &job_id))
            .unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        // Nothing left blocking the configuration
        let report = ctx.scheduler.tick_at(chrono::Utc::now()).unwrap();
        assert_eq!(report.enqueued.len(), 1);
        assert!(!ctx.cancel_queue_job(&entry.id, "operator").unwrap());
    }

    #[tokio::test]
    async fn test_serve_runs_due_configuration() {
        let storage = Storage::open_in_memory().unwrap();
        let adapter = Arc::new(MemoryAdapter::new("shop"));
        adapter.put(Entity::Product(Product {
            id: "p-1".into(),
            sku: Some("SKU-1".into()),
            title: "Blue Mug".into(),
            ..Default::default()
        }));
        let adapters = AdapterRegistry::new();
        adapters.register(adapter);
        let config_id = create(&storage, "shop");

        let ctx = AppContext::new(test_config(), storage.clone(), adapters);
        let (tx, rx) = watch::channel(false);
        let serving = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.serve(rx).await })
        };

        let mut completed = false;
        for _ in 0..200 {
            let jobs = storage
                .with_connection(|conn| {
                    list_jobs(
                        conn,
                        &JobFilter {
                            configuration_id: Some(config_id.clone()),
                            ..Default::default()
                        },
                    )
                })
                .unwrap();
            if jobs.iter().any(|j| j.status == JobStatus::Completed) {
                completed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(completed);

        let config = storage
            .with_connection(|conn| get_configuration(conn, &config_id))
            .unwrap();
        assert!(config.last_sync_at.is_some());
        assert!(ctx.store.get(EntityType::Products, "p-1").unwrap().is_some());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
