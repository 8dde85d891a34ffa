//! Job handlers, dispatched by job type tag

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::{EnqueueOptions, QueueJob, WorkQueue};
use crate::error::{Result, SyncwrightError};
use crate::storage::Storage;
use crate::sync::config::list_configurations;
use crate::sync::job::{has_active_job, JobPriority, JobType};
use crate::sync::scheduler::enqueue_sync_job;
use crate::sync::SyncEngine;
use crate::types::EntityType;

/// Runs a sync job through the engine
pub const SYNC_EXECUTION: &str = "sync-execution";

/// Turns an inbound webhook event into incremental syncs
pub const WEBHOOK_PROCESSING: &str = "webhook-processing";

/// Executes queue jobs of one type
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// An `Err` makes the queue retry the job with backoff
    async fn handle(&self, job: &QueueJob) -> Result<()>;
}

/// Handlers by job type
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.write().insert(job_type.into(), handler);
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.read().contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }
}

#[derive(Debug, Deserialize)]
struct SyncExecutionPayload {
    sync_job_id: String,
}

/// Handler for [`SYNC_EXECUTION`]
///
/// Only fails (and so retries) when the sync job cannot be loaded or
/// started. A sync job that ran and failed is final; the next scheduled
/// run covers its window.
pub struct SyncExecutionHandler {
    engine: Arc<SyncEngine>,
}

impl SyncExecutionHandler {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl JobHandler for SyncExecutionHandler {
    async fn handle(&self, job: &QueueJob) -> Result<()> {
        let payload: SyncExecutionPayload = serde_json::from_value(job.payload.clone())?;
        match self.engine.execute_job(&payload.sync_job_id).await {
            Ok(result) => {
                tracing::debug!(
                    queue_job_id = %job.id,
                    job_id = %result.job_id,
                    status = result.status.as_str(),
                    "Sync execution finished"
                );
                Ok(())
            }
            // Cancelled before start, or already run
            Err(SyncwrightError::Conflict(reason)) => {
                tracing::info!(queue_job_id = %job.id, "Skipping sync execution: {}", reason);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// An inbound event whose signature was already verified
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub adapter_id: String,
    /// Affected entity type; `None` means anything may have changed
    pub entity_type: Option<EntityType>,
    /// Vendor event name, e.g. `products/update`
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Queue a webhook event for processing
pub fn enqueue_webhook_event(queue: &WorkQueue, event: &WebhookEvent) -> Result<String> {
    queue.enqueue(
        WEBHOOK_PROCESSING,
        serde_json::to_value(event)?,
        EnqueueOptions {
            priority: JobPriority::High.queue_priority(),
            ..Default::default()
        },
    )
}

/// Handler for [`WEBHOOK_PROCESSING`]
///
/// Starts a high-priority incremental sync for every active importing
/// configuration of the event's adapter that covers the entity type,
/// unless one is already queued or running.
pub struct WebhookProcessingHandler {
    storage: Storage,
    default_max_retries: u32,
}

impl WebhookProcessingHandler {
    pub fn new(storage: Storage, default_max_retries: u32) -> Self {
        Self {
            storage,
            default_max_retries,
        }
    }
}

#[async_trait]
impl JobHandler for WebhookProcessingHandler {
    async fn handle(&self, job: &QueueJob) -> Result<()> {
        let event: WebhookEvent = serde_json::from_value(job.payload.clone())?;

        let triggered = self.storage.with_transaction(|conn| {
            let mut triggered = Vec::new();
            for config in list_configurations(conn, true)? {
                let matches = config.adapter_id == event.adapter_id
                    && config.direction.imports()
                    && event
                        .entity_type
                        .map_or(true, |t| config.entities.contains(&t));
                if !matches || has_active_job(conn, &config.id)? {
                    continue;
                }
                let sync_job = enqueue_sync_job(
                    conn,
                    &config,
                    JobType::Incremental,
                    JobPriority::High,
                    self.default_max_retries,
                )?;
                triggered.push(sync_job.id);
            }
            Ok(triggered)
        })?;

        tracing::info!(
            queue_job_id = %job.id,
            adapter_id = %event.adapter_id,
            event = %event.event,
            triggered = triggered.len(),
            "Webhook event processed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::QueueJobStatus;
    use crate::sync::config::{create_configuration, CreateConfigurationInput, SyncDirection};
    use crate::sync::job::{list_jobs, JobFilter};

    #[tokio::test]
    async fn test_webhook_triggers_matching_configurations() {
        let storage = Storage::open_in_memory().unwrap();
        let (matching, other) = storage
            .with_connection(|conn| {
                let matching = create_configuration(
                    conn,
                    &CreateConfigurationInput {
                        owner_id: "o".into(),
                        adapter_id: "shop".into(),
                        direction: SyncDirection::Bidirectional,
                        entities: vec![EntityType::Products],
                        ..Default::default()
                    },
                )?;
                let other = create_configuration(
                    conn,
                    &CreateConfigurationInput {
                        owner_id: "o".into(),
                        adapter_id: "shop".into(),
                        entities: vec![EntityType::Orders],
                        ..Default::default()
                    },
                )?;
                Ok((matching, other))
            })
            .unwrap();

        let handlers = HandlerRegistry::new();
        handlers.register(
            WEBHOOK_PROCESSING,
            Arc::new(WebhookProcessingHandler::new(storage.clone(), 3)),
        );
        let queue = WorkQueue::new(storage.clone(), handlers, QueueConfig::default());

        let event = WebhookEvent {
            adapter_id: "shop".into(),
            entity_type: Some(EntityType::Products),
            event: "products/update".into(),
            payload: serde_json::json!({"id": 42}),
            received_at: Utc::now(),
        };
        let id = enqueue_webhook_event(&queue, &event).unwrap();
        assert!(queue.process_next("w").await.unwrap());
        assert_eq!(queue.get(&id).unwrap().status, QueueJobStatus::Completed);

        let jobs_for = |config_id: &str| {
            storage
                .with_connection(|conn| {
                    list_jobs(
                        conn,
                        &JobFilter {
                            configuration_id: Some(config_id.to_string()),
                            ..Default::default()
                        },
                    )
                })
                .unwrap()
        };
        let triggered = jobs_for(&matching.id);
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].priority, JobPriority::High);
        assert!(jobs_for(&other.id).is_empty());

        // A second event while the first sync is still queued adds nothing
        enqueue_webhook_event(&queue, &event).unwrap();
        while queue.process_next("w").await.unwrap() {}
        assert_eq!(jobs_for(&matching.id).len(), 1);
    }

    #[test]
    fn test_registry_types() {
        let storage = Storage::open_in_memory().unwrap();
        let registry = HandlerRegistry::new();
        registry.register(
            WEBHOOK_PROCESSING,
            Arc::new(WebhookProcessingHandler::new(storage, 3)),
        );
        assert!(registry.contains(WEBHOOK_PROCESSING));
        assert!(!registry.contains(SYNC_EXECUTION));
        assert_eq!(registry.job_types(), vec![WEBHOOK_PROCESSING.to_string()]);
    }
}
