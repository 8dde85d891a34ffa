//! Bidirectional sync engine
//!
//! Executes one [`SyncJob`]: `queued → running → completed | failed |
//! cancelled`. Import pages through the adapter, collapses duplicates,
//! settles field conflicts and upserts survivors; export pushes local
//! changes back through the adapter. The configuration's `last_sync_at`
//! only moves when the job completes, in the same transaction.

use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::adapter::{Adapter, AdapterRegistry, FetchOptions};
use super::config::{advance_last_sync_at, get_configuration, SyncConfiguration};
use super::conflict::{
    insert_conflict, record_conflict, ConflictDetector, ConflictResolver, ConflictType, Detection,
    ResolutionAction, SyncConflict,
};
use super::job::{
    complete_job, fail_job, get_job, is_cancel_requested, list_job_errors, mark_cancelled,
    record_error, start_job, update_progress, JobCounters, JobStatus, JobType, SyncError, SyncJob,
};
use crate::config::{DedupConfig, EngineConfig};
use crate::dedup::{DedupReport, DeduplicationEngine, Origin};
use crate::error::{Result, SyncwrightError};
use crate::storage::{log_audit, AuditAction, AuditRecord, EntityFilter, EntityStore, Storage, UpsertOutcome};
use crate::types::{Entity, EntityType};

/// Outcome of [`SyncEngine::execute_job`]
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub job_id: String,
    pub status: JobStatus,
    pub success_count: i64,
    pub error_count: i64,
    pub conflict_count: i64,
    pub errors: Vec<SyncError>,
    pub error_message: Option<String>,
}

enum RunOutcome {
    Completed,
    Cancelled,
}

/// Mutable state of one running job
struct RunState<'a> {
    job: &'a SyncJob,
    config: &'a SyncConfiguration,
    counters: JobCounters,
    since_flush: usize,
    /// Local ids written by the import half, per type
    imported: HashMap<EntityType, HashSet<String>>,
}

/// Executes sync jobs
pub struct SyncEngine {
    storage: Storage,
    store: Arc<dyn EntityStore>,
    adapters: AdapterRegistry,
    dedup: DeduplicationEngine,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    config: EngineConfig,
}

impl SyncEngine {
    pub fn new(
        storage: Storage,
        store: Arc<dyn EntityStore>,
        adapters: AdapterRegistry,
        config: EngineConfig,
        dedup: DedupConfig,
    ) -> Self {
        let resolver = ConflictResolver::new(storage.clone(), store.clone());
        Self {
            storage,
            store,
            adapters,
            dedup: DeduplicationEngine::new(dedup),
            detector: ConflictDetector::new(),
            resolver,
            config,
        }
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    /// Run a queued job to a terminal status
    ///
    /// Errors only when the job cannot be loaded or started; a job that ran
    /// and failed is reported through [`JobResult::status`].
    pub async fn execute_job(&self, job_id: &str) -> Result<JobResult> {
        let job = self.storage.with_connection(|conn| get_job(conn, job_id))?;
        if job.status != JobStatus::Queued {
            return Err(SyncwrightError::Conflict(format!(
                "sync job {} is {}, not queued",
                job_id,
                job.status.as_str()
            )));
        }

        let config = match self
            .storage
            .with_connection(|conn| get_configuration(conn, &job.configuration_id))
        {
            Ok(config) => config,
            Err(SyncwrightError::NotFound(what)) => {
                return self.finish_failed(&job, &format!("{} no longer exists", what));
            }
            Err(e) => return Err(e),
        };

        let started = self.storage.with_transaction(|conn| {
            let started = start_job(conn, job_id, Utc::now())?;
            if started {
                log_audit(
                    conn,
                    &AuditRecord::new(AuditAction::JobStarted).job(&config.id, job_id),
                )?;
            }
            Ok(started)
        })?;
        if !started {
            return Err(SyncwrightError::Conflict(format!(
                "sync job {} was claimed elsewhere",
                job_id
            )));
        }

        tracing::info!(
            job_id = %job_id,
            config_id = %config.id,
            job_type = job.job_type.as_str(),
            "Sync job started"
        );

        let mut state = RunState {
            job: &job,
            config: &config,
            counters: JobCounters::default(),
            since_flush: 0,
            imported: HashMap::new(),
        };

        match self.run(&mut state).await {
            Ok(RunOutcome::Completed) => self.finish_completed(&job, &config, &state.counters),
            Ok(RunOutcome::Cancelled) => self.finish_cancelled(&job, &state.counters),
            Err(e) => {
                // The job must leave `running` even when the counters can't be written
                if let Err(flush_err) = self.flush(&state.counters, job_id) {
                    tracing::warn!(
                        job_id = %job_id,
                        error = %flush_err,
                        "Failed to record progress of failed job"
                    );
                }
                self.finish_failed(&job, &e.to_string())
            }
        }
    }

    async fn run(&self, state: &mut RunState<'_>) -> Result<RunOutcome> {
        let (job, config) = (state.job, state.config);
        let adapter = self.adapters.get(&config.adapter_id).map_err(|_| {
            SyncwrightError::Adapter(format!("unknown adapter {}", config.adapter_id))
        })?;

        if job.job_type == JobType::ConflictResolution {
            let resolved = self.resolver.reapply_rules(config)?;
            state.counters.total_items = resolved as i64;
            state.counters.processed_items = resolved as i64;
            state.counters.success_count = resolved as i64;
            return Ok(RunOutcome::Completed);
        }

        if !adapter.validate_credentials().await? {
            return Err(SyncwrightError::Adapter(format!(
                "{} rejected the stored credentials",
                adapter.id()
            )));
        }

        for &entity_type in &config.entities {
            let cancelled = self
                .storage
                .with_connection(|conn| is_cancel_requested(conn, &job.id))?;
            if cancelled {
                return Ok(RunOutcome::Cancelled);
            }

            if config.direction.imports() {
                self.import_type(state, adapter.as_ref(), entity_type).await?;
            }
            if config.direction.exports() {
                self.export_type(state, adapter.as_ref(), entity_type).await?;
            }
            self.flush(&state.counters, &job.id)?;
        }

        Ok(RunOutcome::Completed)
    }

    async fn import_type(
        &self,
        state: &mut RunState<'_>,
        adapter: &dyn Adapter,
        entity_type: EntityType,
    ) -> Result<()> {
        if !adapter.capability(entity_type).read {
            self.entity_error(
                state,
                SyncError::new(
                    entity_type,
                    "*",
                    format!("{} cannot read {}", adapter.id(), entity_type),
                ),
            )?;
            return Ok(());
        }

        let since = match state.job.job_type {
            JobType::Incremental => state.config.last_sync_at,
            _ => None,
        };
        let mut options = FetchOptions {
            since,
            limit: self.config.page_size,
            cursor: None,
        };

        loop {
            let page = adapter.fetch_entities(entity_type, &options).await?;
            state.counters.total_items += page.entities.len() as i64;
            tracing::debug!(
                job_id = %state.job.id,
                entity_type = %entity_type,
                fetched = page.entities.len(),
                "Fetched page"
            );

            self.import_batch(state, adapter.id(), entity_type, page.entities)?;
            self.flush(&state.counters, &state.job.id)?;

            match page.next_cursor {
                Some(cursor) => options.cursor = Some(cursor),
                None => break,
            }
        }
        Ok(())
    }

    fn import_batch(
        &self,
        state: &mut RunState<'_>,
        adapter_id: &str,
        entity_type: EntityType,
        fetched: Vec<Entity>,
    ) -> Result<()> {
        // Remote id by the id the record is known under locally
        let mut remote_ids: HashMap<String, String> = HashMap::new();
        let mut batch = Vec::with_capacity(fetched.len());

        for mut entity in fetched {
            let remote_id = entity.id().to_string();
            let valid = if entity.entity_type() != entity_type {
                Err(SyncwrightError::InvalidInput(format!(
                    "expected {}, got {}",
                    entity_type,
                    entity.entity_type()
                )))
            } else {
                entity.validate()
            };
            if let Err(e) = valid {
                self.entity_error(state, SyncError::new(entity_type, remote_id, e.to_string()))?;
                self.processed(state)?;
                continue;
            }

            // Discarded by an earlier run in favour of a local record
            if let Some(survivor) = self.store.alias_of(adapter_id, entity_type, &remote_id)? {
                tracing::debug!(
                    job_id = %state.job.id,
                    remote_id = %remote_id,
                    survivor = %survivor,
                    "Known duplicate collapsed"
                );
                state.counters.success_count += 1;
                self.processed(state)?;
                continue;
            }

            if let Some(local) = self.store.local_id(adapter_id, entity_type, &remote_id)? {
                entity.set_id(local);
            }
            remote_ids.insert(entity.id().to_string(), remote_id);
            batch.push(entity);
        }

        if batch.is_empty() {
            return Ok(());
        }

        let existing = self.existing_candidates(entity_type, &batch)?;
        let by_id: HashMap<String, Entity> = batch
            .iter()
            .map(|e| (e.id().to_string(), e.clone()))
            .collect();
        let existing_by_id: HashMap<&str, &Entity> =
            existing.iter().map(|e| (e.id(), e)).collect();

        let DedupReport { entities, groups } = self.dedup.deduplicate(batch, &existing);

        // Survivor written over a stored record: local id → pre-dedup id
        let mut renamed: HashMap<String, String> = HashMap::new();
        // Remote ids of discarded records, by the local id of their survivor
        let mut aliases: HashMap<String, Vec<String>> = HashMap::new();

        for group in &groups {
            let details = serde_json::to_value(group)?;
            self.storage.with_connection(|conn| {
                log_audit(
                    conn,
                    &AuditRecord::new(AuditAction::DuplicateGroup)
                        .job(&state.config.id, &state.job.id)
                        .entity(entity_type, &group.selected_id)
                        .details(details),
                )
            })?;

            if let Some(ref local) = group.persist_as {
                renamed.insert(local.clone(), group.selected_id.clone());
            }
            let survivor_local = group
                .persist_as
                .clone()
                .unwrap_or_else(|| group.selected_id.clone());

            for member in &group.members {
                if member.origin != Origin::Incoming || member.id == group.selected_id {
                    continue;
                }
                // Collapsed into another record
                state.counters.success_count += 1;
                self.processed(state)?;

                if let Some(remote_id) = remote_ids.get(&member.id) {
                    if group.keeps_existing() {
                        self.store
                            .link_alias(adapter_id, entity_type, &survivor_local, remote_id)?;
                    } else {
                        aliases
                            .entry(survivor_local.clone())
                            .or_default()
                            .push(remote_id.clone());
                    }
                }

                if group.keeps_existing() {
                    let source = by_id.get(&member.id);
                    let destination = existing_by_id.get(group.selected_id.as_str());
                    if let (Some(source), Some(destination)) = (source, destination) {
                        self.duplicate_conflict(state, entity_type, source, destination)?;
                    }
                }
            }
        }

        for entity in entities {
            let local_id = entity.id().to_string();
            let pre_dedup_id = renamed.get(&local_id).unwrap_or(&local_id);
            let remote_id = remote_ids.get(pre_dedup_id).cloned();

            match self.persist(state, entity_type, entity) {
                Ok(()) => {
                    if let Some(remote_id) = remote_id {
                        if self.store.remote_id(adapter_id, entity_type, &local_id)?.as_deref()
                            != Some(remote_id.as_str())
                        {
                            self.store
                                .link_remote(adapter_id, entity_type, &local_id, &remote_id)?;
                        }
                    }
                    for alias in aliases.remove(&local_id).unwrap_or_default() {
                        self.store
                            .link_alias(adapter_id, entity_type, &local_id, &alias)?;
                    }
                    state
                        .imported
                        .entry(entity_type)
                        .or_default()
                        .insert(local_id);
                    state.counters.success_count += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %state.job.id,
                        entity_id = %local_id,
                        error = %e,
                        "Failed to import record"
                    );
                    self.entity_error(state, SyncError::new(entity_type, local_id, e.to_string()))?;
                }
            }
            self.processed(state)?;
        }

        Ok(())
    }

    /// Stored records that may collide with the batch: key matches first,
    /// then a window of recent records for fuzzy matching
    fn existing_candidates(&self, entity_type: EntityType, batch: &[Entity]) -> Result<Vec<Entity>> {
        let mut existing = self
            .store
            .find_existing(entity_type, &EntityFilter::matching(batch))?;

        if self.config.fuzzy_scan_window > 0 && batch.iter().any(|e| e.title().is_some()) {
            let seen: HashSet<String> = existing.iter().map(|e| e.id().to_string()).collect();
            let window = self.store.find_existing(
                entity_type,
                &EntityFilter {
                    limit: Some(self.config.fuzzy_scan_window),
                    ..Default::default()
                },
            )?;
            existing.extend(window.into_iter().filter(|e| !seen.contains(e.id())));
        }
        Ok(existing)
    }

    /// Conflict detection against the stored copy, then upsert
    fn persist(&self, state: &mut RunState<'_>, entity_type: EntityType, entity: Entity) -> Result<()> {
        let stored = self.store.get(entity_type, entity.id())?;
        let Some(stored) = stored else {
            self.store.upsert(entity_type, entity.id(), &entity)?;
            return Ok(());
        };

        let detection = self.detector.detect(state.config, &entity, &stored)?;
        for pending in detection.conflicts() {
            let conflict = SyncConflict::from_pending(
                pending,
                &state.job.id,
                &state.config.id,
                entity_type,
                entity.id(),
            );
            let recorded = self
                .storage
                .with_transaction(|conn| record_conflict(conn, &conflict))?;
            if !recorded {
                continue;
            }
            state.counters.conflict_count += 1;
            if conflict.resolution_required {
                tracing::debug!(
                    job_id = %state.job.id,
                    entity_id = %entity.id(),
                    field = ?conflict.field,
                    "Conflict needs review"
                );
            }
        }

        if let Detection::Ordered { source_won: false, .. } = detection {
            return Ok(());
        }
        if let Some(merged) = detection.merged() {
            let outcome = self.store.upsert(entity_type, merged.id(), merged)?;
            if outcome != UpsertOutcome::Unchanged {
                tracing::debug!(entity_id = %merged.id(), ?outcome, "Record written");
            }
        }
        Ok(())
    }

    fn duplicate_conflict(
        &self,
        state: &mut RunState<'_>,
        entity_type: EntityType,
        source: &Entity,
        destination: &Entity,
    ) -> Result<()> {
        let now = Utc::now();
        let conflict = SyncConflict {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: state.job.id.clone(),
            configuration_id: state.config.id.clone(),
            entity_type,
            entity_id: destination.id().to_string(),
            field: None,
            conflict_type: ConflictType::DuplicateKey,
            source_data: serde_json::to_value(source)?,
            destination_data: serde_json::to_value(destination)?,
            resolution_required: false,
            auto_resolved: true,
            resolution_action: Some(ResolutionAction::DestinationWins),
            resolved_at: Some(now),
            resolved_by: Some("dedup".to_string()),
            detected_at: now,
        };
        self.storage
            .with_connection(|conn| insert_conflict(conn, &conflict))?;
        state.counters.conflict_count += 1;
        Ok(())
    }

    async fn export_type(
        &self,
        state: &mut RunState<'_>,
        adapter: &dyn Adapter,
        entity_type: EntityType,
    ) -> Result<()> {
        let since = match state.job.job_type {
            JobType::FullSync => None,
            _ => state.config.last_sync_at,
        };
        let imported = state.imported.get(&entity_type).cloned().unwrap_or_default();
        let local: Vec<Entity> = self
            .store
            .changed_since(entity_type, since)?
            .into_iter()
            .filter(|e| !imported.contains(e.id()))
            .collect();
        state.counters.total_items += local.len() as i64;

        let can_write = adapter.capability(entity_type).write;
        for entity in local {
            let local_id = entity.id().to_string();
            if !can_write {
                self.entity_error(
                    state,
                    SyncError::new(
                        entity_type,
                        local_id,
                        format!("{} cannot write {}", adapter.id(), entity_type),
                    ),
                )?;
                self.processed(state)?;
                continue;
            }

            match self.export_one(state, adapter, entity_type, &entity).await {
                Ok(()) => state.counters.success_count += 1,
                // Outage: give up on the whole job
                Err(e @ SyncwrightError::AdapterUnavailable(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        job_id = %state.job.id,
                        entity_id = %local_id,
                        error = %e,
                        "Failed to export record"
                    );
                    self.entity_error(state, SyncError::new(entity_type, local_id, e.to_string()))?;
                }
            }
            self.processed(state)?;
        }
        Ok(())
    }

    async fn export_one(
        &self,
        state: &RunState<'_>,
        adapter: &dyn Adapter,
        entity_type: EntityType,
        entity: &Entity,
    ) -> Result<()> {
        let local_id = entity.id();
        let (remote, created) = match self.store.remote_id(adapter.id(), entity_type, local_id)? {
            Some(remote_id) => {
                let mut outgoing = entity.clone();
                outgoing.set_id(remote_id);
                (adapter.update_entity(entity_type, &outgoing).await?, false)
            }
            None => {
                let remote = adapter.create_entity(entity_type, entity).await?;
                self.store
                    .link_remote(adapter.id(), entity_type, local_id, remote.id())?;
                (remote, true)
            }
        };

        self.storage.with_connection(|conn| {
            log_audit(
                conn,
                &AuditRecord::new(AuditAction::EntityExported)
                    .job(&state.config.id, &state.job.id)
                    .entity(entity_type, local_id)
                    .details(serde_json::json!({
                        "remote_id": remote.id(),
                        "created": created,
                    })),
            )
        })?;
        Ok(())
    }

    fn entity_error(&self, state: &mut RunState<'_>, error: SyncError) -> Result<()> {
        state.counters.error_count += 1;
        self.storage
            .with_connection(|conn| record_error(conn, &state.job.id, &error))
    }

    fn processed(&self, state: &mut RunState<'_>) -> Result<()> {
        state.counters.processed_items += 1;
        state.since_flush += 1;
        if state.since_flush >= self.config.progress_flush_every.max(1) {
            state.since_flush = 0;
            self.flush(&state.counters, &state.job.id)?;
        }
        Ok(())
    }

    fn flush(&self, counters: &JobCounters, job_id: &str) -> Result<()> {
        self.storage
            .with_connection(|conn| update_progress(conn, job_id, counters))
    }

    fn finish_completed(
        &self,
        job: &SyncJob,
        config: &SyncConfiguration,
        counters: &JobCounters,
    ) -> Result<JobResult> {
        let completed_at = Utc::now();
        // Conflict re-evaluation syncs no data, so the sync window stays put
        let advances_window = job.job_type != JobType::ConflictResolution;

        self.storage.with_transaction(|conn| {
            if complete_job(conn, &job.id, completed_at, counters)? {
                if advances_window {
                    advance_last_sync_at(conn, &config.id, completed_at)?;
                }
                log_audit(
                    conn,
                    &AuditRecord::new(AuditAction::JobCompleted)
                        .job(&config.id, &job.id)
                        .details(serde_json::to_value(counters)?),
                )?;
            }
            Ok(())
        })?;

        tracing::info!(
            job_id = %job.id,
            config_id = %config.id,
            success = counters.success_count,
            errors = counters.error_count,
            conflicts = counters.conflict_count,
            "Sync job completed"
        );
        self.result(&job.id)
    }

    fn finish_cancelled(&self, job: &SyncJob, counters: &JobCounters) -> Result<JobResult> {
        self.storage.with_transaction(|conn| {
            update_progress(conn, &job.id, counters)?;
            if mark_cancelled(conn, &job.id)? {
                log_audit(
                    conn,
                    &AuditRecord::new(AuditAction::JobCancelled)
                        .job(&job.configuration_id, &job.id)
                        .details(serde_json::to_value(counters)?),
                )?;
            }
            Ok(())
        })?;
        tracing::info!(job_id = %job.id, "Sync job cancelled");
        self.result(&job.id)
    }

    fn finish_failed(&self, job: &SyncJob, message: &str) -> Result<JobResult> {
        self.storage.with_transaction(|conn| {
            if fail_job(conn, &job.id, message)? {
                log_audit(
                    conn,
                    &AuditRecord::new(AuditAction::JobFailed)
                        .job(&job.configuration_id, &job.id)
                        .details(serde_json::json!({ "error": message })),
                )?;
            }
            Ok(())
        })?;
        tracing::warn!(job_id = %job.id, error = %message, "Sync job failed");
        self.result(&job.id)
    }

    fn result(&self, job_id: &str) -> Result<JobResult> {
        self.storage.with_connection(|conn| {
            let job = get_job(conn, job_id)?;
            Ok(JobResult {
                job_id: job.id,
                status: job.status,
                success_count: job.counters.success_count,
                error_count: job.counters.error_count,
                conflict_count: job.counters.conflict_count,
                errors: list_job_errors(conn, job_id)?,
                error_message: job.error_message,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteEntityStore;
    use crate::sync::adapter::{EntityCapability, MemoryAdapter};
    use crate::sync::config::{create_configuration, CreateConfigurationInput, SyncDirection};
    use crate::sync::job::{create_job, JobPriority};
    use crate::types::Product;

    struct Harness {
        storage: Storage,
        store: Arc<SqliteEntityStore>,
        adapter: Arc<MemoryAdapter>,
        engine: SyncEngine,
    }

    fn harness(adapter: MemoryAdapter) -> Harness {
        let storage = Storage::open_in_memory().unwrap();
        let store = Arc::new(SqliteEntityStore::new(storage.clone()));
        let adapter = Arc::new(adapter);
        let registry = AdapterRegistry::new();
        registry.register(adapter.clone());
        let engine = SyncEngine::new(
            storage.clone(),
            store.clone(),
            registry,
            EngineConfig::default(),
            DedupConfig::default(),
        );
        Harness {
            storage,
            store,
            adapter,
            engine,
        }
    }

    fn queue_job(h: &Harness, direction: SyncDirection, job_type: JobType) -> (SyncConfiguration, SyncJob) {
        h.storage
            .with_connection(|conn| {
                let config = create_configuration(
                    conn,
                    &CreateConfigurationInput {
                        owner_id: "o".into(),
                        adapter_id: h.adapter.id().to_string(),
                        direction,
                        entities: vec![EntityType::Products],
                        ..Default::default()
                    },
                )?;
                let job = create_job(conn, &config, job_type, JobPriority::Normal)?;
                Ok((config, job))
            })
            .unwrap()
    }

    fn product(id: &str, sku: &str, stock: i64) -> Entity {
        Entity::Product(Product {
            id: id.into(),
            sku: Some(sku.into()),
            title: format!("Widget {}", sku),
            stock: Some(stock),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_import_persists_records() {
        let h = harness(MemoryAdapter::new("shop"));
        h.adapter.put(product("r1", "ALPHA", 1));
        h.adapter.put(product("r2", "BRAVO", 2));
        let (config, job) = queue_job(&h, SyncDirection::Import, JobType::FullSync);

        let result = h.engine.execute_job(&job.id).await.unwrap();
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.success_count, 2);
        assert_eq!(h.store.count(EntityType::Products).unwrap(), 2);

        let (job, config_after) = h
            .storage
            .with_connection(|conn| Ok((get_job(conn, &job.id)?, get_configuration(conn, &config.id)?)))
            .unwrap();
        assert_eq!(config_after.last_sync_at, job.completed_at);
    }

    #[tokio::test]
    async fn test_job_is_not_run_twice() {
        let h = harness(MemoryAdapter::new("shop"));
        let (_, job) = queue_job(&h, SyncDirection::Import, JobType::FullSync);
        h.engine.execute_job(&job.id).await.unwrap();
        let again = h.engine.execute_job(&job.id).await;
        assert!(matches!(again, Err(SyncwrightError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_unreadable_type_is_entity_error() {
        let h = harness(
            MemoryAdapter::new("shop").with_capability(EntityType::Products, EntityCapability::default()),
        );
        let (_, job) = queue_job(&h, SyncDirection::Import, JobType::FullSync);
        let result = h.engine.execute_job(&job.id).await.unwrap();
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.error_count, 1);
        assert_eq!(result.errors[0].entity_id, "*");
    }

    #[tokio::test]
    async fn test_invalid_credentials_fail_job() {
        let h = harness(MemoryAdapter::new("shop"));
        h.adapter.set_credentials_valid(false);
        let (config, job) = queue_job(&h, SyncDirection::Import, JobType::FullSync);

        let result = h.engine.execute_job(&job.id).await.unwrap();
        assert_eq!(result.status, JobStatus::Failed);
        assert!(result.error_message.unwrap().contains("credentials"));
        let config = h
            .storage
            .with_connection(|conn| get_configuration(conn, &config.id))
            .unwrap();
        assert!(config.last_sync_at.is_none());
    }

    #[tokio::test]
    async fn test_failed_progress_write_still_fails_job() {
        let h = harness(MemoryAdapter::new("shop"));
        h.adapter.put(product("r1", "ALPHA", 1));
        let (_, job) = queue_job(&h, SyncDirection::Import, JobType::FullSync);
        h.storage
            .with_connection(|conn| {
                Ok(conn.execute_batch(
                    "CREATE TRIGGER reject_progress BEFORE UPDATE OF processed_items ON sync_jobs
                     WHEN OLD.status = 'running'
                     BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
                )?)
            })
            .unwrap();

        let result = h.engine.execute_job(&job.id).await.unwrap();
        assert_eq!(result.status, JobStatus::Failed);
        assert!(result.error_message.unwrap().contains("disk I/O error"));

        let stored = h.storage.with_connection(|conn| get_job(conn, &job.id)).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_export_creates_then_updates() {
        let h = harness(MemoryAdapter::new("shop"));
        h.store
            .upsert(EntityType::Products, "local-1", &product("local-1", "L", 3))
            .unwrap();
        let (_, job) = queue_job(&h, SyncDirection::Export, JobType::FullSync);

        let result = h.engine.execute_job(&job.id).await.unwrap();
        assert_eq!(result.success_count, 1);
        let remote = h.adapter.records(EntityType::Products);
        assert_eq!(remote.len(), 1);
        let remote_id = remote[0].id().to_string();
        assert_eq!(
            h.store.remote_id("shop", EntityType::Products, "local-1").unwrap(),
            Some(remote_id.clone())
        );

        // A second full export updates the linked record instead of creating one
        let (_, job) = queue_job(&h, SyncDirection::Export, JobType::FullSync);
        h.engine.execute_job(&job.id).await.unwrap();
        assert_eq!(h.adapter.records(EntityType::Products).len(), 1);
    }
}
