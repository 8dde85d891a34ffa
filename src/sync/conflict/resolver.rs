//! Applying decisions to open conflicts

use std::sync::Arc;

use super::{
    get_conflict, list_conflicts, mark_resolved, reopen_conflict, ConflictFilter, ResolutionAction,
    SyncConflict,
};
use crate::error::{Result, SyncwrightError};
use crate::storage::{EntityStore, Storage};
use crate::sync::config::{ConflictRule, SyncConfiguration};
use crate::types::Entity;

/// Resolves conflicts manually or by re-applying configuration rules
#[derive(Clone)]
pub struct ConflictResolver {
    storage: Storage,
    store: Arc<dyn EntityStore>,
}

impl ConflictResolver {
    pub fn new(storage: Storage, store: Arc<dyn EntityStore>) -> Self {
        Self { storage, store }
    }

    /// Manual resolution; already resolved conflicts are rejected
    pub fn resolve(
        &self,
        conflict_id: &str,
        action: ResolutionAction,
        resolved_by: &str,
    ) -> Result<SyncConflict> {
        self.resolve_with(conflict_id, action, resolved_by, false)
    }

    /// Resolve every open conflict of the configuration whose field now has
    /// a `source_wins` / `destination_wins` rule. Returns how many were closed.
    pub fn reapply_rules(&self, config: &SyncConfiguration) -> Result<usize> {
        let open = self.storage.with_connection(|conn| {
            list_conflicts(
                conn,
                &ConflictFilter {
                    configuration_id: Some(config.id.clone()),
                    open_only: true,
                    ..Default::default()
                },
            )
        })?;

        let mut resolved = 0;
        for conflict in open {
            let Some(field) = conflict.field.as_deref() else {
                continue;
            };
            let action = match config.rule_for(field) {
                Some(ConflictRule::SourceWins) => ResolutionAction::SourceWins,
                Some(ConflictRule::DestinationWins) => ResolutionAction::DestinationWins,
                Some(ConflictRule::ManualReview) | None => continue,
            };
            match self.resolve_with(&conflict.id, action, "rules", true) {
                Ok(_) => resolved += 1,
                // Someone resolved it in between
                Err(SyncwrightError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }

        tracing::info!(config_id = %config.id, resolved, "Conflict rules re-applied");
        Ok(resolved)
    }

    fn resolve_with(
        &self,
        conflict_id: &str,
        action: ResolutionAction,
        resolved_by: &str,
        auto_resolved: bool,
    ) -> Result<SyncConflict> {
        let conflict = self
            .storage
            .with_connection(|conn| get_conflict(conn, conflict_id))?;
        if !conflict.resolution_required {
            return Err(SyncwrightError::Conflict(format!(
                "conflict {} is already resolved",
                conflict_id
            )));
        }

        let patched = match action {
            ResolutionAction::SourceWins => Some(self.source_record(&conflict)?),
            ResolutionAction::DestinationWins => None,
        };

        // Claim first: only the caller that closes the conflict writes the record
        let closed = self.storage.with_transaction(|conn| {
            mark_resolved(conn, conflict_id, action, resolved_by, auto_resolved)
        })?;
        if !closed {
            return Err(SyncwrightError::Conflict(format!(
                "conflict {} is already resolved",
                conflict_id
            )));
        }

        if let Some(record) = patched {
            if let Err(e) = self
                .store
                .upsert(conflict.entity_type, &conflict.entity_id, &record)
            {
                self.storage.with_transaction(|conn| {
                    reopen_conflict(conn, conflict_id, resolved_by, &e.to_string())
                })?;
                return Err(e);
            }
        }

        tracing::info!(
            conflict_id = %conflict_id,
            action = action.as_str(),
            resolved_by = %resolved_by,
            "Conflict resolved"
        );
        self.storage
            .with_connection(|conn| get_conflict(conn, conflict_id))
    }

    /// The stored record with the source side of the conflict applied
    fn source_record(&self, conflict: &SyncConflict) -> Result<Entity> {
        Ok(match conflict.field.as_deref() {
            Some(field) => {
                let stored = self
                    .store
                    .get(conflict.entity_type, &conflict.entity_id)?
                    .ok_or_else(|| {
                        SyncwrightError::NotFound(format!(
                            "{} {}",
                            conflict.entity_type, conflict.entity_id
                        ))
                    })?;
                let mut patch = serde_json::Map::new();
                patch.insert(field.to_string(), conflict.source_data.clone());
                stored.with_fields(patch)?
            }
            None => {
                // Whole-record conflict: the snapshot replaces the stored record
                let mut entity: Entity = serde_json::from_value(conflict.source_data.clone())?;
                entity.set_id(conflict.entity_id.clone());
                entity
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteEntityStore;
    use crate::sync::config::{create_configuration, set_conflict_rule, CreateConfigurationInput};
    use crate::storage::{EntityFilter, UpsertOutcome};
    use crate::sync::conflict::{insert_conflict, ConflictType};
    use crate::sync::job::{create_job, JobPriority, JobType};
    use crate::types::{EntityType, Product};
    use chrono::{DateTime, Utc};

    /// Store that lets another resolver win the conflict while the record
    /// is being read, or refuses every write
    struct InterferingStore {
        inner: Arc<SqliteEntityStore>,
        storage: Storage,
        race_conflict: Option<String>,
        reject_writes: bool,
    }

    impl EntityStore for InterferingStore {
        fn upsert(&self, entity_type: EntityType, key: &str, record: &Entity) -> Result<UpsertOutcome> {
            if self.reject_writes {
                return Err(SyncwrightError::Storage("entity store is read-only".into()));
            }
            self.inner.upsert(entity_type, key, record)
        }

        fn find_existing(&self, entity_type: EntityType, filter: &EntityFilter) -> Result<Vec<Entity>> {
            self.inner.find_existing(entity_type, filter)
        }

        fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Entity>> {
            if let Some(ref conflict_id) = self.race_conflict {
                self.storage.with_transaction(|conn| {
                    mark_resolved(conn, conflict_id, ResolutionAction::DestinationWins, "cli", false)
                })?;
            }
            self.inner.get(entity_type, id)
        }

        fn changed_since(
            &self,
            entity_type: EntityType,
            since: Option<DateTime<Utc>>,
        ) -> Result<Vec<Entity>> {
            self.inner.changed_since(entity_type, since)
        }

        fn remote_id(&self, adapter_id: &str, entity_type: EntityType, local_id: &str) -> Result<Option<String>> {
            self.inner.remote_id(adapter_id, entity_type, local_id)
        }

        fn local_id(&self, adapter_id: &str, entity_type: EntityType, remote_id: &str) -> Result<Option<String>> {
            self.inner.local_id(adapter_id, entity_type, remote_id)
        }

        fn link_remote(
            &self,
            adapter_id: &str,
            entity_type: EntityType,
            local_id: &str,
            remote_id: &str,
        ) -> Result<()> {
            self.inner.link_remote(adapter_id, entity_type, local_id, remote_id)
        }

        fn alias_of(&self, adapter_id: &str, entity_type: EntityType, remote_id: &str) -> Result<Option<String>> {
            self.inner.alias_of(adapter_id, entity_type, remote_id)
        }

        fn link_alias(
            &self,
            adapter_id: &str,
            entity_type: EntityType,
            local_id: &str,
            remote_id: &str,
        ) -> Result<()> {
            self.inner.link_alias(adapter_id, entity_type, local_id, remote_id)
        }
    }

    struct Fixture {
        storage: Storage,
        store: Arc<SqliteEntityStore>,
        config: SyncConfiguration,
        conflict_id: String,
    }

    fn fixture() -> Fixture {
        let storage = Storage::open_in_memory().unwrap();
        let store = Arc::new(SqliteEntityStore::new(storage.clone()));
        store
            .upsert(
                EntityType::Products,
                "p1",
                &Entity::Product(Product {
                    id: "p1".into(),
                    sku: Some("S1".into()),
                    price: Some(10.0),
                    ..Default::default()
                }),
            )
            .unwrap();

        let (config, conflict_id) = storage
            .with_connection(|conn| {
                let config = create_configuration(
                    conn,
                    &CreateConfigurationInput {
                        owner_id: "o".into(),
                        adapter_id: "shop".into(),
                        entities: vec![EntityType::Products],
                        ..Default::default()
                    },
                )?;
                let job = create_job(conn, &config, JobType::Incremental, JobPriority::Normal)?;
                let conflict = SyncConflict {
                    id: "conflict-1".into(),
                    job_id: job.id.clone(),
                    configuration_id: config.id.clone(),
                    entity_type: EntityType::Products,
                    entity_id: "p1".into(),
                    field: Some("price".into()),
                    conflict_type: ConflictType::VersionConflict,
                    source_data: serde_json::json!(12.5),
                    destination_data: serde_json::json!(10.0),
                    resolution_required: true,
                    auto_resolved: false,
                    resolution_action: None,
                    resolved_at: None,
                    resolved_by: None,
                    detected_at: Utc::now(),
                };
                insert_conflict(conn, &conflict)?;
                Ok((config, conflict.id))
            })
            .unwrap();

        Fixture {
            storage,
            store,
            config,
            conflict_id,
        }
    }

    fn price(store: &SqliteEntityStore) -> Option<f64> {
        match store.get(EntityType::Products, "p1").unwrap() {
            Some(Entity::Product(p)) => p.price,
            _ => None,
        }
    }

    #[test]
    fn test_manual_source_wins_patches_record() {
        let f = fixture();
        let resolver = ConflictResolver::new(f.storage.clone(), f.store.clone());

        let resolved = resolver
            .resolve(&f.conflict_id, ResolutionAction::SourceWins, "ana")
            .unwrap();
        assert!(!resolved.resolution_required);
        assert!(!resolved.auto_resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("ana"));
        assert_eq!(price(&f.store), Some(12.5));

        // Resolved conflicts are immutable
        let again = resolver.resolve(&f.conflict_id, ResolutionAction::DestinationWins, "bob");
        assert!(matches!(again, Err(SyncwrightError::Conflict(_))));
    }

    #[test]
    fn test_destination_wins_keeps_record() {
        let f = fixture();
        let resolver = ConflictResolver::new(f.storage.clone(), f.store.clone());
        resolver
            .resolve(&f.conflict_id, ResolutionAction::DestinationWins, "ana")
            .unwrap();
        assert_eq!(price(&f.store), Some(10.0));
    }

    #[test]
    fn test_reapply_rules() {
        let f = fixture();
        let resolver = ConflictResolver::new(f.storage.clone(), f.store.clone());
        assert_eq!(resolver.reapply_rules(&f.config).unwrap(), 0);

        let config = f
            .storage
            .with_connection(|conn| {
                set_conflict_rule(conn, &f.config.id, "price", Some(ConflictRule::SourceWins))
            })
            .unwrap();
        assert_eq!(resolver.reapply_rules(&config).unwrap(), 1);
        assert_eq!(price(&f.store), Some(12.5));

        let conflict = f
            .storage
            .with_connection(|conn| get_conflict(conn, &f.conflict_id))
            .unwrap();
        assert!(conflict.auto_resolved);
        assert_eq!(conflict.resolved_by.as_deref(), Some("rules"));
    }

    #[test]
    fn test_losing_resolution_leaves_record_alone() {
        let f = fixture();
        let store = Arc::new(InterferingStore {
            inner: f.store.clone(),
            storage: f.storage.clone(),
            race_conflict: Some(f.conflict_id.clone()),
            reject_writes: false,
        });
        let resolver = ConflictResolver::new(f.storage.clone(), store);

        let result = resolver.resolve(&f.conflict_id, ResolutionAction::SourceWins, "rules");
        assert!(matches!(result, Err(SyncwrightError::Conflict(_))));
        assert_eq!(price(&f.store), Some(10.0));

        let conflict = f
            .storage
            .with_connection(|conn| get_conflict(conn, &f.conflict_id))
            .unwrap();
        assert_eq!(conflict.resolution_action, Some(ResolutionAction::DestinationWins));
        assert_eq!(conflict.resolved_by.as_deref(), Some("cli"));
    }

    #[test]
    fn test_failed_write_reopens_conflict() {
        let f = fixture();
        let store = Arc::new(InterferingStore {
            inner: f.store.clone(),
            storage: f.storage.clone(),
            race_conflict: None,
            reject_writes: true,
        });
        let resolver = ConflictResolver::new(f.storage.clone(), store);

        let result = resolver.resolve(&f.conflict_id, ResolutionAction::SourceWins, "ana");
        assert!(matches!(result, Err(SyncwrightError::Storage(_))));

        let conflict = f
            .storage
            .with_connection(|conn| get_conflict(conn, &f.conflict_id))
            .unwrap();
        assert!(conflict.resolution_required);
        assert!(conflict.resolution_action.is_none());
        assert_eq!(price(&f.store), Some(10.0));
    }
}
