//! Adapter contract for external systems
//!
//! Every marketplace, storefront or ERP binding implements [`Adapter`].
//! Bindings differ in what they can do per entity type (read-only,
//! write-capable, webhook-capable), which they report through
//! [`Adapter::capabilities`]; the engine checks these before each call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Result, SyncwrightError};
use crate::types::{Entity, EntityType};

/// What an adapter can do for one entity type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCapability {
    pub read: bool,
    pub write: bool,
    pub webhook_support: bool,
}

impl EntityCapability {
    pub const READ_ONLY: EntityCapability = EntityCapability {
        read: true,
        write: false,
        webhook_support: false,
    };

    pub const READ_WRITE: EntityCapability = EntityCapability {
        read: true,
        write: true,
        webhook_support: false,
    };
}

/// Capabilities per entity type; missing types support nothing
pub type Capabilities = HashMap<EntityType, EntityCapability>;

/// Options for one page of [`Adapter::fetch_entities`]
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Only records modified after this instant
    pub since: Option<DateTime<Utc>>,
    /// Page size
    pub limit: usize,
    /// Opaque continuation token returned by the previous page
    pub cursor: Option<String>,
}

/// One page of fetched records
#[derive(Debug, Clone, Default)]
pub struct FetchPage {
    pub entities: Vec<Entity>,
    /// `None` once the last page has been returned
    pub next_cursor: Option<String>,
}

/// Binding to one external system
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Registry key
    fn id(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    fn capability(&self, entity_type: EntityType) -> EntityCapability {
        self.capabilities()
            .get(&entity_type)
            .copied()
            .unwrap_or_default()
    }

    /// `Ok(false)` when the remote rejects the stored credentials
    async fn validate_credentials(&self) -> Result<bool>;

    async fn fetch_entities(
        &self,
        entity_type: EntityType,
        options: &FetchOptions,
    ) -> Result<FetchPage>;

    /// Create a record remotely; the returned entity carries the remote id
    async fn create_entity(&self, entity_type: EntityType, entity: &Entity) -> Result<Entity>;

    /// Update a record remotely; `entity` carries the remote id
    async fn update_entity(&self, entity_type: EntityType, entity: &Entity) -> Result<Entity>;
}

/// Adapters by id
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: Arc<RwLock<HashMap<String, Arc<dyn Adapter>>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one with the same id
    pub fn register(&self, adapter: Arc<dyn Adapter>) {
        let id = adapter.id().to_string();
        tracing::debug!(adapter_id = %id, "Adapter registered");
        self.adapters.write().insert(id, adapter);
    }

    pub fn get(&self, adapter_id: &str) -> Result<Arc<dyn Adapter>> {
        self.adapters
            .read()
            .get(adapter_id)
            .cloned()
            .ok_or_else(|| SyncwrightError::NotFound(format!("adapter {}", adapter_id)))
    }

    pub fn contains(&self, adapter_id: &str) -> bool {
        self.adapters.read().contains_key(adapter_id)
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn is_newer(entity: &Entity, since: Option<DateTime<Utc>>) -> bool {
    match (since, entity.updated_at()) {
        (Some(since), Some(updated)) => updated > since,
        // Records without a timestamp are always reported
        _ => true,
    }
}

fn page_of(mut entities: Vec<Entity>, options: &FetchOptions) -> Result<FetchPage> {
    let offset = match options.cursor.as_deref() {
        Some(cursor) => cursor.parse::<usize>().map_err(|_| {
            SyncwrightError::InvalidInput(format!("Invalid page cursor: {}", cursor))
        })?,
        None => 0,
    };
    let limit = options.limit.max(1);
    let total = entities.len();
    let end = (offset + limit).min(total);
    let page: Vec<Entity> = if offset < total {
        entities.drain(offset..end).collect()
    } else {
        Vec::new()
    };
    Ok(FetchPage {
        entities: page,
        next_cursor: (end < total).then(|| end.to_string()),
    })
}

/// In-process adapter holding records in memory
///
/// Used for tests, demos and as a loopback target.
pub struct MemoryAdapter {
    id: String,
    capabilities: RwLock<Capabilities>,
    records: Mutex<HashMap<EntityType, Vec<Entity>>>,
    credentials_valid: AtomicBool,
    reachable: AtomicBool,
    fetch_calls: AtomicUsize,
    next_remote_id: AtomicUsize,
}

impl MemoryAdapter {
    /// Adapter with read/write access to every entity type
    pub fn new(id: impl Into<String>) -> Self {
        let capabilities = EntityType::ALL
            .iter()
            .map(|t| (*t, EntityCapability::READ_WRITE))
            .collect();
        Self {
            id: id.into(),
            capabilities: RwLock::new(capabilities),
            records: Mutex::new(HashMap::new()),
            credentials_valid: AtomicBool::new(true),
            reachable: AtomicBool::new(true),
            fetch_calls: AtomicUsize::new(0),
            next_remote_id: AtomicUsize::new(1),
        }
    }

    pub fn with_capability(self, entity_type: EntityType, capability: EntityCapability) -> Self {
        self.capabilities.write().insert(entity_type, capability);
        self
    }

    /// Insert or replace a record, keeping first-insert order
    pub fn put(&self, entity: Entity) {
        let mut records = self.records.lock();
        let list = records.entry(entity.entity_type()).or_default();
        match list.iter_mut().find(|e| e.id() == entity.id()) {
            Some(slot) => *slot = entity,
            None => list.push(entity),
        }
    }

    pub fn records(&self, entity_type: EntityType) -> Vec<Entity> {
        self.records
            .lock()
            .get(&entity_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_credentials_valid(&self, valid: bool) {
        self.credentials_valid.store(valid, Ordering::SeqCst);
    }

    /// Simulate an outage: every call fails with `AdapterUnavailable`
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    fn ensure_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncwrightError::AdapterUnavailable(format!(
                "{} is unreachable",
                self.id
            )))
        }
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.read().clone()
    }

    async fn validate_credentials(&self) -> Result<bool> {
        self.ensure_reachable()?;
        Ok(self.credentials_valid.load(Ordering::SeqCst))
    }

    async fn fetch_entities(
        &self,
        entity_type: EntityType,
        options: &FetchOptions,
    ) -> Result<FetchPage> {
        self.ensure_reachable()?;
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let matching: Vec<Entity> = self
            .records(entity_type)
            .into_iter()
            .filter(|e| is_newer(e, options.since))
            .collect();
        page_of(matching, options)
    }

    async fn create_entity(&self, entity_type: EntityType, entity: &Entity) -> Result<Entity> {
        self.ensure_reachable()?;
        let mut created = entity.clone();
        let n = self.next_remote_id.fetch_add(1, Ordering::SeqCst);
        created.set_id(format!("{}-{}-{}", self.id, entity_type, n));
        self.put(created.clone());
        Ok(created)
    }

    async fn update_entity(&self, entity_type: EntityType, entity: &Entity) -> Result<Entity> {
        self.ensure_reachable()?;
        let exists = self
            .records(entity_type)
            .iter()
            .any(|e| e.id() == entity.id());
        if !exists {
            return Err(SyncwrightError::Adapter(format!(
                "{} has no {} record {}",
                self.id,
                entity_type,
                entity.id()
            )));
        }
        self.put(entity.clone());
        Ok(entity.clone())
    }
}

/// Adapter over a directory of JSON files, one `<entity_type>.json` array
/// per type
///
/// Writes replace the file through a temporary sibling and a rename.
pub struct JsonDirAdapter {
    id: String,
    dir: PathBuf,
    capabilities: Capabilities,
}

impl JsonDirAdapter {
    /// Read/write access to every entity type
    pub fn new(id: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        let capabilities = EntityType::ALL
            .iter()
            .map(|t| (*t, EntityCapability::READ_WRITE))
            .collect();
        Self {
            id: id.into(),
            dir: dir.into(),
            capabilities,
        }
    }

    /// Read-only view of the directory
    pub fn read_only(id: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        let mut adapter = Self::new(id, dir);
        for capability in adapter.capabilities.values_mut() {
            capability.write = false;
        }
        adapter
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, entity_type: EntityType) -> PathBuf {
        self.dir.join(format!("{}.json", entity_type.as_str()))
    }

    async fn load(&self, entity_type: EntityType) -> Result<Vec<Entity>> {
        if !tokio::fs::try_exists(&self.dir).await? {
            return Err(SyncwrightError::AdapterUnavailable(format!(
                "directory {} does not exist",
                self.dir.display()
            )));
        }
        let path = self.file_for(entity_type);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }
        let raw = tokio::fs::read_to_string(&path).await?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).map_err(|e| {
            SyncwrightError::Adapter(format!("{}: malformed {}: {}", self.id, path.display(), e))
        })
    }

    async fn store(&self, entity_type: EntityType, entities: &[Entity]) -> Result<()> {
        let path = self.file_for(entity_type);
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_string_pretty(entities)?;
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    fn check_write(&self, entity_type: EntityType) -> Result<()> {
        if self.capability(entity_type).write {
            Ok(())
        } else {
            Err(SyncwrightError::Capability(format!(
                "{} cannot write {}",
                self.id, entity_type
            )))
        }
    }
}

#[async_trait]
impl Adapter for JsonDirAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn validate_credentials(&self) -> Result<bool> {
        Ok(tokio::fs::try_exists(&self.dir).await?)
    }

    async fn fetch_entities(
        &self,
        entity_type: EntityType,
        options: &FetchOptions,
    ) -> Result<FetchPage> {
        let matching: Vec<Entity> = self
            .load(entity_type)
            .await?
            .into_iter()
            .filter(|e| e.entity_type() == entity_type && is_newer(e, options.since))
            .collect();
        page_of(matching, options)
    }

    async fn create_entity(&self, entity_type: EntityType, entity: &Entity) -> Result<Entity> {
        self.check_write(entity_type)?;
        let mut entities = self.load(entity_type).await?;
        let mut created = entity.clone();
        created.set_id(uuid::Uuid::new_v4().to_string());
        entities.push(created.clone());
        self.store(entity_type, &entities).await?;
        Ok(created)
    }

    async fn update_entity(&self, entity_type: EntityType, entity: &Entity) -> Result<Entity> {
        self.check_write(entity_type)?;
        let mut entities = self.load(entity_type).await?;
        let slot = entities
            .iter_mut()
            .find(|e| e.id() == entity.id())
            .ok_or_else(|| {
                SyncwrightError::Adapter(format!(
                    "{} has no {} record {}",
                    self.id,
                    entity_type,
                    entity.id()
                ))
            })?;
        *slot = entity.clone();
        self.store(entity_type, &entities).await?;
        Ok(entity.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Product;

    fn product(id: &str, sku: &str) -> Entity {
        Entity::Product(Product {
            id: id.into(),
            sku: Some(sku.into()),
            title: format!("Product {}", sku),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_memory_adapter_paging() {
        let adapter = MemoryAdapter::new("mem");
        for i in 0..5 {
            adapter.put(product(&format!("p{}", i), &format!("S{}", i)));
        }

        let mut options = FetchOptions {
            limit: 2,
            ..Default::default()
        };
        let mut seen = Vec::new();
        loop {
            let page = adapter
                .fetch_entities(EntityType::Products, &options)
                .await
                .unwrap();
            seen.extend(page.entities.iter().map(|e| e.id().to_string()));
            match page.next_cursor {
                Some(cursor) => options.cursor = Some(cursor),
                None => break,
            }
        }
        assert_eq!(seen, vec!["p0", "p1", "p2", "p3", "p4"]);
        assert_eq!(adapter.fetch_calls(), 3);
    }

    #[tokio::test]
    async fn test_memory_adapter_since_filter() {
        let adapter = MemoryAdapter::new("mem");
        let now = Utc::now();
        let mut old = product("old", "A");
        old.set_updated_at(Some(now - chrono::Duration::hours(3)));
        let mut fresh = product("fresh", "B");
        fresh.set_updated_at(Some(now));
        adapter.put(old);
        adapter.put(fresh);

        let page = adapter
            .fetch_entities(
                EntityType::Products,
                &FetchOptions {
                    since: Some(now - chrono::Duration::hours(1)),
                    limit: 10,
                    cursor: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(page.entities.len(), 1);
        assert_eq!(page.entities[0].id(), "fresh");
    }

    #[tokio::test]
    async fn test_memory_adapter_unreachable() {
        let adapter = MemoryAdapter::new("mem");
        adapter.set_reachable(false);
        let err = adapter.validate_credentials().await.unwrap_err();
        assert!(matches!(err, SyncwrightError::AdapterUnavailable(_)));
    }

    #[test]
    fn test_registry() {
        let registry = AdapterRegistry::new();
        registry.register(Arc::new(MemoryAdapter::new("b")));
        registry.register(Arc::new(MemoryAdapter::new("a")));
        assert!(registry.contains("a"));
        assert_eq!(registry.ids(), vec!["a", "b"]);
        assert!(registry.get("missing").is_err());
    }

    #[tokio::test]
    async fn test_json_dir_adapter_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = JsonDirAdapter::new("files", dir.path());

        let created = adapter
            .create_entity(EntityType::Products, &product("local", "S1"))
            .await
            .unwrap();
        assert_ne!(created.id(), "local");

        let page = adapter
            .fetch_entities(
                EntityType::Products,
                &FetchOptions {
                    limit: 10,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.entities, vec![created.clone()]);

        let missing = adapter
            .update_entity(EntityType::Products, &product("nope", "S2"))
            .await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn test_json_dir_adapter_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = JsonDirAdapter::read_only("files", dir.path());
        let err = adapter
            .create_entity(EntityType::Products, &product("p", "S"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncwrightError::Capability(_)));
        assert!(!adapter.capability(EntityType::Orders).write);
    }

    #[tokio::test]
    async fn test_json_dir_adapter_missing_dir() {
        let adapter = JsonDirAdapter::new("files", "/nonexistent/syncwright-test");
        assert!(!adapter.validate_credentials().await.unwrap());
        let err = adapter
            .fetch_entities(EntityType::Products, &FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncwrightError::AdapterUnavailable(_)));
    }
}
