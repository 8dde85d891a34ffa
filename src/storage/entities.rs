//! Entity store: where synchronized records are persisted
//!
//! The sync engine only talks to the [`EntityStore`] trait, so any durable
//! store with row-level upsert and indexed key lookup can stand in for the
//! SQLite implementation below.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{fmt_ts, Storage};
use crate::dedup::normalize_key;
use crate::error::{Result, SyncwrightError};
use crate::types::{Entity, EntityType};

/// Lookup filter for [`EntityStore::find_existing`]
///
/// Lists are OR-ed together. When every list is empty the most recently
/// synced records are returned, up to `limit`.
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    pub ids: Vec<String>,
    pub primary_keys: Vec<String>,
    pub alternate_keys: Vec<String>,
    pub limit: Option<usize>,
}

impl EntityFilter {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.primary_keys.is_empty() && self.alternate_keys.is_empty()
    }

    /// Filter matching any of the given entities by id or key
    pub fn matching(entities: &[Entity]) -> Self {
        let mut filter = EntityFilter::default();
        for entity in entities {
            filter.ids.push(entity.id().to_string());
            if let Some(key) = entity.primary_key() {
                filter.primary_keys.push(normalize_key(key));
            }
            if let Some(key) = entity.alternate_key() {
                filter.alternate_keys.push(normalize_key(key));
            }
        }
        filter
    }
}

/// What an upsert did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Durable store of canonical entities
pub trait EntityStore: Send + Sync {
    /// Insert or replace the record stored under `key`
    fn upsert(&self, entity_type: EntityType, key: &str, record: &Entity) -> Result<UpsertOutcome>;

    /// Records matching the filter
    fn find_existing(&self, entity_type: EntityType, filter: &EntityFilter) -> Result<Vec<Entity>>;

    /// One record by id
    fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Entity>>;

    /// Records modified after `since` (all records when `None`)
    fn changed_since(
        &self,
        entity_type: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Entity>>;

    /// Remote id of a local record in the given adapter, if it was linked before
    fn remote_id(&self, adapter_id: &str, entity_type: EntityType, local_id: &str)
        -> Result<Option<String>>;

    /// Local id previously linked to a remote record
    fn local_id(&self, adapter_id: &str, entity_type: EntityType, remote_id: &str)
        -> Result<Option<String>>;

    /// Remember which remote record a local record corresponds to
    fn link_remote(
        &self,
        adapter_id: &str,
        entity_type: EntityType,
        local_id: &str,
        remote_id: &str,
    ) -> Result<()>;

    /// Local record a discarded duplicate was collapsed into
    fn alias_of(&self, adapter_id: &str, entity_type: EntityType, remote_id: &str)
        -> Result<Option<String>>;

    /// Record that a remote record is a duplicate of a local one. Unlike
    /// [`link_remote`](Self::link_remote) this never changes where the local
    /// record is exported to.
    fn link_alias(
        &self,
        adapter_id: &str,
        entity_type: EntityType,
        local_id: &str,
        remote_id: &str,
    ) -> Result<()>;
}

/// SQLite-backed [`EntityStore`]
#[derive(Clone)]
pub struct SqliteEntityStore {
    storage: Storage,
}

impl SqliteEntityStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Number of stored records of a type
    pub fn count(&self, entity_type: EntityType) -> Result<i64> {
        self.storage.with_connection(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM entities WHERE entity_type = ?",
                [entity_type.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

fn row_to_entity(data: String) -> Result<Entity> {
    Ok(serde_json::from_str(&data)?)
}

fn collect_entities(
    conn: &Connection,
    sql: &str,
    params_vec: &[Box<dyn rusqlite::ToSql>],
) -> Result<Vec<Entity>> {
    let params_ref: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params_ref.as_slice(), |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(row_to_entity).collect()
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

impl EntityStore for SqliteEntityStore {
    fn upsert(&self, entity_type: EntityType, key: &str, record: &Entity) -> Result<UpsertOutcome> {
        if record.entity_type() != entity_type {
            return Err(SyncwrightError::InvalidInput(format!(
                "Record of type {} stored under {}",
                record.entity_type(),
                entity_type
            )));
        }
        if record.id() != key {
            return Err(SyncwrightError::InvalidInput(format!(
                "Upsert key {} does not match record id {}",
                key,
                record.id()
            )));
        }

        let hash = record.content_hash();
        let data = serde_json::to_string(record)?;
        let primary = record.primary_key().map(normalize_key);
        let alternate = record.alternate_key().map(normalize_key);
        let updated_at = record.updated_at().map(|t| fmt_ts(&t));
        let now = fmt_ts(&Utc::now());

        self.storage.with_transaction(|conn| {
            let existing_hash: Option<String> = conn
                .query_row(
                    "SELECT content_hash FROM entities WHERE entity_type = ? AND id = ?",
                    params![entity_type.as_str(), key],
                    |row| row.get(0),
                )
                .optional()?;

            match existing_hash {
                Some(existing) if existing == hash => Ok(UpsertOutcome::Unchanged),
                Some(_) => {
                    conn.execute(
                        "UPDATE entities
                         SET primary_key = ?, alternate_key = ?, data = ?, content_hash = ?,
                             updated_at = ?, synced_at = ?
                         WHERE entity_type = ? AND id = ?",
                        params![
                            primary,
                            alternate,
                            data,
                            hash,
                            updated_at,
                            now,
                            entity_type.as_str(),
                            key
                        ],
                    )?;
                    Ok(UpsertOutcome::Updated)
                }
                None => {
                    conn.execute(
                        "INSERT INTO entities
                            (entity_type, id, primary_key, alternate_key, data, content_hash, updated_at, synced_at)
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                        params![
                            entity_type.as_str(),
                            key,
                            primary,
                            alternate,
                            data,
                            hash,
                            updated_at,
                            now
                        ],
                    )?;
                    Ok(UpsertOutcome::Inserted)
                }
            }
        })
    }

    fn find_existing(&self, entity_type: EntityType, filter: &EntityFilter) -> Result<Vec<Entity>> {
        let mut sql = String::from("SELECT data FROM entities WHERE entity_type = ?");
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(entity_type.as_str().to_string())];

        if !filter.is_empty() {
            let mut clauses = Vec::new();
            if !filter.ids.is_empty() {
                clauses.push(format!("id IN ({})", placeholders(filter.ids.len())));
                params_vec.extend(filter.ids.iter().map(|v| Box::new(v.clone()) as Box<dyn rusqlite::ToSql>));
            }
            if !filter.primary_keys.is_empty() {
                clauses.push(format!(
                    "primary_key IN ({})",
                    placeholders(filter.primary_keys.len())
                ));
                params_vec.extend(
                    filter
                        .primary_keys
                        .iter()
                        .map(|v| Box::new(normalize_key(v)) as Box<dyn rusqlite::ToSql>),
                );
            }
            if !filter.alternate_keys.is_empty() {
                clauses.push(format!(
                    "alternate_key IN ({})",
                    placeholders(filter.alternate_keys.len())
                ));
                params_vec.extend(
                    filter
                        .alternate_keys
                        .iter()
                        .map(|v| Box::new(normalize_key(v)) as Box<dyn rusqlite::ToSql>),
                );
            }
            sql.push_str(&format!(" AND ({})", clauses.join(" OR ")));
            sql.push_str(" ORDER BY rowid ASC");
        } else {
            sql.push_str(" ORDER BY synced_at DESC, rowid DESC");
        }

        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        self.storage
            .with_connection(|conn| collect_entities(conn, &sql, &params_vec))
    }

    fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Entity>> {
        self.storage.with_connection(|conn| {
            let data: Option<String> = conn
                .query_row(
                    "SELECT data FROM entities WHERE entity_type = ? AND id = ?",
                    params![entity_type.as_str(), id],
                    |row| row.get(0),
                )
                .optional()?;
            data.map(row_to_entity).transpose()
        })
    }

    fn changed_since(
        &self,
        entity_type: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Entity>> {
        let mut sql = String::from("SELECT data FROM entities WHERE entity_type = ?");
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(entity_type.as_str().to_string())];
        if let Some(since) = since {
            sql.push_str(" AND COALESCE(updated_at, synced_at) > ?");
            params_vec.push(Box::new(fmt_ts(&since)));
        }
        sql.push_str(" ORDER BY COALESCE(updated_at, synced_at) ASC, rowid ASC");

        self.storage
            .with_connection(|conn| collect_entities(conn, &sql, &params_vec))
    }

    fn remote_id(
        &self,
        adapter_id: &str,
        entity_type: EntityType,
        local_id: &str,
    ) -> Result<Option<String>> {
        self.storage.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT remote_id FROM entity_links
                     WHERE adapter_id = ? AND entity_type = ? AND local_id = ?",
                    params![adapter_id, entity_type.as_str(), local_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    fn local_id(
        &self,
        adapter_id: &str,
        entity_type: EntityType,
        remote_id: &str,
    ) -> Result<Option<String>> {
        self.storage.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT local_id FROM entity_links
                     WHERE adapter_id = ? AND entity_type = ? AND remote_id = ?
                     ORDER BY linked_at DESC LIMIT 1",
                    params![adapter_id, entity_type.as_str(), remote_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    fn link_remote(
        &self,
        adapter_id: &str,
        entity_type: EntityType,
        local_id: &str,
        remote_id: &str,
    ) -> Result<()> {
        self.storage.with_connection(|conn| {
            conn.execute(
                "INSERT INTO entity_links (adapter_id, entity_type, local_id, remote_id, linked_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(adapter_id, entity_type, local_id)
                 DO UPDATE SET remote_id = excluded.remote_id, linked_at = excluded.linked_at",
                params![
                    adapter_id,
                    entity_type.as_str(),
                    local_id,
                    remote_id,
                    fmt_ts(&Utc::now())
                ],
            )?;
            Ok(())
        })
    }

    fn alias_of(
        &self,
        adapter_id: &str,
        entity_type: EntityType,
        remote_id: &str,
    ) -> Result<Option<String>> {
        self.storage.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT local_id FROM entity_aliases
                     WHERE adapter_id = ? AND entity_type = ? AND remote_id = ?",
                    params![adapter_id, entity_type.as_str(), remote_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    fn link_alias(
        &self,
        adapter_id: &str,
        entity_type: EntityType,
        local_id: &str,
        remote_id: &str,
    ) -> Result<()> {
        self.storage.with_connection(|conn| {
            conn.execute(
                "INSERT INTO entity_aliases (adapter_id, entity_type, remote_id, local_id, linked_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(adapter_id, entity_type, remote_id)
                 DO UPDATE SET local_id = excluded.local_id, linked_at = excluded.linked_at",
                params![
                    adapter_id,
                    entity_type.as_str(),
                    remote_id,
                    local_id,
                    fmt_ts(&Utc::now())
                ],
            )?;
            Ok(())
        })
    }
}
