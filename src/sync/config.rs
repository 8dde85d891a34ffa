//! Sync configurations: what to sync, how often, in which direction and
//! how to settle field conflicts

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, SyncwrightError};
use crate::storage::{columns, fmt_ts, log_audit, AuditAction, AuditRecord};
use crate::types::EntityType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// External system → local store
    #[default]
    Import,
    /// Local store → external system
    Export,
    Bidirectional,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::Import => "import",
            SyncDirection::Export => "export",
            SyncDirection::Bidirectional => "bidirectional",
        }
    }

    pub fn imports(&self) -> bool {
        matches!(self, SyncDirection::Import | SyncDirection::Bidirectional)
    }

    pub fn exports(&self) -> bool {
        matches!(self, SyncDirection::Export | SyncDirection::Bidirectional)
    }
}

impl std::str::FromStr for SyncDirection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "import" => Ok(SyncDirection::Import),
            "export" => Ok(SyncDirection::Export),
            "bidirectional" => Ok(SyncDirection::Bidirectional),
            _ => Err(format!("Unknown sync direction: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncFrequency {
    /// Only on explicit trigger
    #[default]
    Manual,
    /// Driven by webhooks
    Realtime,
    Hourly,
    Daily,
}

impl SyncFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncFrequency::Manual => "manual",
            SyncFrequency::Realtime => "realtime",
            SyncFrequency::Hourly => "hourly",
            SyncFrequency::Daily => "daily",
        }
    }

    /// Scheduling interval; `None` for frequencies the scheduler never fires
    pub fn interval(&self) -> Option<Duration> {
        match self {
            SyncFrequency::Hourly => Some(Duration::hours(1)),
            SyncFrequency::Daily => Some(Duration::hours(24)),
            SyncFrequency::Manual | SyncFrequency::Realtime => None,
        }
    }
}

impl std::str::FromStr for SyncFrequency {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "manual" => Ok(SyncFrequency::Manual),
            "realtime" => Ok(SyncFrequency::Realtime),
            "hourly" => Ok(SyncFrequency::Hourly),
            "daily" => Ok(SyncFrequency::Daily),
            _ => Err(format!("Unknown sync frequency: {}", s)),
        }
    }
}

/// Per-field conflict policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictRule {
    SourceWins,
    DestinationWins,
    ManualReview,
}

impl ConflictRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictRule::SourceWins => "source_wins",
            ConflictRule::DestinationWins => "destination_wins",
            ConflictRule::ManualReview => "manual_review",
        }
    }
}

impl std::str::FromStr for ConflictRule {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "source_wins" => Ok(ConflictRule::SourceWins),
            "destination_wins" => Ok(ConflictRule::DestinationWins),
            "manual_review" => Ok(ConflictRule::ManualReview),
            _ => Err(format!("Unknown conflict rule: {}", s)),
        }
    }
}

/// Durable description of one sync relationship
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfiguration {
    pub id: String,
    pub owner_id: String,
    pub adapter_id: String,
    pub direction: SyncDirection,
    pub frequency: SyncFrequency,
    pub entities: Vec<EntityType>,
    pub auto_resolve_conflicts: bool,
    pub conflict_rules: BTreeMap<String, ConflictRule>,
    pub is_active: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncConfiguration {
    /// When the scheduler should next run this configuration
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        if !self.is_active {
            return None;
        }
        let interval = self.frequency.interval()?;
        Some(match self.last_sync_at {
            Some(last) => last + interval,
            // Never synced: due immediately
            None => self.created_at,
        })
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match (self.frequency.interval(), self.last_sync_at) {
            _ if !self.is_active => false,
            (None, _) => false,
            (Some(_), None) => true,
            (Some(interval), Some(last)) => now - last >= interval,
        }
    }

    pub fn rule_for(&self, field: &str) -> Option<ConflictRule> {
        self.conflict_rules.get(field).copied()
    }
}

/// Input for [`create_configuration`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateConfigurationInput {
    pub owner_id: String,
    pub adapter_id: String,
    #[serde(default)]
    pub direction: SyncDirection,
    #[serde(default)]
    pub frequency: SyncFrequency,
    pub entities: Vec<EntityType>,
    #[serde(default = "default_true")]
    pub auto_resolve_conflicts: bool,
    #[serde(default)]
    pub conflict_rules: BTreeMap<String, ConflictRule>,
}

fn default_true() -> bool {
    true
}

/// Partial update; `None` leaves a field as it is
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateConfigurationInput {
    pub direction: Option<SyncDirection>,
    pub frequency: Option<SyncFrequency>,
    pub entities: Option<Vec<EntityType>>,
    pub auto_resolve_conflicts: Option<bool>,
    pub is_active: Option<bool>,
}

fn dedup_entities(entities: &[EntityType]) -> Vec<EntityType> {
    let mut out: Vec<EntityType> = Vec::with_capacity(entities.len());
    for entity_type in entities {
        if !out.contains(entity_type) {
            out.push(*entity_type);
        }
    }
    out
}

fn configuration_from_row(row: &Row) -> rusqlite::Result<SyncConfiguration> {
    Ok(SyncConfiguration {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        adapter_id: row.get("adapter_id")?,
        direction: columns::parsed(row, "direction")?,
        frequency: columns::parsed(row, "frequency")?,
        entities: columns::json(row, "entities")?,
        auto_resolve_conflicts: row.get::<_, i32>("auto_resolve_conflicts")? != 0,
        conflict_rules: columns::json(row, "conflict_rules")?,
        is_active: row.get::<_, i32>("is_active")? != 0,
        last_sync_at: columns::timestamp_opt(row, "last_sync_at")?,
        created_at: columns::timestamp(row, "created_at")?,
        updated_at: columns::timestamp(row, "updated_at")?,
    })
}

/// Create a configuration
pub fn create_configuration(
    conn: &Connection,
    input: &CreateConfigurationInput,
) -> Result<SyncConfiguration> {
    if input.owner_id.trim().is_empty() || input.adapter_id.trim().is_empty() {
        return Err(SyncwrightError::InvalidInput(
            "owner_id and adapter_id are required".to_string(),
        ));
    }
    let entities = dedup_entities(&input.entities);
    if entities.is_empty() {
        return Err(SyncwrightError::InvalidInput(
            "an active configuration needs at least one entity type".to_string(),
        ));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let now = fmt_ts(&Utc::now());
    conn.execute(
        "INSERT INTO sync_configurations
            (id, owner_id, adapter_id, direction, frequency, entities,
             auto_resolve_conflicts, conflict_rules, is_active, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        params![
            id,
            input.owner_id,
            input.adapter_id,
            input.direction.as_str(),
            input.frequency.as_str(),
            serde_json::to_string(&entities)?,
            input.auto_resolve_conflicts as i32,
            serde_json::to_string(&input.conflict_rules)?,
            now,
            now
        ],
    )?;

    tracing::info!(config_id = %id, adapter_id = %input.adapter_id, "Sync configuration created");
    get_configuration(conn, &id)
}

pub fn get_configuration(conn: &Connection, id: &str) -> Result<SyncConfiguration> {
    conn.query_row(
        "SELECT * FROM sync_configurations WHERE id = ?",
        params![id],
        configuration_from_row,
    )
    .optional()?
    .ok_or_else(|| SyncwrightError::NotFound(format!("configuration {}", id)))
}

/// All configurations, oldest first
pub fn list_configurations(conn: &Connection, active_only: bool) -> Result<Vec<SyncConfiguration>> {
    let sql = if active_only {
        "SELECT * FROM sync_configurations WHERE is_active = 1 ORDER BY created_at, id"
    } else {
        "SELECT * FROM sync_configurations ORDER BY created_at, id"
    };
    let mut stmt = conn.prepare(sql)?;
    let configs = stmt
        .query_map([], configuration_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(configs)
}

/// Apply a partial update
pub fn update_configuration(
    conn: &Connection,
    id: &str,
    input: &UpdateConfigurationInput,
) -> Result<SyncConfiguration> {
    let mut current = get_configuration(conn, id)?;

    if let Some(direction) = input.direction {
        current.direction = direction;
    }
    if let Some(frequency) = input.frequency {
        current.frequency = frequency;
    }
    if let Some(ref entities) = input.entities {
        current.entities = dedup_entities(entities);
    }
    if let Some(auto) = input.auto_resolve_conflicts {
        current.auto_resolve_conflicts = auto;
    }
    if let Some(active) = input.is_active {
        current.is_active = active;
    }

    if current.is_active && current.entities.is_empty() {
        return Err(SyncwrightError::InvalidInput(
            "an active configuration needs at least one entity type".to_string(),
        ));
    }

    conn.execute(
        "UPDATE sync_configurations
         SET direction = ?, frequency = ?, entities = ?, auto_resolve_conflicts = ?,
             is_active = ?, updated_at = ?
         WHERE id = ?",
        params![
            current.direction.as_str(),
            current.frequency.as_str(),
            serde_json::to_string(&current.entities)?,
            current.auto_resolve_conflicts as i32,
            current.is_active as i32,
            fmt_ts(&Utc::now()),
            id
        ],
    )?;

    get_configuration(conn, id)
}

/// Set or clear (`rule = None`) the conflict rule of one field
pub fn set_conflict_rule(
    conn: &Connection,
    id: &str,
    field: &str,
    rule: Option<ConflictRule>,
) -> Result<SyncConfiguration> {
    let mut current = get_configuration(conn, id)?;
    match rule {
        Some(rule) => {
            current.conflict_rules.insert(field.to_string(), rule);
        }
        None => {
            current.conflict_rules.remove(field);
        }
    }
    conn.execute(
        "UPDATE sync_configurations SET conflict_rules = ?, updated_at = ? WHERE id = ?",
        params![
            serde_json::to_string(&current.conflict_rules)?,
            fmt_ts(&Utc::now()),
            id
        ],
    )?;
    get_configuration(conn, id)
}

pub fn deactivate_configuration(conn: &Connection, id: &str) -> Result<SyncConfiguration> {
    update_configuration(
        conn,
        id,
        &UpdateConfigurationInput {
            is_active: Some(false),
            ..Default::default()
        },
    )
}

/// Delete a configuration
///
/// Queued jobs are cancelled first; deletion is refused while a job is
/// running. Job history stays.
pub fn delete_configuration(conn: &Connection, id: &str) -> Result<()> {
    get_configuration(conn, id)?;

    let running: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sync_jobs WHERE configuration_id = ? AND status = 'running'",
        params![id],
        |row| row.get(0),
    )?;
    if running > 0 {
        return Err(SyncwrightError::Conflict(format!(
            "configuration {} has a running job",
            id
        )));
    }

    let now = fmt_ts(&Utc::now());
    let cancelled = conn.execute(
        "UPDATE sync_jobs SET status = 'cancelled', completed_at = ?,
                error_message = 'configuration deleted'
         WHERE configuration_id = ? AND status = 'queued'",
        params![now, id],
    )?;
    // Their queue entries would otherwise fail to start later
    conn.execute(
        "UPDATE queue_jobs SET status = 'failed', completed_at = ?,
                error_message = 'configuration deleted'
         WHERE concurrency_key = ? AND status IN ('pending', 'retry')",
        params![now, id],
    )?;
    conn.execute("DELETE FROM sync_configurations WHERE id = ?", params![id])?;

    log_audit(
        conn,
        &AuditRecord::new(AuditAction::ConfigurationDeleted)
            .configuration(id)
            .details(serde_json::json!({ "cancelled_jobs": cancelled })),
    )?;

    tracing::info!(config_id = %id, cancelled_jobs = cancelled, "Sync configuration deleted");
    Ok(())
}

/// Move `last_sync_at` forward to `at`; never moves it backwards
pub fn advance_last_sync_at(conn: &Connection, id: &str, at: DateTime<Utc>) -> Result<bool> {
    let ts = fmt_ts(&at);
    let changed = conn.execute(
        "UPDATE sync_configurations SET last_sync_at = ?
         WHERE id = ? AND (last_sync_at IS NULL OR last_sync_at < ?)",
        params![ts, id, ts],
    )?;
    Ok(changed > 0)
}
