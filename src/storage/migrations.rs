//! Database migrations for Syncwright

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 3;

/// Run all migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version = schema_version(conn)?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    if current_version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Highest applied migration, 0 on a fresh database
pub fn schema_version(conn: &Connection) -> Result<i32> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?)
}

/// Initial schema (v1): configurations, jobs, queue, entity store
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sync_configurations (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            adapter_id TEXT NOT NULL,
            direction TEXT NOT NULL,
            frequency TEXT NOT NULL,
            entities TEXT NOT NULL DEFAULT '[]',
            auto_resolve_conflicts INTEGER NOT NULL DEFAULT 1,
            conflict_rules TEXT NOT NULL DEFAULT '{}',
            is_active INTEGER NOT NULL DEFAULT 1,
            last_sync_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sync_configurations_active
            ON sync_configurations(is_active, frequency);

        CREATE TABLE IF NOT EXISTS sync_jobs (
            id TEXT PRIMARY KEY,
            configuration_id TEXT NOT NULL,
            adapter_id TEXT NOT NULL,
            job_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            priority TEXT NOT NULL DEFAULT 'normal',
            scheduled_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            progress_percentage INTEGER NOT NULL DEFAULT 0,
            total_items INTEGER NOT NULL DEFAULT 0,
            processed_items INTEGER NOT NULL DEFAULT 0,
            success_count INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            conflict_count INTEGER NOT NULL DEFAULT 0,
            cancel_requested INTEGER NOT NULL DEFAULT 0,
            error_message TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_sync_jobs_config_status
            ON sync_jobs(configuration_id, status);

        CREATE TABLE IF NOT EXISTS sync_job_errors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            message TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            FOREIGN KEY (job_id) REFERENCES sync_jobs(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_sync_job_errors_job ON sync_job_errors(job_id);

        CREATE TABLE IF NOT EXISTS sync_conflicts (
            id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL,
            configuration_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            field TEXT,
            conflict_type TEXT NOT NULL,
            source_data TEXT NOT NULL,
            destination_data TEXT NOT NULL,
            resolution_required INTEGER NOT NULL,
            auto_resolved INTEGER NOT NULL DEFAULT 0,
            resolution_action TEXT,
            resolved_at TEXT,
            resolved_by TEXT,
            detected_at TEXT NOT NULL,
            FOREIGN KEY (job_id) REFERENCES sync_jobs(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_sync_conflicts_job ON sync_conflicts(job_id);
        CREATE INDEX IF NOT EXISTS idx_sync_conflicts_open
            ON sync_conflicts(configuration_id, resolution_required);

        CREATE TABLE IF NOT EXISTS queue_jobs (
            id TEXT PRIMARY KEY,
            job_type TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'pending',
            priority INTEGER NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            scheduled_for TEXT NOT NULL,
            error_message TEXT,
            concurrency_key TEXT,
            worker_id TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_queue_jobs_poll
            ON queue_jobs(status, scheduled_for, priority DESC, created_at);
        CREATE INDEX IF NOT EXISTS idx_queue_jobs_key
            ON queue_jobs(concurrency_key, status);

        CREATE TABLE IF NOT EXISTS entities (
            entity_type TEXT NOT NULL,
            id TEXT NOT NULL,
            primary_key TEXT,
            alternate_key TEXT,
            data TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            updated_at TEXT,
            synced_at TEXT NOT NULL,
            PRIMARY KEY (entity_type, id)
        );

        CREATE INDEX IF NOT EXISTS idx_entities_primary_key ON entities(entity_type, primary_key);
        CREATE INDEX IF NOT EXISTS idx_entities_alternate_key ON entities(entity_type, alternate_key);
        CREATE INDEX IF NOT EXISTS idx_entities_synced_at ON entities(entity_type, synced_at);

        INSERT INTO schema_version (version) VALUES (1);
        "#,
    )?;

    Ok(())
}

/// Audit log and remote id links (v2)
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Append-only: rows are never updated or deleted by the application
        CREATE TABLE IF NOT EXISTS sync_audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            configuration_id TEXT,
            job_id TEXT,
            action TEXT NOT NULL,
            entity_type TEXT,
            entity_id TEXT,
            details TEXT NOT NULL DEFAULT '{}'
        );

        CREATE INDEX IF NOT EXISTS idx_audit_job ON sync_audit_log(job_id);
        CREATE INDEX IF NOT EXISTS idx_audit_config ON sync_audit_log(configuration_id);

        CREATE TABLE IF NOT EXISTS entity_links (
            adapter_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            local_id TEXT NOT NULL,
            remote_id TEXT NOT NULL,
            linked_at TEXT NOT NULL,
            PRIMARY KEY (adapter_id, entity_type, local_id)
        );

        CREATE INDEX IF NOT EXISTS idx_entity_links_remote
            ON entity_links(adapter_id, entity_type, remote_id);

        INSERT INTO schema_version (version) VALUES (2);
        "#,
    )?;

    Ok(())
}

/// Remote ids of discarded duplicates (v3)
fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS entity_aliases (
            adapter_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            remote_id TEXT NOT NULL,
            local_id TEXT NOT NULL,
            linked_at TEXT NOT NULL,
            PRIMARY KEY (adapter_id, entity_type, remote_id)
        );

        CREATE INDEX IF NOT EXISTS idx_entity_aliases_local
            ON entity_aliases(adapter_id, entity_type, local_id);

        INSERT INTO schema_version (version) VALUES (3);
        "#,
    )?;

    Ok(())
}
