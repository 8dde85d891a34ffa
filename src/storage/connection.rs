//! Database connection management with WAL mode support
//!
//! A single SQLite connection behind a mutex. Every durable record of the
//! sync subsystem (configurations, jobs, queue, entities, audit) lives in the
//! same database, so one handle is shared by the scheduler and all workers.

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use super::migrations::{run_migrations, schema_version};
use crate::error::Result;
use crate::types::{StorageConfig, StorageMode};

const IN_MEMORY: &str = ":memory:";

/// WAL keeps readers off the writer's back while workers run.
const LOCAL_PRAGMAS: &str = r#"
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=NORMAL;
    PRAGMA busy_timeout=30000;
    PRAGMA temp_store=MEMORY;
    PRAGMA foreign_keys=ON;
"#;

/// Rollback journal: no -wal/-shm side files for a file-sync client to
/// tear apart.
const CLOUD_SAFE_PRAGMAS: &str = r#"
    PRAGMA journal_mode=DELETE;
    PRAGMA synchronous=FULL;
    PRAGMA busy_timeout=30000;
    PRAGMA temp_store=MEMORY;
    PRAGMA foreign_keys=ON;
"#;

/// Snapshot of the database for `syncwright status`
#[derive(Debug, Clone, Serialize)]
pub struct StorageStatus {
    pub db_path: String,
    pub storage_mode: StorageMode,
    pub schema_version: i32,
    pub size_bytes: i64,
}

/// Storage engine wrapping SQLite
#[derive(Clone)]
pub struct Storage {
    config: StorageConfig,
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open or create a database and bring its schema up to date
    pub fn open(config: StorageConfig) -> Result<Self> {
        let conn = if config.db_path == IN_MEMORY {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(&config.db_path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open_with_flags(
                &config.db_path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        };

        conn.execute_batch(match config.storage_mode {
            StorageMode::Local => LOCAL_PRAGMAS,
            StorageMode::CloudSafe => CLOUD_SAFE_PRAGMAS,
        })?;
        run_migrations(&conn)?;

        tracing::debug!(db_path = %config.db_path, mode = ?config.storage_mode, "Storage opened");

        Ok(Self {
            config,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (tests, dry runs)
    pub fn open_in_memory() -> Result<Self> {
        Self::open(StorageConfig {
            db_path: IN_MEMORY.to_string(),
            storage_mode: StorageMode::Local,
        })
    }

    /// Execute a function with the connection
    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Execute a function inside a transaction; an `Err` rolls it back
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub fn db_path(&self) -> &str {
        &self.config.db_path
    }

    /// Fold the WAL back into the main file. No-op in cloud-safe mode and
    /// for in-memory databases.
    pub fn checkpoint(&self) -> Result<()> {
        if self.config.storage_mode == StorageMode::Local && self.config.db_path != IN_MEMORY {
            self.conn
                .lock()
                .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        }
        Ok(())
    }

    pub fn status(&self) -> Result<StorageStatus> {
        self.with_connection(|conn| {
            let size_bytes = conn.query_row(
                "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
                [],
                |row| row.get(0),
            )?;
            Ok(StorageStatus {
                db_path: self.config.db_path.clone(),
                storage_mode: self.config.storage_mode,
                schema_version: schema_version(conn)?,
                size_bytes,
            })
        })
    }
}
