//! `SQLite` schema, migrations and the shared connection handle.
//!
//! Every component (job store, ledger, health registry) shares one database
//! file but only touches its own tables. The connection sits behind a mutex;
//! callers hold it for a single short statement or transaction and never
//! across an `.await`.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;

use crate::error::{DeepqError, Result};

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: include_str!("../../migrations/001_jobs.sql"),
    },
    Migration {
        version: 2,
        sql: include_str!("../../migrations/002_job_provider.sql"),
    },
    Migration {
        version: 3,
        sql: include_str!("../../migrations/003_dispatch_state.sql"),
    },
    Migration {
        version: 4,
        sql: include_str!("../../migrations/004_budget.sql"),
    },
    Migration {
        version: 5,
        sql: include_str!("../../migrations/005_provider_health.sql"),
    },
];

/// Latest schema version known to this build.
pub const LATEST_VERSION: i32 = 5;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle to the engine database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open (creating if needed) the database at `path` and migrate it.
    ///
    /// # Errors
    /// Returns an error if the parent directory cannot be created, the file
    /// cannot be opened, or a migration fails.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| DeepqError::storage(&format!("open {}", path.display()), e))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| DeepqError::storage("set busy timeout", e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| DeepqError::storage("enable WAL", e))?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    /// Returns an error if migrations fail.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| DeepqError::storage("open in-memory", e))?;
        Self::from_connection(conn)
    }

    /// Migrate and wrap an already-open connection.
    ///
    /// # Errors
    /// Returns an error if configuring the connection or migrating fails.
    pub fn from_connection(mut conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| DeepqError::storage("set busy timeout", e))?;
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock the connection for one statement or transaction.
    ///
    /// # Errors
    /// Returns `Storage` if a previous holder panicked.
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| DeepqError::Storage("database mutex poisoned".to_string()))
    }

    /// Current schema version.
    ///
    /// # Errors
    /// Returns an error if the version cannot be read.
    pub fn schema_version(&self) -> Result<i32> {
        let conn = self.lock()?;
        get_schema_version(&conn)
    }
}

/// Apply every migration newer than the stored schema version.
///
/// Returns the latest schema version applied.
///
/// # Errors
/// Returns an error if creating the migrations table, reading the schema version,
/// or applying any migration fails.
pub fn run_migrations(conn: &mut Connection) -> Result<i32> {
    run_migrations_to(conn, LATEST_VERSION)
}

/// Apply migrations up to and including `target`.
///
/// # Errors
/// See [`run_migrations`].
pub fn run_migrations_to(conn: &mut Connection, target: i32) -> Result<i32> {
    ensure_schema_migrations_table(conn)?;

    let mut current_version = get_schema_version(conn)?;

    for migration in MIGRATIONS {
        if migration.version > current_version && migration.version <= target {
            apply_migration(conn, migration)?;
            current_version = migration.version;
            tracing::debug!(version = migration.version, "Applied migration");
        }
    }

    Ok(current_version)
}

#[derive(Debug, Clone, Copy)]
struct Migration {
    version: i32,
    sql: &'static str,
}

fn ensure_schema_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
            version INTEGER PRIMARY KEY,\
            applied_at TEXT DEFAULT (datetime('now'))\
        );",
    )
    .map_err(|e| DeepqError::storage("create schema_migrations", e))?;

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<i32> {
    let version: Option<i32> = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get(0)
        })
        .map_err(|e| DeepqError::storage("read schema version", e))?;

    Ok(version.unwrap_or(0))
}

fn apply_migration(conn: &mut Connection, migration: &Migration) -> Result<()> {
    let tx = conn
        .transaction()
        .map_err(|e| DeepqError::storage("begin migration", e))?;

    tx.execute_batch(migration.sql)
        .map_err(|e| DeepqError::storage(&format!("apply migration {}", migration.version), e))?;

    tx.execute(
        "INSERT INTO schema_migrations (version) VALUES (?1)",
        [migration.version],
    )
    .map_err(|e| DeepqError::storage(&format!("record migration {}", migration.version), e))?;

    tx.commit()
        .map_err(|e| DeepqError::storage(&format!("commit migration {}", migration.version), e))?;

    Ok(())
}
