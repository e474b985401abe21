pub mod agents;
pub mod cursors;
pub mod events;
pub mod locks;
pub mod messages;
pub mod paths;
pub mod projections;
pub mod reservations;
pub mod schema;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::migrate;

// ---------------------------------------------------------------------------
// Helpers: millisecond timestamps stored in INTEGER columns
// ---------------------------------------------------------------------------

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// CoordinationDb
// ---------------------------------------------------------------------------

/// Handle to one coordination database file.
///
/// The handle is passed explicitly into every operation; whoever composes the
/// system owns its lifetime (`open` / `close`).
pub struct CoordinationDb {
    conn: Connection,
    path: Option<PathBuf>,
    config: StoreConfig,
}

impl CoordinationDb {
    /// Open (or create) the coordination database at the given file path.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, &StoreConfig::default())
    }

    pub fn open_with(path: &Path, config: &StoreConfig) -> Result<Self> {
        let conn = Self::open_raw(path, config)?;
        let db = Self {
            conn,
            path: Some(path.to_path_buf()),
            config: config.clone(),
        };
        db.ensure_schema()?;
        tracing::debug!(path = %path.display(), "opened coordination db");
        Ok(db)
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn,
            path: None,
            config: StoreConfig::default(),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    /// Open (or create) the file with WAL and busy timeout configured, but
    /// without creating or migrating any table.
    pub fn open_raw(path: &Path, config: &StoreConfig) -> Result<Connection> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(config.busy_timeout())?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Ok(conn)
    }

    /// Open `<principal-root>/.opencode/<db_name>` for any path in the repo.
    pub fn from_project(project_path: &Path) -> Result<Self> {
        let config = StoreConfig::load(project_path)?;
        Self::open_with(&config.db_path(project_path)?, &config)
    }

    /// Open an existing file without creating it or touching its schema.
    pub(crate) fn open_existing(path: &Path) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(conn)
    }

    /// Create missing tables and apply additive fixes. Fails with
    /// `DataLossRefusal` rather than rebuild a table that holds rows.
    fn ensure_schema(&self) -> Result<()> {
        let report = migrate::migrate_database(&self.conn, schema::TABLES)?;
        if !report.columns_added.is_empty() || !report.tables_recreated.is_empty() {
            tracing::info!(
                columns_added = report.columns_added.len(),
                tables_recreated = report.tables_recreated.len(),
                "migrated coordination schema"
            );
        }
        Ok(())
    }

    /// Expose the raw connection (for tests or advanced usage).
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Settings this handle was opened with; supplies default TTLs.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// File backing this handle; `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Close the underlying connection, surfacing any error SQLite reports.
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| StoreError::from(e))
    }

    /// Start a write transaction that takes the database write lock up front,
    /// so a check followed by a write cannot interleave with another process.
    pub(crate) fn immediate(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_tables_exist() {
        let db = CoordinationDb::open_memory().unwrap();
        let tables: Vec<String> = db
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for expected in [
            "agents",
            "cursors",
            "events",
            "locks",
            "message_recipients",
            "messages",
            "reservations",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn open_creates_parent_dir_and_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".opencode").join("swarm.db");

        let db = CoordinationDb::open(&path).unwrap();
        let mode: String = db
            .conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        assert_eq!(db.path(), Some(path.as_path()));
        db.close().unwrap();

        assert!(path.exists());
    }

    #[test]
    fn open_upgrades_legacy_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE agents (id INTEGER PRIMARY KEY, project_key TEXT NOT NULL,
                                      name TEXT NOT NULL, registered_at INTEGER NOT NULL,
                                      last_active_at INTEGER NOT NULL);
                 INSERT INTO agents (project_key, name, registered_at, last_active_at)
                 VALUES ('proj', 'old', 1, 1);",
            )
            .unwrap();
        }

        let db = CoordinationDb::open(&path).unwrap();
        let agent = db.get_agent("proj", "old").unwrap();
        assert_eq!(agent.program, "opencode");
        assert_eq!(agent.model, "unknown");

        // The upsert key exists on the upgraded table.
        db.register_agent("proj", "old", "claude", "m", None)
            .unwrap();
        assert_eq!(db.list_agents("proj").unwrap().len(), 1);
    }

    #[test]
    fn open_refuses_mistyped_table_with_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE reservations (id INTEGER PRIMARY KEY, project_key TEXT);
                 INSERT INTO reservations (project_key) VALUES ('proj');",
            )
            .unwrap();
        }

        let err = CoordinationDb::open(&path).err().unwrap();
        assert_eq!(err.code(), "data_loss_refusal");
    }

    #[test]
    fn from_project_resolves_canonical_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::create_dir_all(dir.path().join("packages/app")).unwrap();

        let db = CoordinationDb::from_project(&dir.path().join("packages/app")).unwrap();
        drop(db);

        assert!(dir.path().join(".opencode/swarm.db").exists());
    }
}
