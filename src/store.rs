//! SQLite store for virtual-server records
//!
//! Records are owned by the store; ids are assigned on first insert and never
//! change afterwards. Everything else in the crate talks to the store through
//! the [`ServerStore`] trait.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// A persisted virtual-server definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    /// Store-assigned id; `None` until the record has been saved
    #[serde(default, alias = "$loki", skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub display_name: String,
    #[serde(default)]
    pub enable: bool,
    /// Opaque proxy configuration fragment, rendered verbatim
    #[serde(default)]
    pub conf: String,
}

impl ServerRecord {
    /// Create an unsaved record
    pub fn new(display_name: impl Into<String>, enable: bool, conf: impl Into<String>) -> Self {
        Self {
            id: None,
            display_name: display_name.into(),
            enable,
            conf: conf.into(),
        }
    }
}

/// Document-store operations the control layer depends on
pub trait ServerStore: Send + Sync {
    /// All records in insertion order
    fn list(&self) -> Result<Vec<ServerRecord>>;

    fn get(&self, id: i64) -> Result<Option<ServerRecord>>;

    /// Insert a record without id, or insert/overwrite the record with the given id.
    /// Returns the record as stored, id included.
    fn upsert(&self, record: &ServerRecord) -> Result<ServerRecord>;

    /// Remove a record. Returns false if no record had this id.
    fn remove(&self, id: i64) -> Result<bool>;
}

/// Database connection wrapper with thread-safe access
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;

        info!("Server store opened at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: Initial schema
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS servers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                display_name TEXT NOT NULL,
                enable INTEGER NOT NULL DEFAULT 0,
                conf TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ServerRecord> {
        Ok(ServerRecord {
            id: Some(row.get(0)?),
            display_name: row.get(1)?,
            enable: row.get(2)?,
            conf: row.get(3)?,
        })
    }
}

impl ServerStore for SqliteStore {
    fn list(&self) -> Result<Vec<ServerRecord>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, display_name, enable, conf FROM servers ORDER BY id ASC")?;

        let records = stmt
            .query_map([], Self::row_to_record)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list servers")?;

        Ok(records)
    }

    fn get(&self, id: i64) -> Result<Option<ServerRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, display_name, enable, conf FROM servers WHERE id = ?1",
            params![id],
            Self::row_to_record,
        )
        .optional()
        .context("Failed to get server")
    }

    fn upsert(&self, record: &ServerRecord) -> Result<ServerRecord> {
        let conn = self.conn.lock();

        let id = match record.id {
            Some(id) => {
                conn.execute(
                    "INSERT INTO servers (id, display_name, enable, conf) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET
                        display_name = excluded.display_name,
                        enable = excluded.enable,
                        conf = excluded.conf,
                        updated_at = datetime('now')",
                    params![id, record.display_name, record.enable, record.conf],
                )
                .context("Failed to save server")?;
                id
            }
            None => {
                conn.execute(
                    "INSERT INTO servers (display_name, enable, conf) VALUES (?1, ?2, ?3)",
                    params![record.display_name, record.enable, record.conf],
                )
                .context("Failed to create server")?;
                conn.last_insert_rowid()
            }
        };

        debug!(id, display_name = %record.display_name, "Server record saved");

        Ok(ServerRecord {
            id: Some(id),
            ..record.clone()
        })
    }

    fn remove(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM servers WHERE id = ?1", params![id])
            .context("Failed to delete server")?;
        Ok(rows > 0)
    }
}
