use rusqlite::{Connection, OptionalExtension};
use std::fs;
use std::path::Path;

use crate::error::NodeGateError;
use crate::schema::CREATE_SCHEMA_SQL;

const SCHEMA_VERSION: &str = "1";

/// Thin wrapper over a single SQLite connection. The protocol is
/// stateless, so every request opens its own connection; all durable
/// state lives in the shared database file.
pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(db_path: &Path) -> Result<Self, NodeGateError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        let db = Self { conn };
        db.ensure_schema()?;
        Ok(db)
    }

    /// In-memory database, mostly useful in tests and for ephemeral runs.
    pub fn open_in_memory() -> Result<Self, NodeGateError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.ensure_schema()?;
        Ok(db)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    fn ensure_schema(&self) -> Result<(), NodeGateError> {
        let table_exists: bool = self
            .conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='meta'",
                [],
                |row| row.get::<_, i32>(0),
            )
            .map(|count| count > 0)
            .unwrap_or(false);

        if !table_exists {
            self.conn.execute_batch(CREATE_SCHEMA_SQL)?;
            return Ok(());
        }

        let stored_version: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match stored_version.as_deref() {
            Some(SCHEMA_VERSION) => Ok(()), // Schema is up to date
            Some(other) => Err(NodeGateError::Error(format!(
                "Schema version mismatch: found '{other}', expected '{SCHEMA_VERSION}'"
            ))),
            None => Err(NodeGateError::Error("Schema version missing".to_string())),
        }
    }
}

/// Seconds since the epoch, the timestamp representation used across
/// all tables.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_created_on_open() {
        let db = Database::open_in_memory().unwrap();
        let n: i64 = db
            .conn()
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(n >= 10);
    }

    #[test]
    fn open_creates_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested/dir/nodegate.db");
        let _db = Database::open(&db_path).unwrap();
        assert!(db_path.exists());
    }
}
