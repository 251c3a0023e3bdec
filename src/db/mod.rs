pub mod schema;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared SQLite handle for the cache store and the sync queue.
///
/// Cloning is cheap; all clones use the same connection. The lock is only
/// held for synchronous statements, never across an await point.
#[derive(Clone)]
pub struct Database {
  conn: Arc<Mutex<Connection>>,
}

impl Database {
  /// Open or create the database at `path`
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a throwaway in-memory database
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;

    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let db = Self {
      conn: Arc::new(Mutex::new(conn)),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  /// Lock the connection
  pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
    self
      .lock()?
      .query_row("SELECT value FROM meta WHERE key = ?", params![key], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to read meta {}: {}", key, e))
  }

  pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
    self
      .lock()?
      .execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write meta {}: {}", key, e))?;
    Ok(())
  }
}

/// Format a timestamp for storage.
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
  dt.to_rfc3339()
}

/// Parse a timestamp written by `format_datetime`.
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_meta_roundtrip() {
    let db = Database::open_in_memory().unwrap();
    assert_eq!(db.get_meta("active_version").unwrap(), None);

    db.set_meta("active_version", "v1").unwrap();
    db.set_meta("active_version", "v2").unwrap();
    assert_eq!(db.get_meta("active_version").unwrap().as_deref(), Some("v2"));
  }

  #[test]
  fn test_reopen_file_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("careline.db");

    let db = Database::open(&path).unwrap();
    db.set_meta("k", "v").unwrap();
    drop(db);

    let db = Database::open(&path).unwrap();
    assert_eq!(db.get_meta("k").unwrap().as_deref(), Some("v"));
  }
}
