//! Cache storage trait and SQLite implementation.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};

use super::types::{CacheEntry, CacheTier};
use crate::db::{format_datetime, parse_datetime, Database};

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Store an entry, atomically replacing any entry with the same
  /// (tier, version, key).
  fn put(&self, entry: &CacheEntry) -> Result<()>;

  /// Store several entries in one transaction: all of them or none.
  fn put_all(&self, entries: &[CacheEntry]) -> Result<()>;

  /// Look up an entry. `version` only applies to versioned tiers.
  fn get(&self, tier: CacheTier, version: &str, key: &str) -> Result<Option<CacheEntry>>;

  /// Remove a single entry.
  fn remove(&self, tier: CacheTier, version: &str, key: &str) -> Result<bool>;

  /// Delete versioned entries belonging to any version other than `keep`.
  fn purge_other_versions(&self, keep: &str) -> Result<usize>;

  /// List entries of a tier (all versions), oldest first.
  fn list(&self, tier: CacheTier) -> Result<Vec<CacheEntry>>;

  /// Number of entries in a tier (all versions).
  fn count(&self, tier: CacheTier) -> Result<usize>;
}

/// SQLite-based cache storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
  db: Database,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

/// Versioned tiers keep the version; everything else shares ''.
fn version_for(tier: CacheTier, version: &str) -> &str {
  if tier.is_versioned() {
    version
  } else {
    ""
  }
}

const INSERT_ENTRY: &str = "INSERT OR REPLACE INTO cache_entries
  (tier, version, cache_key, method, url, status, content_type, payload, stored_at, stale_after_secs)
  VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

const SELECT_COLUMNS: &str = "SELECT tier, version, cache_key, method, url, status, content_type,
  payload, stored_at, stale_after_secs FROM cache_entries";

fn insert_entry(conn: &rusqlite::Connection, entry: &CacheEntry) -> rusqlite::Result<usize> {
  conn.execute(
    INSERT_ENTRY,
    params![
      entry.tier.as_str(),
      version_for(entry.tier, &entry.version),
      entry.key,
      entry.method,
      entry.url,
      entry.status,
      entry.content_type,
      entry.payload,
      format_datetime(&entry.stored_at),
      entry.stale_after.num_seconds(),
    ],
  )
}

/// Raw row values; parsed outside the rusqlite closure so errors carry context.
struct EntryRow {
  tier: String,
  version: String,
  key: String,
  method: String,
  url: String,
  status: u16,
  content_type: Option<String>,
  payload: Vec<u8>,
  stored_at: String,
  stale_after_secs: i64,
}

impl EntryRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      tier: row.get(0)?,
      version: row.get(1)?,
      key: row.get(2)?,
      method: row.get(3)?,
      url: row.get(4)?,
      status: row.get(5)?,
      content_type: row.get(6)?,
      payload: row.get(7)?,
      stored_at: row.get(8)?,
      stale_after_secs: row.get(9)?,
    })
  }

  fn into_entry(self) -> Result<CacheEntry> {
    Ok(CacheEntry {
      tier: self.tier.parse().map_err(|e: String| eyre!(e))?,
      version: self.version,
      key: self.key,
      method: self.method,
      url: self.url,
      status: self.status,
      content_type: self.content_type,
      payload: self.payload,
      stored_at: parse_datetime(&self.stored_at)?,
      stale_after: Duration::seconds(self.stale_after_secs),
    })
  }
}

impl CacheStorage for SqliteStorage {
  fn put(&self, entry: &CacheEntry) -> Result<()> {
    let conn = self.db.lock()?;
    insert_entry(&conn, entry)
      .map_err(|e| eyre!("Failed to store cache entry {}: {}", entry.url, e))?;
    Ok(())
  }

  fn put_all(&self, entries: &[CacheEntry]) -> Result<()> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for entry in entries {
      insert_entry(&tx, entry)
        .map_err(|e| eyre!("Failed to store cache entry {}: {}", entry.url, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn get(&self, tier: CacheTier, version: &str, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self.db.lock()?;
    let sql = format!(
      "{} WHERE tier = ? AND version = ? AND cache_key = ?",
      SELECT_COLUMNS
    );

    let row = conn
      .query_row(
        &sql,
        params![tier.as_str(), version_for(tier, version), key],
        EntryRow::from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    row.map(EntryRow::into_entry).transpose()
  }

  fn remove(&self, tier: CacheTier, version: &str, key: &str) -> Result<bool> {
    let conn = self.db.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE tier = ? AND version = ? AND cache_key = ?",
        params![tier.as_str(), version_for(tier, version), key],
      )
      .map_err(|e| eyre!("Failed to remove cache entry: {}", e))?;
    Ok(removed > 0)
  }

  fn purge_other_versions(&self, keep: &str) -> Result<usize> {
    let conn = self.db.lock()?;
    let mut purged = 0;
    for tier in CacheTier::ALL.iter().filter(|t| t.is_versioned()) {
      purged += conn
        .execute(
          "DELETE FROM cache_entries WHERE tier = ? AND version != ?",
          params![tier.as_str(), keep],
        )
        .map_err(|e| eyre!("Failed to purge {} cache: {}", tier, e))?;
    }
    Ok(purged)
  }

  fn list(&self, tier: CacheTier) -> Result<Vec<CacheEntry>> {
    let conn = self.db.lock()?;
    let sql = format!("{} WHERE tier = ? ORDER BY stored_at, url", SELECT_COLUMNS);
    let mut stmt = conn
      .prepare(&sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<EntryRow> = stmt
      .query_map(params![tier.as_str()], EntryRow::from_row)
      .map_err(|e| eyre!("Failed to query cache entries: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read cache entries: {}", e))?;

    rows.into_iter().map(EntryRow::into_entry).collect()
  }

  fn count(&self, tier: CacheTier) -> Result<usize> {
    let conn = self.db.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE tier = ?",
        params![tier.as_str()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count cache entries: {}", e))?;
    Ok(count as usize)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::types::RequestIdentity;
  use url::Url;

  fn storage() -> SqliteStorage {
    SqliteStorage::new(Database::open_in_memory().unwrap())
  }

  fn entry(path: &str, tier: CacheTier, body: &str) -> CacheEntry {
    let url = Url::parse("https://care.test").unwrap().join(path).unwrap();
    let id = RequestIdentity::new("GET", &url, None);
    CacheEntry::new(
      &id,
      tier,
      200,
      Some("application/json".to_string()),
      body.as_bytes().to_vec(),
      Duration::minutes(5),
    )
  }

  #[test]
  fn test_put_overwrites_same_key() {
    let storage = storage();
    let first = entry("/api/vitals", CacheTier::ApiData, "one");
    let second = entry("/api/vitals", CacheTier::ApiData, "two");

    storage.put(&first).unwrap();
    storage.put(&second).unwrap();

    assert_eq!(storage.count(CacheTier::ApiData).unwrap(), 1);
    let got = storage
      .get(CacheTier::ApiData, "", &first.key)
      .unwrap()
      .unwrap();
    assert_eq!(got.payload, b"two");
    assert_eq!(got.stale_after, Duration::minutes(5));
  }

  #[test]
  fn test_tiers_are_separate() {
    let storage = storage();
    let api = entry("/api/emergency/contacts", CacheTier::ApiData, "api");
    let fallback = entry("/api/emergency/contacts", CacheTier::Fallback, "fallback");
    storage.put(&api).unwrap();
    storage.put(&fallback).unwrap();

    let got = storage
      .get(CacheTier::Fallback, "", &fallback.key)
      .unwrap()
      .unwrap();
    assert_eq!(got.payload, b"fallback");
    assert_eq!(storage.count(CacheTier::ApiData).unwrap(), 1);
  }

  #[test]
  fn test_version_ignored_for_unversioned_tiers() {
    let storage = storage();
    let api = entry("/api/vitals", CacheTier::ApiData, "x").with_version("v1");
    storage.put(&api).unwrap();

    assert!(storage
      .get(CacheTier::ApiData, "v2", &api.key)
      .unwrap()
      .is_some());
  }

  #[test]
  fn test_purge_other_versions_only_touches_static() {
    let storage = storage();
    let old = entry("/app.js", CacheTier::Static, "old").with_version("v1");
    let new = entry("/app.js", CacheTier::Static, "new").with_version("v2");
    let api = entry("/api/vitals", CacheTier::ApiData, "data");
    storage.put_all(&[old.clone(), new.clone(), api.clone()]).unwrap();
    assert_eq!(storage.count(CacheTier::Static).unwrap(), 2);

    let purged = storage.purge_other_versions("v2").unwrap();

    assert_eq!(purged, 1);
    assert!(storage.get(CacheTier::Static, "v1", &old.key).unwrap().is_none());
    assert!(storage.get(CacheTier::Static, "v2", &new.key).unwrap().is_some());
    assert!(storage.get(CacheTier::ApiData, "", &api.key).unwrap().is_some());
  }

  #[test]
  fn test_remove() {
    let storage = storage();
    let e = entry("/api/vitals", CacheTier::ApiData, "x");
    storage.put(&e).unwrap();

    assert!(storage.remove(CacheTier::ApiData, "", &e.key).unwrap());
    assert!(!storage.remove(CacheTier::ApiData, "", &e.key).unwrap());
    assert!(storage.list(CacheTier::ApiData).unwrap().is_empty());
  }
}
