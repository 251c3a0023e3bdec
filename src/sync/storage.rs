//! Durable storage for sync tasks.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::types::{SyncKind, SyncTask, TaskStatus};
use crate::db::{format_datetime, parse_datetime, Database};

/// Outcome of trying to take the next task for delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
  /// The oldest pending task, now marked in flight
  Claimed(SyncTask),
  /// The oldest pending task is still backing off
  NotDue(SyncTask),
  /// Another task is in flight; claiming now could reorder delivery
  Busy,
  /// Nothing pending
  Empty,
}

/// Trait for sync queue storage backends.
pub trait QueueStorage: Send + Sync {
  /// Persist a new task, assigning its enqueue sequence number.
  fn insert(&self, task: SyncTask) -> Result<SyncTask>;

  /// Atomically move the oldest due pending task to in flight.
  fn claim_next(&self, now: DateTime<Utc>) -> Result<Claim>;

  /// Persist attempts, status, backoff and error of an existing task.
  fn update(&self, task: &SyncTask) -> Result<()>;

  fn remove(&self, id: Uuid) -> Result<bool>;

  fn get(&self, id: Uuid) -> Result<Option<SyncTask>>;

  /// Tasks in enqueue order, optionally filtered by status.
  fn list(&self, status: Option<TaskStatus>) -> Result<Vec<SyncTask>>;

  /// Pending or in-flight tasks.
  fn active_count(&self) -> Result<usize>;

  /// Id of the newest queued task of `kind` when it is still pending and
  /// carries the same payload hash.
  fn find_pending_duplicate(&self, kind: SyncKind, payload_hash: &str) -> Result<Option<Uuid>>;

  /// Return tasks left in flight by an interrupted process to pending.
  fn recover_in_flight(&self) -> Result<usize>;
}

#[derive(Clone)]
pub struct SqliteQueueStore {
  db: Database,
}

impl SqliteQueueStore {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

const SELECT_COLUMNS: &str = "SELECT id, seq, kind, payload, enqueued_at, attempts, max_attempts,
  status, next_attempt_at, last_error FROM sync_queue";

struct TaskRow {
  id: String,
  seq: i64,
  kind: String,
  payload: String,
  enqueued_at: String,
  attempts: u32,
  max_attempts: u32,
  status: String,
  next_attempt_at: Option<String>,
  last_error: Option<String>,
}

impl TaskRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      seq: row.get(1)?,
      kind: row.get(2)?,
      payload: row.get(3)?,
      enqueued_at: row.get(4)?,
      attempts: row.get(5)?,
      max_attempts: row.get(6)?,
      status: row.get(7)?,
      next_attempt_at: row.get(8)?,
      last_error: row.get(9)?,
    })
  }

  fn into_task(self) -> Result<SyncTask> {
    Ok(SyncTask {
      id: Uuid::parse_str(&self.id).map_err(|e| eyre!("Invalid task id '{}': {}", self.id, e))?,
      seq: self.seq,
      kind: self.kind.parse().map_err(|e: String| eyre!(e))?,
      payload: serde_json::from_str(&self.payload)
        .map_err(|e| eyre!("Failed to parse payload of task {}: {}", self.id, e))?,
      enqueued_at: parse_datetime(&self.enqueued_at)?,
      attempts: self.attempts,
      max_attempts: self.max_attempts,
      status: self.status.parse().map_err(|e: String| eyre!(e))?,
      next_attempt_at: self.next_attempt_at.as_deref().map(parse_datetime).transpose()?,
      last_error: self.last_error,
    })
  }
}

fn query_tasks(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<SyncTask>> {
  let mut stmt = conn
    .prepare(sql)
    .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

  let rows: Vec<TaskRow> = stmt
    .query_map(params, TaskRow::from_row)
    .map_err(|e| eyre!("Failed to query sync tasks: {}", e))?
    .collect::<rusqlite::Result<_>>()
    .map_err(|e| eyre!("Failed to read sync tasks: {}", e))?;

  rows.into_iter().map(TaskRow::into_task).collect()
}

impl QueueStorage for SqliteQueueStore {
  fn insert(&self, mut task: SyncTask) -> Result<SyncTask> {
    let conn = self.db.lock()?;
    let payload = serde_json::to_string(&task.payload)
      .map_err(|e| eyre!("Failed to serialize task payload: {}", e))?;

    let seq: i64 = conn
      .query_row(
        "INSERT INTO sync_queue
           (id, seq, kind, payload, payload_hash, enqueued_at, attempts, max_attempts, status,
            next_attempt_at, last_error)
         VALUES (?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM sync_queue), ?, ?, ?, ?, ?, ?, ?, ?, ?)
         RETURNING seq",
        params![
          task.id.to_string(),
          task.kind.as_str(),
          payload,
          task.payload_hash(),
          format_datetime(&task.enqueued_at),
          task.attempts,
          task.max_attempts,
          task.status.as_str(),
          task.next_attempt_at.as_ref().map(format_datetime),
          task.last_error,
        ],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to persist sync task {}: {}", task.id, e))?;

    task.seq = seq;
    Ok(task)
  }

  fn claim_next(&self, now: DateTime<Utc>) -> Result<Claim> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let in_flight: i64 = tx
      .query_row(
        "SELECT COUNT(*) FROM sync_queue WHERE status = ?",
        params![TaskStatus::InFlight.as_str()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count in-flight tasks: {}", e))?;
    if in_flight > 0 {
      return Ok(Claim::Busy);
    }

    let sql = format!("{} WHERE status = ? ORDER BY seq LIMIT 1", SELECT_COLUMNS);
    let row = tx
      .query_row(&sql, params![TaskStatus::Pending.as_str()], TaskRow::from_row)
      .optional()
      .map_err(|e| eyre!("Failed to read next sync task: {}", e))?;

    let mut task = match row {
      Some(row) => row.into_task()?,
      None => return Ok(Claim::Empty),
    };

    if !task.is_due(now) {
      return Ok(Claim::NotDue(task));
    }

    let changed = tx
      .execute(
        "UPDATE sync_queue SET status = ? WHERE id = ? AND status = ?",
        params![
          TaskStatus::InFlight.as_str(),
          task.id.to_string(),
          TaskStatus::Pending.as_str()
        ],
      )
      .map_err(|e| eyre!("Failed to claim sync task {}: {}", task.id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit claim: {}", e))?;

    if changed == 0 {
      return Ok(Claim::Busy);
    }

    task.status = TaskStatus::InFlight;
    Ok(Claim::Claimed(task))
  }

  fn update(&self, task: &SyncTask) -> Result<()> {
    let conn = self.db.lock()?;
    let changed = conn
      .execute(
        "UPDATE sync_queue
         SET attempts = ?, max_attempts = ?, status = ?, next_attempt_at = ?, last_error = ?
         WHERE id = ?",
        params![
          task.attempts,
          task.max_attempts,
          task.status.as_str(),
          task.next_attempt_at.as_ref().map(format_datetime),
          task.last_error,
          task.id.to_string(),
        ],
      )
      .map_err(|e| eyre!("Failed to update sync task {}: {}", task.id, e))?;

    if changed == 0 {
      return Err(eyre!("Sync task {} no longer exists", task.id));
    }
    Ok(())
  }

  fn remove(&self, id: Uuid) -> Result<bool> {
    let conn = self.db.lock()?;
    let removed = conn
      .execute("DELETE FROM sync_queue WHERE id = ?", params![id.to_string()])
      .map_err(|e| eyre!("Failed to remove sync task {}: {}", id, e))?;
    Ok(removed > 0)
  }

  fn get(&self, id: Uuid) -> Result<Option<SyncTask>> {
    let conn = self.db.lock()?;
    let sql = format!("{} WHERE id = ?", SELECT_COLUMNS);
    let mut tasks = query_tasks(&conn, &sql, params![id.to_string()])?;
    Ok(tasks.pop())
  }

  fn list(&self, status: Option<TaskStatus>) -> Result<Vec<SyncTask>> {
    let conn = self.db.lock()?;
    match status {
      Some(status) => {
        let sql = format!("{} WHERE status = ? ORDER BY seq", SELECT_COLUMNS);
        query_tasks(&conn, &sql, params![status.as_str()])
      }
      None => {
        let sql = format!("{} ORDER BY seq", SELECT_COLUMNS);
        query_tasks(&conn, &sql, params![])
      }
    }
  }

  fn active_count(&self) -> Result<usize> {
    let conn = self.db.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM sync_queue WHERE status IN (?, ?)",
        params![TaskStatus::Pending.as_str(), TaskStatus::InFlight.as_str()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count sync tasks: {}", e))?;
    Ok(count as usize)
  }

  fn find_pending_duplicate(&self, kind: SyncKind, payload_hash: &str) -> Result<Option<Uuid>> {
    let conn = self.db.lock()?;
    let newest: Option<(String, String, String)> = conn
      .query_row(
        "SELECT id, payload_hash, status FROM sync_queue
         WHERE kind = ? AND status IN (?, ?)
         ORDER BY seq DESC LIMIT 1",
        params![
          kind.as_str(),
          TaskStatus::Pending.as_str(),
          TaskStatus::InFlight.as_str()
        ],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up duplicate task: {}", e))?;

    // Only the newest queued task may absorb a repeat; anything older would
    // be delivered ahead of a later, different update.
    match newest {
      Some((id, hash, status)) if hash == payload_hash && status == TaskStatus::Pending.as_str() => {
        let id = Uuid::parse_str(&id).map_err(|e| eyre!("Invalid task id '{}': {}", id, e))?;
        Ok(Some(id))
      }
      _ => Ok(None),
    }
  }

  fn recover_in_flight(&self) -> Result<usize> {
    let conn = self.db.lock()?;
    conn
      .execute(
        "UPDATE sync_queue SET status = ? WHERE status = ?",
        params![TaskStatus::Pending.as_str(), TaskStatus::InFlight.as_str()],
      )
      .map_err(|e| eyre!("Failed to recover in-flight tasks: {}", e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;
  use serde_json::json;

  fn store() -> SqliteQueueStore {
    SqliteQueueStore::new(Database::open_in_memory().unwrap())
  }

  fn task(n: i64) -> SyncTask {
    SyncTask::new(SyncKind::HealthUpdate, json!({ "n": n }), 5)
  }

  #[test]
  fn test_insert_assigns_increasing_seq() {
    let store = store();
    let a = store.insert(task(1)).unwrap();
    let b = store.insert(task(2)).unwrap();
    assert!(b.seq > a.seq);

    let listed = store.list(None).unwrap();
    assert_eq!(listed.iter().map(|t| t.id).collect::<Vec<_>>(), vec![a.id, b.id]);
    assert_eq!(listed[0].payload, json!({ "n": 1 }));
  }

  #[test]
  fn test_claim_is_exclusive_and_ordered() {
    let store = store();
    let first = store.insert(task(1)).unwrap();
    store.insert(task(2)).unwrap();

    let claimed = match store.claim_next(Utc::now()).unwrap() {
      Claim::Claimed(t) => t,
      other => panic!("expected claim, got {:?}", other),
    };
    assert_eq!(claimed.id, first.id);
    assert_eq!(claimed.status, TaskStatus::InFlight);

    // Second claimant must not skip ahead while the first is in flight
    assert_eq!(store.claim_next(Utc::now()).unwrap(), Claim::Busy);
  }

  #[test]
  fn test_claim_respects_backoff() {
    let store = store();
    let mut t = store.insert(task(1)).unwrap();
    t.next_attempt_at = Some(Utc::now() + Duration::minutes(1));
    store.update(&t).unwrap();

    assert!(matches!(store.claim_next(Utc::now()).unwrap(), Claim::NotDue(_)));
    assert!(matches!(
      store.claim_next(Utc::now() + Duration::minutes(2)).unwrap(),
      Claim::Claimed(_)
    ));
  }

  #[test]
  fn test_claim_empty() {
    assert_eq!(store().claim_next(Utc::now()).unwrap(), Claim::Empty);
  }

  #[test]
  fn test_recover_in_flight() {
    let store = store();
    let t = store.insert(task(1)).unwrap();
    assert!(matches!(store.claim_next(Utc::now()).unwrap(), Claim::Claimed(_)));

    assert_eq!(store.recover_in_flight().unwrap(), 1);
    assert_eq!(store.get(t.id).unwrap().unwrap().status, TaskStatus::Pending);
  }

  #[test]
  fn test_find_pending_duplicate() {
    let store = store();
    let t = store.insert(task(1)).unwrap();

    let found = store
      .find_pending_duplicate(SyncKind::HealthUpdate, &t.payload_hash())
      .unwrap();
    assert_eq!(found, Some(t.id));

    let other = task(2);
    assert_eq!(
      store
        .find_pending_duplicate(SyncKind::HealthUpdate, &other.payload_hash())
        .unwrap(),
      None
    );
  }

  #[test]
  fn test_duplicate_only_matches_newest_task() {
    let store = store();
    let first = store.insert(task(1)).unwrap();
    store.insert(task(2)).unwrap();

    assert_eq!(
      store
        .find_pending_duplicate(SyncKind::HealthUpdate, &first.payload_hash())
        .unwrap(),
      None
    );

    let third = store.insert(task(1)).unwrap();
    assert_eq!(
      store
        .find_pending_duplicate(SyncKind::HealthUpdate, &third.payload_hash())
        .unwrap(),
      Some(third.id)
    );
  }

  #[test]
  fn test_in_flight_task_is_not_a_duplicate() {
    let store = store();
    let t = store.insert(task(1)).unwrap();
    assert!(matches!(store.claim_next(Utc::now()).unwrap(), Claim::Claimed(_)));

    assert_eq!(
      store
        .find_pending_duplicate(SyncKind::HealthUpdate, &t.payload_hash())
        .unwrap(),
      None
    );
  }

  #[test]
  fn test_update_missing_task_is_error() {
    assert!(store().update(&task(1)).is_err());
  }
}
