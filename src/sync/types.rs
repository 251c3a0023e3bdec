use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// What a queued mutation does on the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncKind {
  EmergencyTrigger,
  HealthUpdate,
  /// Acknowledgement of an alert, issued from a notification
  Acknowledge,
}

impl SyncKind {
  /// Path segment of the delivery endpoint, `/sync/{kind}`
  pub fn as_str(&self) -> &'static str {
    match self {
      SyncKind::EmergencyTrigger => "emergency-trigger",
      SyncKind::HealthUpdate => "health-update",
      SyncKind::Acknowledge => "acknowledge",
    }
  }
}

impl fmt::Display for SyncKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for SyncKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "emergency-trigger" => Ok(SyncKind::EmergencyTrigger),
      "health-update" => Ok(SyncKind::HealthUpdate),
      "acknowledge" => Ok(SyncKind::Acknowledge),
      other => Err(format!("unknown sync kind: {}", other)),
    }
  }
}

/// Lifecycle of a task: Pending -> InFlight -> Delivered | Pending | Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
  Pending,
  InFlight,
  Delivered,
  Failed,
}

impl TaskStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      TaskStatus::Pending => "pending",
      TaskStatus::InFlight => "in_flight",
      TaskStatus::Delivered => "delivered",
      TaskStatus::Failed => "failed",
    }
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for TaskStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pending" => Ok(TaskStatus::Pending),
      "in_flight" => Ok(TaskStatus::InFlight),
      "delivered" => Ok(TaskStatus::Delivered),
      "failed" => Ok(TaskStatus::Failed),
      other => Err(format!("unknown task status: {}", other)),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncTask {
  pub id: Uuid,
  /// Enqueue order; assigned by storage
  pub seq: i64,
  pub kind: SyncKind,
  pub payload: Value,
  pub enqueued_at: DateTime<Utc>,
  pub attempts: u32,
  /// Attempt ceiling; raised by a manual retry
  pub max_attempts: u32,
  pub status: TaskStatus,
  pub next_attempt_at: Option<DateTime<Utc>>,
  pub last_error: Option<String>,
}

impl SyncTask {
  pub fn new(kind: SyncKind, payload: Value, max_attempts: u32) -> Self {
    Self {
      id: Uuid::new_v4(),
      seq: 0,
      kind,
      payload,
      enqueued_at: Utc::now(),
      attempts: 0,
      max_attempts,
      status: TaskStatus::Pending,
      next_attempt_at: None,
      last_error: None,
    }
  }

  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.next_attempt_at.map_or(true, |at| at <= now)
  }

  /// Hash of the canonical payload, used to spot duplicate updates.
  pub fn payload_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.kind.as_str().as_bytes());
    hasher.update(self.payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Body posted to `/sync/{kind}`
  pub fn delivery_body(&self) -> Value {
    json!({
      "id": self.id,
      "kind": self.kind,
      "payload": self.payload,
      "enqueuedAt": self.enqueued_at,
      "attempts": self.attempts,
    })
  }
}

/// Signals raised while draining, forwarded to the foreground layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
  Delivered { id: Uuid, kind: SyncKind },
  Retrying {
    id: Uuid,
    attempts: u32,
    next_attempt_at: DateTime<Utc>,
  },
  /// Attempts exhausted; the task waits for a manual retry or dismissal
  Failed(SyncTask),
}
