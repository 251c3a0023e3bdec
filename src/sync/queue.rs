use chrono::{Duration as ChronoDuration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use super::storage::{Claim, QueueStorage};
use super::types::{SyncEvent, SyncKind, SyncTask, TaskStatus};
use crate::config::SyncConfig;
use crate::error::{NetworkError, QueueError};
use crate::net::{send_with_timeout, Request, Transport};

/// Buffered signals per subscriber before the oldest are dropped.
const EVENT_CAPACITY: usize = 64;

/// Result of one `drain` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub delivered: Vec<Uuid>,
  /// Failed this pass and rescheduled with backoff
  pub retried: Vec<Uuid>,
  /// Exhausted their attempts this pass
  pub failed: Vec<Uuid>,
  /// Head task still backing off
  pub deferred: Option<Uuid>,
  /// Another drain was already running
  pub skipped: bool,
}

/// Durable FIFO of offline mutations with at-least-once delivery.
pub struct SyncQueue {
  store: Arc<dyn QueueStorage>,
  transport: Arc<dyn Transport>,
  base_url: Url,
  config: SyncConfig,
  timeout: Duration,
  drain_lock: Mutex<()>,
  /// A claimed task could not be handed back; recover before the next pass
  stranded: AtomicBool,
  events: broadcast::Sender<SyncEvent>,
}

impl SyncQueue {
  /// Create the queue, returning tasks orphaned in flight to pending.
  pub fn new(
    store: Arc<dyn QueueStorage>,
    transport: Arc<dyn Transport>,
    base_url: Url,
    config: SyncConfig,
    timeout: Duration,
  ) -> Result<Self> {
    let recovered = store.recover_in_flight()?;
    if recovered > 0 {
      warn!(recovered, "Recovered sync tasks interrupted mid-delivery");
    }

    let (events, _) = broadcast::channel(EVENT_CAPACITY);

    Ok(Self {
      store,
      transport,
      base_url,
      config,
      timeout,
      drain_lock: Mutex::new(()),
      stranded: AtomicBool::new(false),
      events,
    })
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.events.subscribe()
  }

  /// Persist a mutation for later delivery and return its id.
  ///
  /// Identical pending health updates collapse into the existing task.
  /// Emergency triggers are admitted even when the queue is at capacity.
  pub fn enqueue(&self, kind: SyncKind, payload: Value) -> Result<Uuid> {
    let task = SyncTask::new(kind, payload, self.config.max_attempts);

    if kind == SyncKind::HealthUpdate && self.config.dedup_health_updates {
      if let Some(existing) = self
        .store
        .find_pending_duplicate(kind, &task.payload_hash())?
      {
        debug!(%existing, "Health update already queued");
        return Ok(existing);
      }
    }

    if kind != SyncKind::EmergencyTrigger
      && self.store.active_count()? >= self.config.max_pending
    {
      warn!(%kind, limit = self.config.max_pending, "Sync queue full, rejecting task");
      return Err(eyre!(QueueError::QueueFull {
        limit: self.config.max_pending
      }));
    }

    let task = self.store.insert(task)?;
    info!(id = %task.id, %kind, seq = task.seq, "Queued sync task");
    Ok(task.id)
  }

  /// Deliver due pending tasks in enqueue order.
  ///
  /// Safe to call concurrently: an overlapping call returns a skipped
  /// report, and each task is claimed atomically before it is sent. A task
  /// that fails and will be retried stops the pass so later tasks are never
  /// delivered ahead of it.
  pub async fn drain(&self) -> Result<DrainReport> {
    let Ok(_guard) = self.drain_lock.try_lock() else {
      debug!("Drain already running");
      return Ok(DrainReport {
        skipped: true,
        ..DrainReport::default()
      });
    };

    if self.stranded.swap(false, Ordering::SeqCst) {
      match self.store.recover_in_flight() {
        Ok(recovered) => warn!(recovered, "Recovered sync tasks stranded by a storage failure"),
        Err(e) => {
          self.stranded.store(true, Ordering::SeqCst);
          return Err(e);
        }
      }
    }

    let mut report = DrainReport::default();

    loop {
      let task = match self.store.claim_next(Utc::now())? {
        Claim::Claimed(task) => task,
        Claim::NotDue(task) => {
          debug!(id = %task.id, next_attempt_at = ?task.next_attempt_at, "Head task backing off");
          report.deferred = Some(task.id);
          break;
        }
        Claim::Busy => {
          report.skipped = true;
          break;
        }
        Claim::Empty => break,
      };

      match self.deliver(&task).await {
        Ok(()) => {
          if let Err(e) = self.store.remove(task.id) {
            self.release(&task);
            return Err(e);
          }
          info!(id = %task.id, kind = %task.kind, "Delivered sync task");
          report.delivered.push(task.id);
          let _ = self.events.send(SyncEvent::Delivered {
            id: task.id,
            kind: task.kind,
          });
        }
        Err(err) => {
          let task = match self.record_failure(task.clone(), &err) {
            Ok(task) => task,
            Err(e) => {
              self.release(&task);
              return Err(e);
            }
          };
          if task.status == TaskStatus::Failed {
            report.failed.push(task.id);
            let _ = self.events.send(SyncEvent::Failed(task));
            continue;
          }

          report.retried.push(task.id);
          if let Some(next_attempt_at) = task.next_attempt_at {
            let _ = self.events.send(SyncEvent::Retrying {
              id: task.id,
              attempts: task.attempts,
              next_attempt_at,
            });
          }
          break;
        }
      }
    }

    Ok(report)
  }

  async fn deliver(&self, task: &SyncTask) -> Result<(), NetworkError> {
    let url = self
      .base_url
      .join(&format!("/sync/{}", task.kind.as_str()))
      .map_err(|e| NetworkError::Request(e.to_string()))?;
    let request = Request::post_json(url.as_str(), &task.delivery_body());

    let response = send_with_timeout(self.transport.as_ref(), &url, &request, self.timeout).await?;
    if response.status == 200 {
      Ok(())
    } else {
      Err(NetworkError::Status(response.status))
    }
  }

  /// Hand a claimed task back to pending when its outcome could not be
  /// stored, so later drains are not blocked behind it.
  fn release(&self, task: &SyncTask) {
    let mut pending = task.clone();
    pending.status = TaskStatus::Pending;
    if let Err(e) = self.store.update(&pending) {
      error!(id = %task.id, error = %e, "Failed to release sync task, recovering on next drain");
      self.stranded.store(true, Ordering::SeqCst);
    }
  }

  fn record_failure(&self, mut task: SyncTask, err: &NetworkError) -> Result<SyncTask> {
    task.attempts += 1;
    task.last_error = Some(err.to_string());

    if task.attempts >= task.max_attempts {
      task.status = TaskStatus::Failed;
      task.next_attempt_at = None;
      warn!(id = %task.id, kind = %task.kind, attempts = task.attempts, error = %err, "Sync task failed permanently");
    } else {
      let delay = self.backoff(task.attempts);
      task.status = TaskStatus::Pending;
      task.next_attempt_at = Some(Utc::now() + delay);
      debug!(id = %task.id, attempts = task.attempts, error = %err, "Sync delivery failed, will retry");
    }

    self.store.update(&task)?;
    Ok(task)
  }

  /// `base * 2^(attempts - 1)`, capped
  fn backoff(&self, attempts: u32) -> ChronoDuration {
    let exponent = attempts.saturating_sub(1).min(20);
    let ms = self
      .config
      .backoff_base_ms
      .saturating_mul(1u64 << exponent)
      .min(self.config.backoff_max_ms);
    ChronoDuration::milliseconds(ms as i64)
  }

  /// Give a failed task a fresh set of attempts.
  pub fn retry(&self, id: Uuid) -> Result<()> {
    let mut task = self
      .store
      .get(id)?
      .ok_or_else(|| eyre!(QueueError::NotFound(id)))?;
    if task.status != TaskStatus::Failed {
      return Err(eyre!(QueueError::NotFailed(id)));
    }

    task.status = TaskStatus::Pending;
    task.max_attempts = task.attempts + self.config.max_attempts;
    task.next_attempt_at = None;
    self.store.update(&task)?;
    info!(%id, "Failed sync task scheduled for retry");
    Ok(())
  }

  /// Remove a failed task once the user has seen it.
  pub fn dismiss(&self, id: Uuid) -> Result<()> {
    let task = self
      .store
      .get(id)?
      .ok_or_else(|| eyre!(QueueError::NotFound(id)))?;
    if task.status != TaskStatus::Failed {
      return Err(eyre!(QueueError::NotFailed(id)));
    }

    self.store.remove(id)?;
    info!(%id, "Failed sync task dismissed");
    Ok(())
  }

  pub fn get(&self, id: Uuid) -> Result<Option<SyncTask>> {
    self.store.get(id)
  }

  pub fn list(&self, status: Option<TaskStatus>) -> Result<Vec<SyncTask>> {
    self.store.list(status)
  }

  pub fn pending_count(&self) -> Result<usize> {
    self.store.active_count()
  }
}
