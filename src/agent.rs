//! The background agent: owns every component and serves the foreground
//! through a typed message channel.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{Resolver, Response, SqliteStorage, Staleness};
use crate::config::Config;
use crate::db::Database;
use crate::event::{EmergencyOutcome, ForegroundEvent, Message};
use crate::lifecycle::{AssetManifest, ConnectivityState, Lifecycle, VersionState};
use crate::net::{HttpTransport, Request, Transport};
use crate::notify::{Dispatcher, Notification, Notifier, TapOutcome, TracingNotifier};
use crate::sync::{DrainReport, SqliteQueueStore, SyncEvent, SyncQueue};

/// Pending messages before senders wait.
const MAILBOX_CAPACITY: usize = 64;

/// Components shared by the loop and the handlers it spawns.
struct Core {
  resolver: Resolver,
  queue: Arc<SyncQueue>,
  lifecycle: Lifecycle,
  dispatcher: Dispatcher,
  emergency_trigger_path: String,
  events: mpsc::UnboundedSender<ForegroundEvent>,
}

pub struct Agent;

impl Agent {
  /// Open the database at the configured path and start the agent with the
  /// HTTP transport and a log-backed notifier.
  pub fn init(config: Config) -> Result<(AgentHandle, mpsc::UnboundedReceiver<ForegroundEvent>)> {
    let db_path = config.database_path()?;
    let db = Database::open(&db_path)?;
    let transport = Arc::new(HttpTransport::new()?);
    Self::with_parts(config, db, transport, Arc::new(TracingNotifier))
  }

  /// Start the agent on an existing database, transport and notifier.
  ///
  /// Must be called from within a tokio runtime.
  pub fn with_parts(
    config: Config,
    db: Database,
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn Notifier>,
  ) -> Result<(AgentHandle, mpsc::UnboundedReceiver<ForegroundEvent>)> {
    let base_url = Url::parse(&config.backend.base_url)
      .map_err(|e| eyre!("Invalid backend URL '{}': {}", config.backend.base_url, e))?;

    let storage = Arc::new(SqliteStorage::new(db.clone()));
    let queue = Arc::new(SyncQueue::new(
      Arc::new(SqliteQueueStore::new(db.clone())),
      transport.clone(),
      base_url.clone(),
      config.sync.clone(),
      config.timeouts.sync(),
    )?);
    let lifecycle = Lifecycle::new(
      db,
      storage.clone(),
      transport.clone(),
      base_url.clone(),
      config.timeouts.static_asset(),
    )?;
    let resolver = Resolver::new(
      &config,
      base_url,
      storage,
      transport,
      queue.clone(),
      lifecycle.watch_version(),
    );
    let dispatcher = Dispatcher::new(notifier, queue.clone(), config.notifications.clone());

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let core = Arc::new(Core {
      resolver,
      queue: queue.clone(),
      lifecycle,
      dispatcher,
      emergency_trigger_path: config.backend.emergency_trigger_path.clone(),
      events: events_tx,
    });

    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    let drain_every = Duration::from_secs(config.sync.drain_interval_secs.max(1));
    let task = tokio::spawn(run(core, rx, queue.subscribe(), drain_every));

    info!(pending = ?queue.pending_count().ok(), "Agent started");
    Ok((AgentHandle { tx, task }, events_rx))
  }
}

/// Foreground side of the agent.
pub struct AgentHandle {
  tx: mpsc::Sender<Message>,
  task: JoinHandle<()>,
}

impl AgentHandle {
  pub async fn fetch(&self, request: Request) -> Result<Response> {
    self.call(|reply| Message::Fetch { request, reply }).await?
  }

  pub async fn install(&self, manifest: AssetManifest) -> Result<VersionState> {
    self.call(|reply| Message::Install { manifest, reply }).await?
  }

  /// Activate the waiting version. Calling this is the client's consent.
  pub async fn apply_update(&self) -> Result<String> {
    self.call(|reply| Message::ApplyUpdate { reply }).await?
  }

  pub async fn drain(&self) -> Result<DrainReport> {
    self
      .call(|reply| Message::Sync {
        tag: "manual".to_string(),
        reply: Some(reply),
      })
      .await?
  }

  pub async fn push(&self, raw: Vec<u8>) -> Result<Notification> {
    self
      .call(|reply| Message::Push {
        raw,
        reply: Some(reply),
      })
      .await?
  }

  pub async fn click(&self, notification: Notification, action: Option<String>) -> Result<TapOutcome> {
    self
      .call(|reply| Message::NotificationClick {
        notification,
        action,
        reply,
      })
      .await?
  }

  pub async fn set_online(&self, online: bool) -> Result<()> {
    self.send(Message::SetOnline(online)).await
  }

  pub async fn get_connectivity(&self) -> Result<ConnectivityState> {
    self.call(|reply| Message::GetConnectivity { reply }).await
  }

  pub async fn trigger_emergency(&self, payload: Value) -> Result<EmergencyOutcome> {
    self
      .call(|reply| Message::TriggerEmergency { payload, reply })
      .await?
  }

  /// Stop the loop and wait for in-flight handlers to finish.
  pub async fn shutdown(self) -> Result<()> {
    self.send(Message::Shutdown).await?;
    self
      .task
      .await
      .map_err(|e| eyre!("Agent task failed: {}", e))
  }

  async fn send(&self, message: Message) -> Result<()> {
    self
      .tx
      .send(message)
      .await
      .map_err(|_| eyre!("Agent is not running"))
  }

  async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Message) -> Result<T> {
    let (reply, rx) = oneshot::channel();
    self.send(build(reply)).await?;
    rx.await.map_err(|_| eyre!("Agent dropped the request"))
  }
}

async fn run(
  core: Arc<Core>,
  mut rx: mpsc::Receiver<Message>,
  mut sync_events: broadcast::Receiver<SyncEvent>,
  drain_every: Duration,
) {
  let mut ticker = interval_at(Instant::now() + drain_every, drain_every);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  let mut handlers = JoinSet::new();

  loop {
    tokio::select! {
      message = rx.recv() => match message {
        None | Some(Message::Shutdown) => break,
        Some(message) => handle(&core, &mut handlers, message),
      },

      _ = ticker.tick() => {
        if core.lifecycle.connectivity().online {
          spawn_drain(&core, &mut handlers, "periodic", None);
        } else {
          debug!("Offline, skipping scheduled drain");
        }
      }

      event = sync_events.recv() => match event {
        Ok(SyncEvent::Delivered { id, kind }) => core.emit(ForegroundEvent::SyncDelivered { id, kind }),
        Ok(SyncEvent::Failed(task)) => core.emit(ForegroundEvent::SyncFailed(task)),
        Ok(SyncEvent::Retrying { .. }) => {}
        Err(broadcast::error::RecvError::Lagged(missed)) => {
          warn!(missed, "Dropped sync signals");
        }
        Err(broadcast::error::RecvError::Closed) => break,
      },

      Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
        if let Err(e) = joined {
          error!(error = %e, "Agent handler panicked");
        }
      }
    }
  }

  info!(in_flight = handlers.len(), "Agent shutting down");
  while handlers.join_next().await.is_some() {}
}

fn handle(core: &Arc<Core>, handlers: &mut JoinSet<()>, message: Message) {
  match message {
    Message::Fetch { request, reply } => {
      let core = core.clone();
      handlers.spawn(async move {
        let _ = reply.send(core.resolver.resolve(&request).await);
      });
    }

    Message::Install { manifest, reply } => {
      let core = core.clone();
      handlers.spawn(async move {
        let _ = reply.send(core.install(&manifest).await);
      });
    }

    Message::ApplyUpdate { reply } => {
      let result = core.lifecycle.commit_update(true);
      if let Ok(version) = &result {
        core.emit(ForegroundEvent::VersionActivated {
          version: version.clone(),
        });
      }
      let _ = reply.send(result);
    }

    Message::Sync { tag, reply } => spawn_drain(core, handlers, &tag, reply),

    Message::Push { raw, reply } => {
      let result = core.dispatcher.dispatch(&raw);
      if let Err(e) = &result {
        warn!(error = %e, "Failed to show notification");
      }
      if let Some(reply) = reply {
        let _ = reply.send(result);
      }
    }

    Message::NotificationClick {
      notification,
      action,
      reply,
    } => {
      let result = core.dispatcher.click(&notification, action.as_deref());
      match &result {
        Ok(TapOutcome::Focus { route }) => core.emit(ForegroundEvent::Focus {
          route: route.clone(),
        }),
        Ok(TapOutcome::Enqueued { .. }) if core.lifecycle.connectivity().online => {
          spawn_drain(core, handlers, "notification", None);
        }
        _ => {}
      }
      let _ = reply.send(result);
    }

    Message::SetOnline(online) => {
      let before = core.lifecycle.connectivity();
      let came_online = core.lifecycle.set_online(online);
      let after = core.lifecycle.connectivity();
      if after != before {
        core.emit(ForegroundEvent::ConnectivityChanged(after));
      }
      if came_online {
        spawn_drain(core, handlers, "reconnect", None);
      }
    }

    Message::GetConnectivity { reply } => {
      let _ = reply.send(core.lifecycle.connectivity());
    }

    Message::TriggerEmergency { payload, reply } => {
      let core = core.clone();
      handlers.spawn(async move {
        let _ = reply.send(core.trigger_emergency(&payload).await);
      });
    }

    Message::Shutdown => {}
  }
}

fn spawn_drain(
  core: &Arc<Core>,
  handlers: &mut JoinSet<()>,
  tag: &str,
  reply: Option<oneshot::Sender<Result<DrainReport>>>,
) {
  let queue = core.queue.clone();
  let tag = tag.to_string();
  handlers.spawn(async move {
    let result = queue.drain().await;
    match &result {
      Ok(report) if !report.delivered.is_empty() || !report.failed.is_empty() => {
        info!(
          delivered = report.delivered.len(),
          retried = report.retried.len(),
          failed = report.failed.len(),
          %tag,
          "Sync queue drained"
        );
      }
      Ok(_) => debug!(%tag, "Nothing to sync"),
      Err(e) => error!(error = %e, %tag, "Sync queue drain failed"),
    }
    if let Some(reply) = reply {
      let _ = reply.send(result);
    }
  });
}

impl Core {
  fn emit(&self, event: ForegroundEvent) {
    if self.events.send(event).is_err() {
      debug!("No foreground listener");
    }
  }

  /// Prepare a version, activating it at once when nothing is active yet.
  async fn install(&self, manifest: &AssetManifest) -> Result<VersionState> {
    let state = self.lifecycle.prepare_update(manifest).await?;
    if state != VersionState::Waiting {
      return Ok(state);
    }

    if self.lifecycle.active_version().is_none() {
      let version = self.lifecycle.commit_update(false)?;
      self.emit(ForegroundEvent::VersionActivated { version });
      return Ok(VersionState::Active);
    }

    self.emit(ForegroundEvent::UpdateReady {
      version: manifest.version.clone(),
    });
    Ok(state)
  }

  /// POST the trigger with the emergency deadline. It is queued as an
  /// emergency task when the backend cannot be reached, whatever class the
  /// configured path would otherwise get.
  async fn trigger_emergency(&self, payload: &Value) -> Result<EmergencyOutcome> {
    let request = Request::post_json(self.emergency_trigger_path.as_str(), payload);
    let response = self.resolver.send_emergency(&request).await?;

    match response.staleness {
      Staleness::Queued { task_id } => {
        warn!(%task_id, "Emergency trigger queued for delivery");
        Ok(EmergencyOutcome::Queued { task_id })
      }
      _ if (200..300).contains(&response.status) => {
        info!(status = response.status, "Emergency trigger sent");
        Ok(EmergencyOutcome::Sent {
          status: response.status,
        })
      }
      _ => {
        error!(status = response.status, "Emergency trigger rejected by backend");
        Ok(EmergencyOutcome::Rejected {
          status: response.status,
        })
      }
    }
  }
}
