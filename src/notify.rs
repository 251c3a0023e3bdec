//! Push notification dispatch.
//!
//! Raw push payloads are untrusted: anything that does not parse becomes a
//! generic update notification rather than a dropped event. Emergency pushes
//! bypass throttling, persist until dismissed, and carry an acknowledge action
//! that is queued for sync like any other offline mutation.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::NotificationConfig;
use crate::sync::{SyncKind, SyncQueue};

const GENERIC_BODY: &str = "You have an update";
const THROTTLED_TAG: &str = "updates";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  Normal,
  Emergency,
}

/// What tapping an action does.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionTarget {
  /// Bring the client to the foreground at this route
  Navigate { route: String },
  /// Queue a mutation for the backend
  Mutate { kind: SyncKind, payload: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionRef {
  pub id: String,
  pub label: String,
  pub target: ActionTarget,
}

/// A parsed push event. Lives only while it is shown and tapped.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationPayload {
  pub title: String,
  pub body: String,
  pub priority: Priority,
  /// Route opened by a plain tap
  pub url: String,
  pub actions: Vec<ActionRef>,
}

impl NotificationPayload {
  /// Parse a push payload, falling back to a generic update.
  ///
  /// Accepts `{title?, body?, type?, url?}`; a `type` other than
  /// `"emergency"` (missing, malformed or unknown) means `"update"`.
  pub fn parse(raw: &[u8], app_name: &str) -> Self {
    let fields = match serde_json::from_slice::<Value>(raw) {
      Ok(Value::Object(fields)) => fields,
      Ok(_) | Err(_) => {
        warn!(bytes = raw.len(), "Malformed push payload, showing generic notification");
        return Self::generic(app_name);
      }
    };

    let text = |key: &str| {
      fields
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
    };

    let priority = match text("type").as_deref() {
      Some("emergency") => Priority::Emergency,
      _ => Priority::Normal,
    };
    let title = text("title").unwrap_or_else(|| match priority {
      Priority::Emergency => "Emergency alert".to_string(),
      Priority::Normal => app_name.to_string(),
    });
    let body = text("body").unwrap_or_else(|| GENERIC_BODY.to_string());
    let url = text("url")
      .filter(|u| u.starts_with('/'))
      .unwrap_or_else(|| "/".to_string());

    let mut actions = Vec::new();
    if priority == Priority::Emergency {
      actions.push(ActionRef {
        id: "acknowledge".to_string(),
        label: "Acknowledge".to_string(),
        target: ActionTarget::Mutate {
          kind: SyncKind::Acknowledge,
          payload: json!({ "title": title, "url": url }),
        },
      });
    }
    actions.push(ActionRef {
      id: "open".to_string(),
      label: "Open".to_string(),
      target: ActionTarget::Navigate { route: url.clone() },
    });

    Self {
      title,
      body,
      priority,
      url,
      actions,
    }
  }

  fn generic(app_name: &str) -> Self {
    Self {
      title: app_name.to_string(),
      body: GENERIC_BODY.to_string(),
      priority: Priority::Normal,
      url: "/".to_string(),
      actions: vec![ActionRef {
        id: "open".to_string(),
        label: "Open".to_string(),
        target: ActionTarget::Navigate {
          route: "/".to_string(),
        },
      }],
    }
  }
}

/// A notification as handed to the platform.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
  pub tag: String,
  pub title: String,
  pub body: String,
  pub priority: Priority,
  pub url: String,
  pub actions: Vec<ActionRef>,
  pub vibrate: Vec<u32>,
  /// Stay on screen until the user dismisses it
  pub require_interaction: bool,
  pub renotify: bool,
  pub silent: bool,
}

/// Platform sink that puts notifications on screen.
pub trait Notifier: Send + Sync {
  fn show(&self, notification: &Notification) -> Result<()>;
}

/// Notifier that writes notifications to the log.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
  fn show(&self, n: &Notification) -> Result<()> {
    info!(
      tag = %n.tag,
      priority = ?n.priority,
      title = %n.title,
      body = %n.body,
      silent = n.silent,
      "Notification"
    );
    Ok(())
  }
}

/// Result of tapping a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapOutcome {
  Focus { route: String },
  Enqueued { task_id: Uuid },
}

pub struct Dispatcher {
  notifier: Arc<dyn Notifier>,
  queue: Arc<SyncQueue>,
  config: NotificationConfig,
  /// When the last audible normal notification was shown
  last_audible: Mutex<Option<DateTime<Utc>>>,
}

impl Dispatcher {
  pub fn new(notifier: Arc<dyn Notifier>, queue: Arc<SyncQueue>, config: NotificationConfig) -> Self {
    Self {
      notifier,
      queue,
      config,
      last_audible: Mutex::new(None),
    }
  }

  /// Parse, render and show a raw push payload.
  pub fn dispatch(&self, raw: &[u8]) -> Result<Notification> {
    let payload = NotificationPayload::parse(raw, &self.config.app_name);
    let notification = self.render(payload, Utc::now())?;
    self.notifier.show(&notification)?;
    Ok(notification)
  }

  fn render(&self, payload: NotificationPayload, now: DateTime<Utc>) -> Result<Notification> {
    let notification = match payload.priority {
      Priority::Emergency => Notification {
        tag: format!("emergency-{}", Uuid::new_v4()),
        vibrate: self.config.emergency_vibration.clone(),
        require_interaction: true,
        renotify: true,
        silent: false,
        title: payload.title,
        body: payload.body,
        priority: payload.priority,
        url: payload.url,
        actions: payload.actions,
      },
      Priority::Normal => {
        let throttled = self.throttle(now)?;
        if throttled {
          debug!("Normal notification throttled, showing silently");
        }
        Notification {
          tag: if throttled {
            THROTTLED_TAG.to_string()
          } else {
            format!("update-{}", Uuid::new_v4())
          },
          vibrate: if throttled {
            Vec::new()
          } else {
            self.config.normal_vibration.clone()
          },
          require_interaction: false,
          renotify: false,
          silent: throttled,
          title: payload.title,
          body: payload.body,
          priority: payload.priority,
          url: payload.url,
          actions: payload.actions,
        }
      }
    };

    Ok(notification)
  }

  /// True when a normal notification falls inside the quiet window.
  fn throttle(&self, now: DateTime<Utc>) -> Result<bool> {
    let mut last = self
      .last_audible
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let window = Duration::seconds(self.config.throttle_secs);
    match *last {
      Some(at) if now - at < window => Ok(true),
      _ => {
        *last = Some(now);
        Ok(false)
      }
    }
  }

  /// Route a tap. `action` is the tapped action id; `None` is the body.
  pub fn click(&self, notification: &Notification, action: Option<&str>) -> Result<TapOutcome> {
    let target = action
      .and_then(|id| notification.actions.iter().find(|a| a.id == id))
      .map(|a| a.target.clone())
      .unwrap_or_else(|| ActionTarget::Navigate {
        route: notification.url.clone(),
      });

    match target {
      ActionTarget::Navigate { route } => {
        debug!(%route, tag = %notification.tag, "Notification tapped");
        Ok(TapOutcome::Focus { route })
      }
      ActionTarget::Mutate { kind, mut payload } => {
        if let Value::Object(fields) = &mut payload {
          fields.insert("actedAt".to_string(), json!(Utc::now()));
        }
        let task_id = self.queue.enqueue(kind, payload)?;
        info!(%task_id, %kind, tag = %notification.tag, "Notification action queued");
        Ok(TapOutcome::Enqueued { task_id })
      }
    }
  }
}
