//! Messages into the agent and events out of it.

use color_eyre::Result;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::cache::Response;
use crate::lifecycle::{AssetManifest, ConnectivityState, VersionState};
use crate::net::Request;
use crate::notify::{Notification, TapOutcome};
use crate::sync::{DrainReport, SyncKind, SyncTask};

type Reply<T> = oneshot::Sender<Result<T>>;

/// Commands handled by the agent loop.
#[derive(Debug)]
pub enum Message {
  /// Resolve a foreground request
  Fetch { request: Request, reply: Reply<Response> },
  /// Prepare a new version from its asset manifest
  Install {
    manifest: AssetManifest,
    reply: Reply<VersionState>,
  },
  /// Foreground consent to activate the waiting version
  ApplyUpdate { reply: Reply<String> },
  /// Drain the sync queue. `tag` names the trigger in logs.
  Sync {
    tag: String,
    reply: Option<Reply<DrainReport>>,
  },
  /// Raw push payload
  Push {
    raw: Vec<u8>,
    reply: Option<Reply<Notification>>,
  },
  NotificationClick {
    notification: Notification,
    action: Option<String>,
    reply: Reply<TapOutcome>,
  },
  SetOnline(bool),
  GetConnectivity {
    reply: oneshot::Sender<ConnectivityState>,
  },
  /// Send an emergency trigger now, or queue it
  TriggerEmergency {
    payload: Value,
    reply: Reply<EmergencyOutcome>,
  },
  Shutdown,
}

/// What happened to an emergency trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmergencyOutcome {
  /// Reached the backend
  Sent { status: u16 },
  /// Queued for delivery when connectivity returns
  Queued { task_id: Uuid },
  /// The backend answered but refused the trigger (a non-2xx, non-5xx
  /// status). Not queued: a resend would be refused the same way.
  Rejected { status: u16 },
}

/// Signals for the foreground layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ForegroundEvent {
  SyncDelivered { id: Uuid, kind: SyncKind },
  /// A task exhausted its attempts and needs the user
  SyncFailed(SyncTask),
  UpdateReady { version: String },
  VersionActivated { version: String },
  /// A notification tap asked to bring the client forward
  Focus { route: String },
  ConnectivityChanged(ConnectivityState),
}
