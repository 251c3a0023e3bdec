//! Agent version lifecycle and connectivity tracking.
//!
//! A new version is installed in two phases. `prepare_update` fetches every
//! asset in the manifest and stores them under the new version; nothing the
//! active version serves is touched. `commit_update` swaps the active version
//! atomically and purges static assets of every other version. The sync queue
//! and the unversioned tiers survive upgrades.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheStorage, CacheTier, RequestIdentity, STATIC_STALE_AFTER_DAYS};
use crate::db::Database;
use crate::error::LifecycleError;
use crate::net::{send_with_timeout, Request, Transport};

const ACTIVE_VERSION_KEY: &str = "active_version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionState {
  Installing,
  /// Installed, waiting for the client to allow activation
  Waiting,
  Active,
  /// Replaced, or failed to install
  Redundant,
}

/// Versioned list of assets to precache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetManifest {
  pub version: String,
  pub assets: Vec<ManifestAsset>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestAsset {
  pub url: String,
  /// Optional assets may fail without failing the install
  #[serde(default = "default_required")]
  pub required: bool,
}

fn default_required() -> bool {
  true
}

impl AssetManifest {
  pub fn new(version: &str, urls: &[&str]) -> Self {
    Self {
      version: version.to_string(),
      assets: urls
        .iter()
        .map(|url| ManifestAsset {
          url: url.to_string(),
          required: true,
        })
        .collect(),
    }
  }

  /// Load a manifest from a JSON file
  pub fn load(path: &Path) -> Result<Self> {
    let content = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read manifest {}: {}", path.display(), e))?;
    Self::from_json(&content)
  }

  pub fn from_json(content: &str) -> Result<Self> {
    serde_json::from_str(content).map_err(|e| eyre!("Failed to parse manifest: {}", e))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectivityState {
  pub online: bool,
  pub last_transition_at: DateTime<Utc>,
}

pub struct Lifecycle {
  db: Database,
  storage: Arc<dyn CacheStorage>,
  transport: Arc<dyn Transport>,
  base_url: Url,
  timeout: Duration,
  states: Mutex<HashMap<String, VersionState>>,
  waiting: Mutex<Option<String>>,
  active: watch::Sender<Option<String>>,
  connectivity: watch::Sender<ConnectivityState>,
}

impl Lifecycle {
  /// Create the controller, restoring the active version from the database.
  pub fn new(
    db: Database,
    storage: Arc<dyn CacheStorage>,
    transport: Arc<dyn Transport>,
    base_url: Url,
    timeout: Duration,
  ) -> Result<Self> {
    let active = db.get_meta(ACTIVE_VERSION_KEY)?;
    let mut states = HashMap::new();
    if let Some(version) = &active {
      info!(%version, "Restored active version");
      states.insert(version.clone(), VersionState::Active);
    }

    let (active, _) = watch::channel(active);
    let (connectivity, _) = watch::channel(ConnectivityState {
      online: true,
      last_transition_at: Utc::now(),
    });

    Ok(Self {
      db,
      storage,
      transport,
      base_url,
      timeout,
      states: Mutex::new(states),
      waiting: Mutex::new(None),
      active,
      connectivity,
    })
  }

  // ============================================================================
  // Versions
  // ============================================================================

  pub fn active_version(&self) -> Option<String> {
    self.active.borrow().clone()
  }

  /// Receiver that tracks the active version
  pub fn watch_version(&self) -> watch::Receiver<Option<String>> {
    self.active.subscribe()
  }

  pub fn waiting_version(&self) -> Result<Option<String>> {
    Ok(self.lock_waiting()?.clone())
  }

  pub fn state(&self, version: &str) -> Result<Option<VersionState>> {
    Ok(self.lock_states()?.get(version).copied())
  }

  /// Fetch and store every asset of `manifest` under its version.
  ///
  /// On success the version is Waiting. If any required asset fails the
  /// version becomes Redundant and the active version is left untouched.
  /// Preparing the same version again refetches and overwrites its assets.
  pub async fn prepare_update(&self, manifest: &AssetManifest) -> Result<VersionState> {
    let version = manifest.version.trim();
    if version.is_empty() {
      return Err(eyre!("Manifest has no version"));
    }
    if manifest.assets.is_empty() {
      return Err(LifecycleError::EmptyManifest(version.to_string()).into());
    }
    if self.active_version().as_deref() == Some(version) {
      debug!(%version, "Version already active, nothing to install");
      return Ok(VersionState::Active);
    }

    self.set_state(version, VersionState::Installing)?;
    info!(%version, assets = manifest.assets.len(), "Installing version");

    let fetches = manifest
      .assets
      .iter()
      .map(|asset| self.fetch_asset(version, asset));
    let results = join_all(fetches).await;

    let mut entries = Vec::with_capacity(results.len());
    for (asset, result) in manifest.assets.iter().zip(results) {
      match result {
        Ok(entry) => entries.push(entry),
        Err(reason) if asset.required => {
          warn!(%version, url = %asset.url, %reason, "Install failed");
          self.set_state(version, VersionState::Redundant)?;
          return Err(
            LifecycleError::AssetFetch {
              url: asset.url.clone(),
              reason,
            }
            .into(),
          );
        }
        Err(reason) => {
          warn!(%version, url = %asset.url, %reason, "Skipping optional asset");
        }
      }
    }

    self.storage.put_all(&entries)?;

    let superseded = self.lock_waiting()?.replace(version.to_string());
    if let Some(old) = superseded.filter(|old| old != version) {
      debug!(version = %old, "Waiting version superseded");
      self.set_state(&old, VersionState::Redundant)?;
    }
    self.set_state(version, VersionState::Waiting)?;
    info!(%version, stored = entries.len(), "Version installed and waiting");

    Ok(VersionState::Waiting)
  }

  async fn fetch_asset(&self, version: &str, asset: &ManifestAsset) -> Result<CacheEntry, String> {
    let request = Request::get(asset.url.as_str());
    let url = request.resolve(&self.base_url).map_err(|e| e.to_string())?;
    let response = send_with_timeout(self.transport.as_ref(), &url, &request, self.timeout)
      .await
      .map_err(|e| e.to_string())?;

    if !response.is_success() {
      return Err(format!("HTTP {}", response.status));
    }

    let entry = CacheEntry::new(
      &RequestIdentity::for_asset(&url),
      CacheTier::Static,
      response.status,
      response.content_type,
      response.body,
      ChronoDuration::days(STATIC_STALE_AFTER_DAYS),
    )
    .with_version(version);

    Ok(entry)
  }

  /// Promote the waiting version to active.
  ///
  /// Requires `consent` when another version is active, so a running client
  /// never has assets swapped under it. Purges static assets of every other
  /// version; the sync queue is never touched.
  pub fn commit_update(&self, consent: bool) -> Result<String> {
    let mut waiting = self.lock_waiting()?;
    let version = waiting.clone().ok_or(LifecycleError::NothingWaiting)?;

    let previous = self.active_version();
    if previous.is_some() && !consent {
      return Err(LifecycleError::ConsentRequired(version).into());
    }

    self.db.set_meta(ACTIVE_VERSION_KEY, &version)?;
    *waiting = None;
    drop(waiting);

    self.active.send_replace(Some(version.clone()));
    if let Some(old) = &previous {
      self.set_state(old, VersionState::Redundant)?;
    }
    self.set_state(&version, VersionState::Active)?;

    let purged = self.storage.purge_other_versions(&version)?;
    info!(%version, previous = ?previous, purged, "Version activated");

    Ok(version)
  }

  fn set_state(&self, version: &str, state: VersionState) -> Result<()> {
    self.lock_states()?.insert(version.to_string(), state);
    Ok(())
  }

  fn lock_states(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, VersionState>>> {
    self
      .states
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn lock_waiting(&self) -> Result<std::sync::MutexGuard<'_, Option<String>>> {
    self
      .waiting
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  // ============================================================================
  // Connectivity
  // ============================================================================

  pub fn connectivity(&self) -> ConnectivityState {
    *self.connectivity.borrow()
  }

  pub fn watch_connectivity(&self) -> watch::Receiver<ConnectivityState> {
    self.connectivity.subscribe()
  }

  /// Record a connectivity signal. Returns true on an offline to online
  /// transition, which should trigger a queue drain.
  pub fn set_online(&self, online: bool) -> bool {
    let mut came_online = false;
    self.connectivity.send_if_modified(|state| {
      if state.online == online {
        return false;
      }
      came_online = online;
      state.online = online;
      state.last_transition_at = Utc::now();
      true
    });

    if came_online {
      info!("Connectivity restored");
    } else if !online {
      debug!("Connectivity signal: offline");
    }
    came_online
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::config::SyncConfig;
  use crate::net::mock::{MockTransport, Reply};
  use crate::sync::{SqliteQueueStore, SyncKind, SyncQueue};
  use serde_json::json;

  struct Fixture {
    db: Database,
    lifecycle: Lifecycle,
    transport: Arc<MockTransport>,
    storage: Arc<SqliteStorage>,
  }

  fn fixture_with(db: Database) -> Fixture {
    let transport = Arc::new(MockTransport::new());
    let storage = Arc::new(SqliteStorage::new(db.clone()));
    let lifecycle = Lifecycle::new(
      db.clone(),
      storage.clone(),
      transport.clone(),
      Url::parse("https://care.test").unwrap(),
      Duration::from_millis(100),
    )
    .unwrap();

    Fixture {
      db,
      lifecycle,
      transport,
      storage,
    }
  }

  fn fixture() -> Fixture {
    fixture_with(Database::open_in_memory().unwrap())
  }

  fn static_versions(storage: &SqliteStorage) -> Vec<String> {
    let mut versions: Vec<String> = storage
      .list(CacheTier::Static)
      .unwrap()
      .into_iter()
      .map(|e| e.version)
      .collect();
    versions.sort();
    versions.dedup();
    versions
  }

  #[tokio::test]
  async fn test_first_install_then_commit_without_consent() {
    let f = fixture();
    let manifest = AssetManifest::new("v1", &["/", "/app.js", "/offline.html"]);

    let state = f.lifecycle.prepare_update(&manifest).await.unwrap();
    assert_eq!(state, VersionState::Waiting);
    assert_eq!(f.lifecycle.active_version(), None);
    assert_eq!(f.storage.count(CacheTier::Static).unwrap(), 3);

    // No client is running an older version, so no consent is needed
    let version = f.lifecycle.commit_update(false).unwrap();
    assert_eq!(version, "v1");
    assert_eq!(f.lifecycle.active_version().as_deref(), Some("v1"));
    assert_eq!(f.lifecycle.state("v1").unwrap(), Some(VersionState::Active));
    assert_eq!(f.db.get_meta(ACTIVE_VERSION_KEY).unwrap().as_deref(), Some("v1"));
  }

  #[tokio::test]
  async fn test_prepare_twice_is_idempotent() {
    let f = fixture();
    let manifest = AssetManifest::new("v1", &["/", "/app.js"]);

    f.lifecycle.prepare_update(&manifest).await.unwrap();
    f.lifecycle.prepare_update(&manifest).await.unwrap();

    assert_eq!(f.storage.count(CacheTier::Static).unwrap(), 2);
    assert_eq!(f.lifecycle.waiting_version().unwrap().as_deref(), Some("v1"));
  }

  #[tokio::test]
  async fn test_failed_asset_keeps_previous_active() {
    let f = fixture();
    f.lifecycle
      .prepare_update(&AssetManifest::new("v1", &["/", "/app.js"]))
      .await
      .unwrap();
    f.lifecycle.commit_update(false).unwrap();

    f.transport.reply("/app.v2.js", Reply::Fail);
    let err = f
      .lifecycle
      .prepare_update(&AssetManifest::new("v2", &["/", "/app.v2.js"]))
      .await
      .unwrap_err();

    assert!(matches!(
      err.downcast_ref::<LifecycleError>(),
      Some(LifecycleError::AssetFetch { url, .. }) if url == "/app.v2.js"
    ));
    assert_eq!(f.lifecycle.state("v2").unwrap(), Some(VersionState::Redundant));
    assert_eq!(f.lifecycle.active_version().as_deref(), Some("v1"));
    assert_eq!(f.lifecycle.waiting_version().unwrap(), None);
    assert_eq!(static_versions(&f.storage), vec!["v1".to_string()]);
  }

  #[tokio::test]
  async fn test_non_success_status_fails_install() {
    let f = fixture();
    f.transport.reply("/missing.css", Reply::Ok(404, "nope"));

    let err = f
      .lifecycle
      .prepare_update(&AssetManifest::new("v1", &["/missing.css"]))
      .await
      .unwrap_err();

    assert!(err.to_string().contains("HTTP 404"));
  }

  #[tokio::test]
  async fn test_optional_asset_may_fail() {
    let f = fixture();
    f.transport.reply("/hero.png", Reply::Fail);
    let manifest = AssetManifest::from_json(
      r#"{"version": "v1", "assets": [{"url": "/"}, {"url": "/hero.png", "required": false}]}"#,
    )
    .unwrap();

    let state = f.lifecycle.prepare_update(&manifest).await.unwrap();

    assert_eq!(state, VersionState::Waiting);
    assert_eq!(f.storage.count(CacheTier::Static).unwrap(), 1);
  }

  #[tokio::test]
  async fn test_upgrade_requires_consent_and_purges_old_static() {
    let f = fixture();
    let queue = SyncQueue::new(
      Arc::new(SqliteQueueStore::new(f.db.clone())),
      f.transport.clone(),
      Url::parse("https://care.test").unwrap(),
      SyncConfig::default(),
      Duration::from_millis(100),
    )
    .unwrap();

    f.lifecycle
      .prepare_update(&AssetManifest::new("v1", &["/", "/app.js"]))
      .await
      .unwrap();
    f.lifecycle.commit_update(false).unwrap();
    queue
      .enqueue(SyncKind::EmergencyTrigger, json!({"reason": "fall"}))
      .unwrap();

    f.lifecycle
      .prepare_update(&AssetManifest::new("v2", &["/", "/app.v2.js"]))
      .await
      .unwrap();
    assert_eq!(
      static_versions(&f.storage),
      vec!["v1".to_string(), "v2".to_string()]
    );

    let err = f.lifecycle.commit_update(false).unwrap_err();
    assert_eq!(
      err.downcast_ref::<LifecycleError>(),
      Some(&LifecycleError::ConsentRequired("v2".to_string()))
    );
    assert_eq!(f.lifecycle.active_version().as_deref(), Some("v1"));

    let mut version_rx = f.lifecycle.watch_version();
    f.lifecycle.commit_update(true).unwrap();

    assert!(version_rx.has_changed().unwrap());
    assert_eq!(version_rx.borrow_and_update().as_deref(), Some("v2"));
    assert_eq!(f.lifecycle.state("v1").unwrap(), Some(VersionState::Redundant));
    assert_eq!(static_versions(&f.storage), vec!["v2".to_string()]);
    assert_eq!(queue.pending_count().unwrap(), 1);
  }

  #[test]
  fn test_commit_with_nothing_waiting() {
    let f = fixture();
    let err = f.lifecycle.commit_update(true).unwrap_err();
    assert_eq!(
      err.downcast_ref::<LifecycleError>(),
      Some(&LifecycleError::NothingWaiting)
    );
  }

  #[tokio::test]
  async fn test_empty_manifest_rejected() {
    let f = fixture();
    let err = f
      .lifecycle
      .prepare_update(&AssetManifest::new("v1", &[]))
      .await
      .unwrap_err();
    assert_eq!(
      err.downcast_ref::<LifecycleError>(),
      Some(&LifecycleError::EmptyManifest("v1".to_string()))
    );
  }

  #[tokio::test]
  async fn test_active_version_restored_after_restart() {
    let db = Database::open_in_memory().unwrap();
    let f = fixture_with(db.clone());
    f.lifecycle
      .prepare_update(&AssetManifest::new("v1", &["/"]))
      .await
      .unwrap();
    f.lifecycle.commit_update(false).unwrap();
    drop(f);

    let restarted = fixture_with(db);
    assert_eq!(restarted.lifecycle.active_version().as_deref(), Some("v1"));
    assert_eq!(
      restarted.lifecycle.state("v1").unwrap(),
      Some(VersionState::Active)
    );
  }

  #[test]
  fn test_connectivity_transitions() {
    let f = fixture();
    assert!(f.lifecycle.connectivity().online);

    assert!(!f.lifecycle.set_online(true));
    assert!(!f.lifecycle.set_online(false));
    assert!(!f.lifecycle.connectivity().online);
    assert!(!f.lifecycle.set_online(false));
    assert!(f.lifecycle.set_online(true));
    assert!(f.lifecycle.connectivity().online);
  }
}
