//! Resolution engine: runs the per-class strategy between the foreground
//! layer, the network and the cache store.

use chrono::{Duration as ChronoDuration, Utc};
use color_eyre::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use url::Url;

use super::storage::CacheStorage;
use super::types::{CacheEntry, CacheTier, RequestIdentity, Response, Staleness};
use crate::classify::{Classifier, RequestClass};
use crate::config::{CachePolicyConfig, Config, EmergencyContact, TimeoutConfig};
use crate::error::NetworkError;
use crate::net::{send_with_timeout, NetResponse, Request, Transport};
use crate::sync::{SyncKind, SyncQueue};

/// Static assets are immutable per version; their age never matters.
pub(crate) const STATIC_STALE_AFTER_DAYS: i64 = 365;

const OFFLINE_PAGE: &str = "<!DOCTYPE html>
<html lang=\"en\">
<head><meta charset=\"utf-8\"><title>Offline</title></head>
<body>
<h1>You are offline</h1>
<p>Emergency actions you take now are saved and sent as soon as the connection returns.</p>
</body>
</html>
";

/// Resolves requests with a strategy chosen by their class.
///
/// Mutations go to the network and are queued when that fails: as emergency
/// triggers for the Emergency class, as health updates for every other class.
/// Reads follow the class strategy:
///
/// - Emergency: network (short timeout), else Fallback tier, else an offline
///   emergency response.
/// - ApiData: network, else stale ApiData entry, else `Unavailable`.
/// - StaticAsset: cache-first against the active version.
/// - Navigation: network, else cached shell, else offline page.
pub struct Resolver {
  classifier: Classifier,
  storage: Arc<dyn CacheStorage>,
  transport: Arc<dyn Transport>,
  queue: Arc<SyncQueue>,
  base_url: Url,
  timeouts: TimeoutConfig,
  policy: CachePolicyConfig,
  contacts: Vec<EmergencyContact>,
  /// Active agent version, published by the lifecycle controller
  version: watch::Receiver<Option<String>>,
}

impl Resolver {
  pub fn new(
    config: &Config,
    base_url: Url,
    storage: Arc<dyn CacheStorage>,
    transport: Arc<dyn Transport>,
    queue: Arc<SyncQueue>,
    version: watch::Receiver<Option<String>>,
  ) -> Self {
    Self {
      classifier: Classifier::new(&config.classifier),
      storage,
      transport,
      queue,
      base_url,
      timeouts: config.timeouts.clone(),
      policy: config.cache.clone(),
      contacts: config.emergency_contacts.clone(),
      version,
    }
  }

  /// Resolve a foreground request.
  ///
  /// Errors only when the request URL is invalid or a failed mutation could
  /// not be persisted to the sync queue; every read degrades to a stale or
  /// `Unavailable` response instead.
  pub async fn resolve(&self, request: &Request) -> Result<Response> {
    let url = request.resolve(&self.base_url)?;
    let class = self.classifier.classify(&url, request.accept());
    debug!(%url, method = %request.method, %class, "Resolving request");

    match class {
      RequestClass::Emergency => self.resolve_emergency(&url, request).await,
      _ if request.is_mutating() => {
        let timeout = self.timeout_for(class);
        self
          .send_or_queue(&url, request, timeout, SyncKind::HealthUpdate)
          .await
      }
      RequestClass::ApiData => self.resolve_api(&url, request).await,
      RequestClass::StaticAsset => Ok(self.resolve_static(&url, request).await),
      RequestClass::Navigation => Ok(self.resolve_navigation(&url, request).await),
    }
  }

  pub fn classify(&self, request: &Request) -> Result<RequestClass> {
    let url = request.resolve(&self.base_url)?;
    Ok(self.classifier.classify(&url, request.accept()))
  }

  /// Send an emergency action with the emergency deadline, queueing it as an
  /// `EmergencyTrigger` on failure. The request is not classified, so any
  /// path is treated as an emergency.
  pub async fn send_emergency(&self, request: &Request) -> Result<Response> {
    let url = request.resolve(&self.base_url)?;
    self
      .send_or_queue(&url, request, self.timeouts.emergency(), SyncKind::EmergencyTrigger)
      .await
  }

  fn timeout_for(&self, class: RequestClass) -> Duration {
    match class {
      RequestClass::Emergency => self.timeouts.emergency(),
      RequestClass::ApiData => self.timeouts.api(),
      RequestClass::StaticAsset => self.timeouts.static_asset(),
      RequestClass::Navigation => self.timeouts.navigation(),
    }
  }

  /// Network first; a mutation that cannot be sent is persisted for the
  /// sync queue instead of being lost.
  async fn send_or_queue(
    &self,
    url: &Url,
    request: &Request,
    timeout: Duration,
    kind: SyncKind,
  ) -> Result<Response> {
    match self.fetch(url, request, timeout).await {
      Ok(response) => Ok(into_fresh(response)),
      Err(err) => {
        if kind == SyncKind::EmergencyTrigger {
          warn!(%url, error = %err, "Emergency action could not be sent, queueing");
        } else {
          debug!(%url, %kind, error = %err, "Update could not be sent, queueing");
        }
        self.enqueue(kind, url, request)
      }
    }
  }

  async fn resolve_emergency(&self, url: &Url, request: &Request) -> Result<Response> {
    let timeout = self.timeouts.emergency();

    if request.is_mutating() {
      return self
        .send_or_queue(url, request, timeout, SyncKind::EmergencyTrigger)
        .await;
    }

    let identity = identity_of(url, request);
    match self.fetch(url, request, timeout).await {
      Ok(response) => {
        self.write_through(&identity, CacheTier::Fallback, &response);
        Ok(into_fresh(response))
      }
      Err(err) => {
        warn!(%url, error = %err, "Emergency fetch failed, using fallback");
        match self.lookup(CacheTier::Fallback, &identity) {
          Some(entry) => Ok(stale(entry)),
          None => Ok(self.offline_emergency_response()),
        }
      }
    }
  }

  async fn resolve_api(&self, url: &Url, request: &Request) -> Result<Response> {
    let timeout = self.timeouts.api();
    let identity = identity_of(url, request);
    match self.fetch(url, request, timeout).await {
      Ok(response) => {
        self.write_through(&identity, CacheTier::ApiData, &response);
        Ok(into_fresh(response))
      }
      Err(err) => {
        debug!(%url, error = %err, "API fetch failed, trying cache");
        match self.lookup(CacheTier::ApiData, &identity) {
          Some(entry) => Ok(stale(entry)),
          None => Ok(Response::json(
            503,
            &json!({ "error": "no data available", "offline": true }),
            Staleness::Unavailable,
          )),
        }
      }
    }
  }

  async fn resolve_static(&self, url: &Url, request: &Request) -> Response {
    // Assets are immutable per version, so negotiation is ignored
    let identity = RequestIdentity::new(&request.method, url, None);

    if let Some(entry) = self.lookup(CacheTier::Static, &identity) {
      let stored_at = entry.stored_at;
      return Response::from_entry(entry, Staleness::Cached { stored_at });
    }

    match self.fetch(url, request, self.timeouts.static_asset()).await {
      Ok(response) => {
        self.write_through(&identity, CacheTier::Static, &response);
        into_fresh(response)
      }
      Err(err) => {
        debug!(%url, error = %err, "Static asset unavailable");
        Response::json(
          503,
          &json!({ "error": "asset unavailable", "offline": true }),
          Staleness::Unavailable,
        )
      }
    }
  }

  async fn resolve_navigation(&self, url: &Url, request: &Request) -> Response {
    match self.fetch(url, request, self.timeouts.navigation()).await {
      Ok(response) => into_fresh(response),
      Err(err) => {
        debug!(%url, error = %err, "Navigation failed, serving offline shell");
        self.offline_page()
      }
    }
  }

  fn offline_page(&self) -> Response {
    if let Some(entry) = self.lookup_page(&self.policy.shell_url) {
      return stale(entry);
    }

    if let Some(entry) = self.lookup_page(&self.policy.offline_url) {
      return Response::from_entry(entry, Staleness::Unavailable);
    }

    Response {
      status: 503,
      content_type: Some("text/html; charset=utf-8".to_string()),
      body: OFFLINE_PAGE.as_bytes().to_vec(),
      staleness: Staleness::Unavailable,
    }
  }

  fn lookup_page(&self, path: &str) -> Option<CacheEntry> {
    let url = self.base_url.join(path).ok()?;
    self.lookup(CacheTier::Static, &RequestIdentity::for_asset(&url))
  }

  fn offline_emergency_response(&self) -> Response {
    Response::json(
      503,
      &json!({
        "offline": true,
        "message": "Emergency services could not be reached. Call one of your contacts or your local emergency number.",
        "contacts": self.contacts,
      }),
      Staleness::Unavailable,
    )
  }

  /// Network attempt with a deadline. Server errors count as failures so the
  /// caller falls back to the cache.
  async fn fetch(
    &self,
    url: &Url,
    request: &Request,
    timeout: Duration,
  ) -> Result<NetResponse, NetworkError> {
    let response = send_with_timeout(self.transport.as_ref(), url, request, timeout).await?;
    if response.is_server_error() {
      return Err(NetworkError::Status(response.status));
    }
    Ok(response)
  }

  fn active_version(&self) -> String {
    self.version.borrow().clone().unwrap_or_default()
  }

  fn lookup(&self, tier: CacheTier, identity: &RequestIdentity) -> Option<CacheEntry> {
    let version = self.active_version();
    match self.storage.get(tier, &version, &identity.cache_key()) {
      Ok(entry) => {
        debug!(%tier, url = identity.url(), hit = entry.is_some(), "Cache lookup");
        entry
      }
      Err(e) => {
        warn!(%tier, url = identity.url(), error = %e, "Cache read failed, treating as miss");
        None
      }
    }
  }

  /// Store a successful read before it is returned.
  fn write_through(&self, identity: &RequestIdentity, tier: CacheTier, response: &NetResponse) {
    if identity.method() != "GET" || !response.is_success() {
      return;
    }

    let stale_after = match tier {
      CacheTier::Static => ChronoDuration::days(STATIC_STALE_AFTER_DAYS),
      CacheTier::ApiData => ChronoDuration::seconds(self.policy.api_stale_after_secs),
      CacheTier::Fallback => ChronoDuration::seconds(self.policy.fallback_stale_after_secs),
    };

    let entry = CacheEntry::new(
      identity,
      tier,
      response.status,
      response.content_type.clone(),
      response.body.clone(),
      stale_after,
    )
    .with_version(&self.active_version());

    if let Err(e) = self.storage.put(&entry) {
      warn!(%tier, url = identity.url(), error = %e, "Failed to update cache");
    }
  }

  fn enqueue(&self, kind: SyncKind, url: &Url, request: &Request) -> Result<Response> {
    let task_id = self.queue.enqueue(kind, task_payload(url, request))?;
    Ok(Response::json(
      202,
      &json!({ "queued": true, "taskId": task_id }),
      Staleness::Queued { task_id },
    ))
  }
}

fn identity_of(url: &Url, request: &Request) -> RequestIdentity {
  RequestIdentity::new(&request.method, url, request.accept())
}

fn into_fresh(response: NetResponse) -> Response {
  Response::fresh(response.status, response.content_type, response.body)
}

fn stale(entry: CacheEntry) -> Response {
  let staleness = Staleness::Stale {
    stored_at: entry.stored_at,
    expired: entry.is_expired(Utc::now()),
  };
  Response::from_entry(entry, staleness)
}

/// The queued form of a mutation: where it was going and what it carried.
fn task_payload(url: &Url, request: &Request) -> Value {
  let body = match &request.body {
    None => Value::Null,
    Some(bytes) => serde_json::from_slice(bytes)
      .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned())),
  };

  let mut target = url.path().to_string();
  if let Some(query) = url.query() {
    target.push('?');
    target.push_str(query);
  }

  json!({
    "method": request.method,
    "url": target,
    "body": body,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::config::SyncConfig;
  use crate::db::Database;
  use crate::net::mock::{MockTransport, Reply};
  use crate::sync::{SqliteQueueStore, TaskStatus};

  struct Fixture {
    resolver: Resolver,
    transport: Arc<MockTransport>,
    storage: Arc<SqliteStorage>,
    queue: Arc<SyncQueue>,
  }

  fn fixture() -> Fixture {
    let mut config = Config::default();
    config.timeouts.emergency_ms = 100;
    config.timeouts.api_ms = 100;
    config.timeouts.navigation_ms = 100;
    config.timeouts.static_ms = 100;
    config.emergency_contacts = vec![EmergencyContact {
      name: "Dr. Osei".to_string(),
      phone: "+1 555 0100".to_string(),
    }];

    let db = Database::open_in_memory().unwrap();
    let base = Url::parse("https://care.test").unwrap();
    let transport = Arc::new(MockTransport::new());
    let storage = Arc::new(SqliteStorage::new(db.clone()));
    let queue = Arc::new(
      SyncQueue::new(
        Arc::new(SqliteQueueStore::new(db)),
        transport.clone(),
        base.clone(),
        SyncConfig::default(),
        Duration::from_millis(100),
      )
      .unwrap(),
    );
    let (_tx, version) = watch::channel(Some("v1".to_string()));

    let resolver = Resolver::new(
      &config,
      base,
      storage.clone(),
      transport.clone(),
      queue.clone(),
      version,
    );

    Fixture {
      resolver,
      transport,
      storage,
      queue,
    }
  }

  #[tokio::test]
  async fn test_emergency_online_writes_fallback() {
    let f = fixture();
    f.transport.reply("/api/emergency/contacts", Reply::Ok(200, "[\"mum\"]"));

    let response = f
      .resolver
      .resolve(&Request::get("/api/emergency/contacts"))
      .await
      .unwrap();

    assert_eq!(response.staleness, Staleness::Fresh);
    assert_eq!(response.body, b"[\"mum\"]");
    assert_eq!(f.storage.count(CacheTier::Fallback).unwrap(), 1);
    assert_eq!(f.storage.count(CacheTier::ApiData).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_emergency_offline_serves_stale_fallback_within_timeout() {
    let f = fixture();
    f.transport.reply_once("/api/emergency/contacts", Reply::Ok(200, "[\"mum\"]"));
    f.resolver
      .resolve(&Request::get("/api/emergency/contacts"))
      .await
      .unwrap();

    f.transport.reply("/api/emergency/contacts", Reply::Hang);
    let started = tokio::time::Instant::now();
    let response = f
      .resolver
      .resolve(&Request::get("/api/emergency/contacts"))
      .await
      .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(response.staleness.is_stale());
    assert_eq!(response.body, b"[\"mum\"]");
  }

  #[tokio::test]
  async fn test_emergency_offline_without_fallback() {
    let f = fixture();
    f.transport.set_offline(true);

    let response = f
      .resolver
      .resolve(&Request::get("/api/emergency/contacts"))
      .await
      .unwrap();

    assert_eq!(response.status, 503);
    assert!(response.staleness.is_unavailable());
    let body: Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["contacts"][0]["name"], "Dr. Osei");
    // Reads are never queued
    assert_eq!(f.queue.pending_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_emergency_mutation_offline_is_queued() {
    let f = fixture();
    f.transport.set_offline(true);

    let response = f
      .resolver
      .resolve(&Request::post_json(
        "/api/emergency/trigger",
        &json!({ "reason": "fall" }),
      ))
      .await
      .unwrap();

    assert_eq!(response.status, 202);
    let Staleness::Queued { task_id } = response.staleness else {
      panic!("expected queued response, got {:?}", response.staleness);
    };
    let task = f.queue.get(task_id).unwrap().unwrap();
    assert_eq!(task.kind, SyncKind::EmergencyTrigger);
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.payload["url"], "/api/emergency/trigger");
    assert_eq!(task.payload["body"]["reason"], "fall");
  }

  #[tokio::test]
  async fn test_api_stale_versus_absent() {
    let f = fixture();
    f.transport.reply_once("/api/vitals", Reply::Ok(200, "{\"bpm\":72}"));
    let fresh = f.resolver.resolve(&Request::get("/api/vitals")).await.unwrap();
    assert_eq!(fresh.staleness, Staleness::Fresh);

    f.transport.set_offline(true);
    let cached = f.resolver.resolve(&Request::get("/api/vitals")).await.unwrap();
    assert!(cached.staleness.is_stale());
    assert_eq!(cached.body, b"{\"bpm\":72}");

    let absent = f.resolver.resolve(&Request::get("/api/meds")).await.unwrap();
    assert!(absent.staleness.is_unavailable());
    assert_eq!(absent.status, 503);
  }

  #[tokio::test]
  async fn test_api_server_error_falls_back_to_cache() {
    let f = fixture();
    f.transport.reply_once("/api/vitals", Reply::Ok(200, "old"));
    f.resolver.resolve(&Request::get("/api/vitals")).await.unwrap();

    f.transport.reply_once("/api/vitals", Reply::Ok(502, "bad gateway"));
    let response = f.resolver.resolve(&Request::get("/api/vitals")).await.unwrap();

    assert!(response.staleness.is_stale());
    assert_eq!(response.body, b"old");
  }

  #[tokio::test]
  async fn test_api_non_success_is_not_cached() {
    let f = fixture();
    f.transport.reply_once("/api/vitals", Reply::Ok(404, "missing"));

    let response = f.resolver.resolve(&Request::get("/api/vitals")).await.unwrap();

    assert_eq!(response.status, 404);
    assert_eq!(f.storage.count(CacheTier::ApiData).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_api_mutation_offline_queues_health_update() {
    let f = fixture();
    f.transport.set_offline(true);

    let response = f
      .resolver
      .resolve(&Request::post_json("/api/vitals", &json!({ "bpm": 80 })))
      .await
      .unwrap();

    assert!(matches!(response.staleness, Staleness::Queued { .. }));
    let tasks = f.queue.list(None).unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].kind, SyncKind::HealthUpdate);
  }

  #[tokio::test]
  async fn test_page_form_post_offline_is_queued() {
    let f = fixture();
    f.transport.set_offline(true);
    let post = Request::post_json("/care-plan/notes", &json!({ "note": "slept well" }))
      .with_header("accept", "text/html");
    assert_eq!(f.resolver.classify(&post).unwrap(), RequestClass::Navigation);

    let response = f.resolver.resolve(&post).await.unwrap();

    assert_eq!(response.status, 202);
    let Staleness::Queued { task_id } = response.staleness else {
      panic!("expected queued response, got {:?}", response.staleness);
    };
    let task = f.queue.get(task_id).unwrap().unwrap();
    assert_eq!(task.kind, SyncKind::HealthUpdate);
    assert_eq!(task.payload["url"], "/care-plan/notes");
    assert_eq!(f.queue.pending_count().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_asset_upload_offline_is_queued() {
    let f = fixture();
    f.transport.set_offline(true);
    let upload = Request::new("POST", "/uploads/photo.png").with_body(b"PNG".to_vec());
    assert_eq!(f.resolver.classify(&upload).unwrap(), RequestClass::StaticAsset);

    let response = f.resolver.resolve(&upload).await.unwrap();

    assert_eq!(response.status, 202);
    assert!(matches!(response.staleness, Staleness::Queued { .. }));
    assert_eq!(f.queue.pending_count().unwrap(), 1);
    assert_eq!(f.storage.count(CacheTier::Static).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_asset_upload_online_is_not_cached() {
    let f = fixture();
    f.transport.reply("/uploads/photo.png", Reply::Ok(201, "{}"));
    let upload = Request::new("POST", "/uploads/photo.png").with_body(b"PNG".to_vec());

    let response = f.resolver.resolve(&upload).await.unwrap();

    assert_eq!(response.status, 201);
    assert_eq!(response.staleness, Staleness::Fresh);
    assert_eq!(f.queue.pending_count().unwrap(), 0);
    assert_eq!(f.storage.count(CacheTier::Static).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_send_emergency_ignores_classification() {
    let f = fixture();
    f.transport.set_offline(true);
    let trigger = Request::post_json("/alerts/raise", &json!({ "reason": "fall" }));
    assert_ne!(f.resolver.classify(&trigger).unwrap(), RequestClass::Emergency);

    let response = f.resolver.send_emergency(&trigger).await.unwrap();

    let Staleness::Queued { task_id } = response.staleness else {
      panic!("expected queued response, got {:?}", response.staleness);
    };
    let task = f.queue.get(task_id).unwrap().unwrap();
    assert_eq!(task.kind, SyncKind::EmergencyTrigger);
    assert_eq!(task.payload["url"], "/alerts/raise");
  }

  #[tokio::test]
  async fn test_static_is_cache_first() {
    let f = fixture();
    f.transport.reply("/assets/app.js", Reply::Ok(200, "console.log(1)"));

    let first = f.resolver.resolve(&Request::get("/assets/app.js")).await.unwrap();
    let second = f.resolver.resolve(&Request::get("/assets/app.js")).await.unwrap();

    assert_eq!(first.staleness, Staleness::Fresh);
    assert!(matches!(second.staleness, Staleness::Cached { .. }));
    assert_eq!(second.body, b"console.log(1)");
    assert_eq!(f.transport.calls_to("/assets/app.js").len(), 1);

    let stored = f.storage.list(CacheTier::Static).unwrap();
    assert_eq!(stored[0].version, "v1");
  }

  #[tokio::test]
  async fn test_static_miss_offline_is_unavailable() {
    let f = fixture();
    f.transport.set_offline(true);

    let response = f.resolver.resolve(&Request::get("/img/logo.png")).await.unwrap();
    assert!(response.staleness.is_unavailable());
  }

  #[tokio::test]
  async fn test_navigation_offline_uses_shell_then_offline_page() {
    let f = fixture();
    f.transport.set_offline(true);
    let nav = Request::get("/care-plan").with_header("accept", "text/html");

    let builtin = f.resolver.resolve(&nav).await.unwrap();
    assert!(builtin.staleness.is_unavailable());
    assert!(builtin.body_text().contains("You are offline"));

    let shell_url = Url::parse("https://care.test/").unwrap();
    let shell = CacheEntry::new(
      &RequestIdentity::for_asset(&shell_url),
      CacheTier::Static,
      200,
      Some("text/html".to_string()),
      b"<html>shell</html>".to_vec(),
      ChronoDuration::days(1),
    )
    .with_version("v1");
    f.storage.put(&shell).unwrap();

    let response = f.resolver.resolve(&nav).await.unwrap();
    assert!(response.staleness.is_stale());
    assert_eq!(response.body, b"<html>shell</html>");
  }

  #[tokio::test]
  async fn test_navigation_online_is_fresh() {
    let f = fixture();
    f.transport.reply("/care-plan", Reply::Ok(200, "<html>plan</html>"));
    let nav = Request::get("/care-plan").with_header("accept", "text/html");

    let response = f.resolver.resolve(&nav).await.unwrap();
    assert_eq!(response.staleness, Staleness::Fresh);
  }

  #[test]
  fn test_task_payload_keeps_non_json_body() {
    let url = Url::parse("https://care.test/api/notes?x=1").unwrap();
    let request = Request::new("PUT", "/api/notes?x=1").with_body(b"plain text".to_vec());

    let payload = task_payload(&url, &request);
    assert_eq!(payload["method"], "PUT");
    assert_eq!(payload["url"], "/api/notes?x=1");
    assert_eq!(payload["body"], "plain text");
  }
}
