//! Scripted transport for unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use url::Url;

use super::types::{NetResponse, Request};
use super::Transport;
use crate::error::NetworkError;

#[derive(Debug, Clone)]
pub enum Reply {
  Ok(u16, &'static str),
  Fail,
  /// Never completes
  Hang,
}

#[derive(Debug, Clone)]
pub struct Call {
  pub method: String,
  pub path: String,
  pub body: Option<Vec<u8>>,
}

impl Call {
  pub fn json(&self) -> serde_json::Value {
    self
      .body
      .as_deref()
      .and_then(|b| serde_json::from_slice(b).ok())
      .unwrap_or(serde_json::Value::Null)
  }
}

/// Replies are looked up by path: queued one-shot replies first, then the
/// sticky reply for the path, then the default (200 "ok").
#[derive(Default)]
pub struct MockTransport {
  offline: AtomicBool,
  queued: Mutex<HashMap<String, VecDeque<Reply>>>,
  sticky: Mutex<HashMap<String, Reply>>,
  calls: Mutex<Vec<Call>>,
}

impl MockTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn reply(&self, path: &str, reply: Reply) {
    self.sticky.lock().unwrap().insert(path.to_string(), reply);
  }

  pub fn reply_once(&self, path: &str, reply: Reply) {
    self
      .queued
      .lock()
      .unwrap()
      .entry(path.to_string())
      .or_default()
      .push_back(reply);
  }

  pub fn calls(&self) -> Vec<Call> {
    self.calls.lock().unwrap().clone()
  }

  pub fn calls_to(&self, path: &str) -> Vec<Call> {
    self
      .calls()
      .into_iter()
      .filter(|c| c.path == path)
      .collect()
  }
}

#[async_trait]
impl Transport for MockTransport {
  async fn send(&self, url: &Url, request: &Request) -> Result<NetResponse, NetworkError> {
    let path = url.path().to_string();
    self.calls.lock().unwrap().push(Call {
      method: request.method.clone(),
      path: path.clone(),
      body: request.body.clone(),
    });

    if self.offline.load(Ordering::SeqCst) {
      return Err(NetworkError::Connect("offline".to_string()));
    }

    let reply = {
      let queued = self
        .queued
        .lock()
        .unwrap()
        .get_mut(&path)
        .and_then(|q| q.pop_front());
      queued
        .or_else(|| self.sticky.lock().unwrap().get(&path).cloned())
        .unwrap_or(Reply::Ok(200, "ok"))
    };

    match reply {
      Reply::Ok(status, body) => Ok(NetResponse {
        status,
        content_type: Some("text/plain".to_string()),
        body: body.as_bytes().to_vec(),
      }),
      Reply::Fail => Err(NetworkError::Connect("connection refused".to_string())),
      Reply::Hang => std::future::pending().await,
    }
  }
}
