//! Typed errors that callers branch on.
//!
//! Storage and I/O failures travel as `color_eyre::Report`; the enums here
//! ride inside those reports where needed and are recovered with
//! `downcast_ref`.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Transient network failures. Always retryable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
  #[error("Request timed out after {0:?}")]
  Timeout(Duration),

  #[error("Connection failed: {0}")]
  Connect(String),

  #[error("Server responded with status {0}")]
  Status(u16),

  #[error("Request failed: {0}")]
  Request(String),
}

impl NetworkError {
  pub fn from_reqwest(err: &reqwest::Error) -> Self {
    if err.is_timeout() {
      NetworkError::Timeout(Duration::ZERO)
    } else if err.is_connect() {
      NetworkError::Connect(err.to_string())
    } else if let Some(status) = err.status() {
      NetworkError::Status(status.as_u16())
    } else {
      NetworkError::Request(err.to_string())
    }
  }
}

/// Errors raised by the sync task queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
  #[error("Sync queue is full ({limit} pending tasks)")]
  QueueFull { limit: usize },

  #[error("Sync task not found: {0}")]
  NotFound(Uuid),

  #[error("Sync task {0} has not failed")]
  NotFailed(Uuid),
}

/// Errors raised by version install and activation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
  #[error("Required asset {url} could not be fetched: {reason}")]
  AssetFetch { url: String, reason: String },

  #[error("No version is waiting to be activated")]
  NothingWaiting,

  #[error("Activating version {0} requires confirmation from the client")]
  ConsentRequired(String),

  #[error("Manifest for version {0} lists no assets")]
  EmptyManifest(String),
}
