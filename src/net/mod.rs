//! Network boundary to the care backend.
//!
//! The `Transport` trait is the seam every component fetches through, so the
//! agent can run against the real HTTP client or a scripted one in tests.

mod client;
#[cfg(test)]
pub(crate) mod mock;
mod types;

pub use client::HttpTransport;
pub use types::{NetResponse, Request};

use async_trait::async_trait;
use std::time::Duration;
use url::Url;

use crate::error::NetworkError;

#[async_trait]
pub trait Transport: Send + Sync {
  /// Send `request` to the already-resolved `url`.
  async fn send(&self, url: &Url, request: &Request) -> Result<NetResponse, NetworkError>;
}

/// Send with a deadline. A timed-out attempt is abandoned, not awaited.
pub async fn send_with_timeout(
  transport: &dyn Transport,
  url: &Url,
  request: &Request,
  timeout: Duration,
) -> Result<NetResponse, NetworkError> {
  match tokio::time::timeout(timeout, transport.send(url, request)).await {
    Ok(result) => result,
    Err(_) => Err(NetworkError::Timeout(timeout)),
  }
}
