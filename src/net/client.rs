use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{header, Client, Method};
use tracing::debug;
use url::Url;

use super::types::{NetResponse, Request};
use super::Transport;
use crate::error::NetworkError;

/// Upper bound for any single request; per-class deadlines are shorter.
const CLIENT_TIMEOUT_SECS: u64 = 60;

/// HTTP transport backed by reqwest.
/// Clone is cheap - reqwest::Client shares its connection pool.
#[derive(Clone)]
pub struct HttpTransport {
  client: Client,
}

impl HttpTransport {
  pub fn new() -> Result<Self> {
    let client = Client::builder()
      .timeout(std::time::Duration::from_secs(CLIENT_TIMEOUT_SECS))
      .user_agent(concat!("careline/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, url: &Url, request: &Request) -> Result<NetResponse, NetworkError> {
    let method = Method::from_bytes(request.method.as_bytes())
      .map_err(|e| NetworkError::Request(format!("Invalid method {}: {}", request.method, e)))?;

    let mut builder = self.client.request(method, url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| NetworkError::from_reqwest(&e))?;

    let status = response.status().as_u16();
    let content_type = response
      .headers()
      .get(header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = response
      .bytes()
      .await
      .map_err(|e| NetworkError::from_reqwest(&e))?
      .to_vec();

    debug!(%url, method = %request.method, status, bytes = body.len(), "Network response");

    Ok(NetResponse {
      status,
      content_type,
      body,
    })
  }
}
