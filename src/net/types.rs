use color_eyre::{eyre::eyre, Result};
use url::Url;

/// An outgoing request as issued by the foreground layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: String,
  /// Absolute, or relative to the backend base URL
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: &str, url: impl Into<String>) -> Self {
    Self {
      method: method.to_uppercase(),
      url: url.into(),
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(url: impl Into<String>) -> Self {
    Self::new("GET", url)
  }

  /// POST with a JSON body
  pub fn post_json(url: impl Into<String>, body: &serde_json::Value) -> Self {
    Self::new("POST", url)
      .with_header("content-type", "application/json")
      .with_body(body.to_string().into_bytes())
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_lowercase(), value.to_string()));
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = Some(body);
    self
  }

  /// Case-insensitive header lookup
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn accept(&self) -> Option<&str> {
    self.header("accept")
  }

  /// Anything other than GET/HEAD/OPTIONS changes server state
  pub fn is_mutating(&self) -> bool {
    !matches!(self.method.as_str(), "GET" | "HEAD" | "OPTIONS")
  }

  /// Resolve the request URL against the backend base URL.
  pub fn resolve(&self, base: &Url) -> Result<Url> {
    base
      .join(&self.url)
      .map_err(|e| eyre!("Invalid request URL '{}': {}", self.url, e))
  }
}

/// A response received from the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetResponse {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
}

impl NetResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn is_server_error(&self) -> bool {
    self.status >= 500
  }
}
