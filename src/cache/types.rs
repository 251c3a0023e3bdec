//! Core types for the cache store and resolution results.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use url::Url;
use uuid::Uuid;

/// A named partition of the cache store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CacheTier {
  /// Versioned assets, replaced only on upgrade
  Static,
  /// Last-known API data
  ApiData,
  /// Last-known emergency data, served when the network fails
  Fallback,
}

impl CacheTier {
  pub const ALL: [CacheTier; 3] = [CacheTier::Static, CacheTier::ApiData, CacheTier::Fallback];

  pub fn as_str(&self) -> &'static str {
    match self {
      CacheTier::Static => "static",
      CacheTier::ApiData => "api",
      CacheTier::Fallback => "fallback",
    }
  }

  /// Whether entries in this tier are scoped by agent version
  pub fn is_versioned(&self) -> bool {
    matches!(self, CacheTier::Static)
  }
}

impl fmt::Display for CacheTier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for CacheTier {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "static" => Ok(CacheTier::Static),
      "api" => Ok(CacheTier::ApiData),
      "fallback" => Ok(CacheTier::Fallback),
      other => Err(format!("unknown cache tier: {}", other)),
    }
  }
}

/// Coarse content-negotiation hint taken from the Accept header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationHint {
  Html,
  Json,
  Any,
}

impl NegotiationHint {
  pub fn from_accept(accept: Option<&str>) -> Self {
    match accept.map(|a| a.to_ascii_lowercase()) {
      Some(a) if a.contains("text/html") => NegotiationHint::Html,
      Some(a) if a.contains("application/json") => NegotiationHint::Json,
      _ => NegotiationHint::Any,
    }
  }

  fn as_str(&self) -> &'static str {
    match self {
      NegotiationHint::Html => "html",
      NegotiationHint::Json => "json",
      NegotiationHint::Any => "any",
    }
  }
}

/// Identity of a cacheable request: method, normalized URL and negotiation
/// hint. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
  method: String,
  url: String,
  hint: NegotiationHint,
}

impl RequestIdentity {
  pub fn new(method: &str, url: &Url, accept: Option<&str>) -> Self {
    Self {
      method: method.to_uppercase(),
      url: normalize_url(url),
      hint: NegotiationHint::from_accept(accept),
    }
  }

  /// Identity used when precaching an asset: pages (no extension, or
  /// `.html`) are keyed as navigations, everything else ignores negotiation.
  pub fn for_asset(url: &Url) -> Self {
    let file = url.path().rsplit('/').next().unwrap_or("");
    let is_page = match file.rsplit_once('.') {
      None => true,
      Some((_, ext)) => ext.eq_ignore_ascii_case("html") || ext.eq_ignore_ascii_case("htm"),
    };
    let accept = if is_page { Some("text/html") } else { None };
    Self::new("GET", url, accept)
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  pub fn hint(&self) -> NegotiationHint {
    self.hint
  }

  /// Stable storage key (hex SHA-256 of the identity parts)
  pub fn cache_key(&self) -> String {
    let input = format!("{} {} {}", self.method, self.url, self.hint.as_str());
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Drop the fragment and sort query pairs so equivalent URLs share a key.
fn normalize_url(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);

  let mut pairs: Vec<(String, String)> = url
    .query_pairs()
    .map(|(k, v)| (k.into_owned(), v.into_owned()))
    .collect();

  if pairs.is_empty() {
    url.set_query(None);
  } else {
    pairs.sort();
    url.query_pairs_mut().clear().extend_pairs(pairs);
  }

  url.to_string()
}

/// A stored response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: String,
  pub method: String,
  pub url: String,
  pub tier: CacheTier,
  /// Agent version for Static entries, empty otherwise
  pub version: String,
  pub status: u16,
  pub content_type: Option<String>,
  pub payload: Vec<u8>,
  pub stored_at: DateTime<Utc>,
  pub stale_after: Duration,
}

impl CacheEntry {
  pub fn new(
    identity: &RequestIdentity,
    tier: CacheTier,
    status: u16,
    content_type: Option<String>,
    payload: Vec<u8>,
    stale_after: Duration,
  ) -> Self {
    Self {
      key: identity.cache_key(),
      method: identity.method().to_string(),
      url: identity.url().to_string(),
      tier,
      version: String::new(),
      status,
      content_type,
      payload,
      stored_at: Utc::now(),
      stale_after,
    }
  }

  pub fn with_version(mut self, version: &str) -> Self {
    self.version = version.to_string();
    self
  }

  /// Whether the entry has outlived its staleness window
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now - self.stored_at > self.stale_after
  }
}

/// Where a response came from and how current it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Staleness {
  /// Fetched from the network just now
  Fresh,
  /// Served cache-first by policy (static assets)
  Cached { stored_at: DateTime<Utc> },
  /// Network failed; served from a previous successful fetch
  Stale {
    stored_at: DateTime<Utc>,
    expired: bool,
  },
  /// No network and nothing cached
  Unavailable,
  /// Mutation could not be sent and was queued for sync
  Queued { task_id: Uuid },
}

impl Staleness {
  pub fn is_stale(&self) -> bool {
    matches!(self, Staleness::Stale { .. })
  }

  pub fn is_unavailable(&self) -> bool {
    matches!(self, Staleness::Unavailable)
  }
}

/// The response handed back to the foreground layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
  pub staleness: Staleness,
}

impl Response {
  pub fn fresh(status: u16, content_type: Option<String>, body: Vec<u8>) -> Self {
    Self {
      status,
      content_type,
      body,
      staleness: Staleness::Fresh,
    }
  }

  pub fn from_entry(entry: CacheEntry, staleness: Staleness) -> Self {
    Self {
      status: entry.status,
      content_type: entry.content_type,
      body: entry.payload,
      staleness,
    }
  }

  pub fn json(status: u16, value: &serde_json::Value, staleness: Staleness) -> Self {
    Self {
      status,
      content_type: Some("application/json".to_string()),
      body: value.to_string().into_bytes(),
      staleness,
    }
  }

  pub fn body_text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}
