//! Request classification.
//!
//! Rules are checked in priority order: emergency allowlist, API prefix,
//! static asset extension, page navigation, then the ApiData default.
//! Emergency paths must win even when they also sit under the API prefix.

use std::collections::BTreeSet;
use std::fmt;
use url::Url;

use crate::cache::NegotiationHint;
use crate::config::ClassifierConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestClass {
  Emergency,
  ApiData,
  StaticAsset,
  Navigation,
}

impl fmt::Display for RequestClass {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      RequestClass::Emergency => "emergency",
      RequestClass::ApiData => "api-data",
      RequestClass::StaticAsset => "static-asset",
      RequestClass::Navigation => "navigation",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone)]
pub struct Classifier {
  emergency_paths: Vec<String>,
  api_prefix: String,
  static_extensions: BTreeSet<String>,
}

impl Classifier {
  pub fn new(config: &ClassifierConfig) -> Self {
    Self {
      emergency_paths: config
        .emergency_paths
        .iter()
        .map(|p| p.trim_end_matches('/').to_string())
        .filter(|p| !p.is_empty())
        .collect(),
      api_prefix: config.api_prefix.clone(),
      static_extensions: config.static_extensions.clone(),
    }
  }

  pub fn classify(&self, url: &Url, accept: Option<&str>) -> RequestClass {
    let path = url.path();

    if self.is_emergency(path) {
      return RequestClass::Emergency;
    }

    if !self.api_prefix.is_empty() && path.starts_with(&self.api_prefix) {
      return RequestClass::ApiData;
    }

    if self.is_static_asset(path) {
      return RequestClass::StaticAsset;
    }

    if NegotiationHint::from_accept(accept) == NegotiationHint::Html {
      return RequestClass::Navigation;
    }

    RequestClass::ApiData
  }

  /// Prefix match on whole path segments: `/api/emergency` matches
  /// `/api/emergency/alert` but not `/api/emergency-drill`.
  fn is_emergency(&self, path: &str) -> bool {
    self.emergency_paths.iter().any(|prefix| {
      path == prefix
        || path
          .strip_prefix(prefix.as_str())
          .is_some_and(|rest| rest.starts_with('/'))
    })
  }

  fn is_static_asset(&self, path: &str) -> bool {
    let file = path.rsplit('/').next().unwrap_or("");
    match file.rsplit_once('.') {
      Some((stem, ext)) if !stem.is_empty() => {
        self.static_extensions.contains(&ext.to_ascii_lowercase())
      }
      _ => false,
    }
  }
}
