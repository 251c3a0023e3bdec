use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub backend: BackendConfig,
  pub storage: StorageConfig,
  pub classifier: ClassifierConfig,
  pub timeouts: TimeoutConfig,
  pub cache: CachePolicyConfig,
  pub sync: SyncConfig,
  pub notifications: NotificationConfig,
  /// Last-known contacts served by the offline emergency response
  pub emergency_contacts: Vec<EmergencyContact>,
  pub install: InstallConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
  pub base_url: String,
  /// Endpoint for `triggerEmergency` sends
  pub emergency_trigger_path: String,
}

impl Default for BackendConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:8080".to_string(),
      emergency_trigger_path: "/api/emergency/trigger".to_string(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Database path (defaults to $XDG_DATA_HOME/careline/careline.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
  /// Path prefixes treated as emergency actions
  pub emergency_paths: Vec<String>,
  pub api_prefix: String,
  /// File extensions served cache-first (case-insensitive)
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub static_extensions: BTreeSet<String>,
}

impl Default for ClassifierConfig {
  fn default() -> Self {
    let static_extensions = [
      "css", "js", "mjs", "map", "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "woff",
      "woff2", "ttf", "otf", "eot",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    Self {
      emergency_paths: vec!["/api/emergency".to_string(), "/emergency".to_string()],
      api_prefix: "/api/".to_string(),
      static_extensions,
    }
  }
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|s| s.trim_start_matches('.').to_lowercase())
      .collect(),
  )
}

/// Network timeouts per request class, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
  pub emergency_ms: u64,
  pub api_ms: u64,
  pub navigation_ms: u64,
  pub static_ms: u64,
  pub sync_ms: u64,
}

impl Default for TimeoutConfig {
  fn default() -> Self {
    Self {
      emergency_ms: 3_000,
      api_ms: 8_000,
      navigation_ms: 10_000,
      static_ms: 15_000,
      sync_ms: 10_000,
    }
  }
}

impl TimeoutConfig {
  pub fn emergency(&self) -> Duration {
    Duration::from_millis(self.emergency_ms)
  }

  pub fn api(&self) -> Duration {
    Duration::from_millis(self.api_ms)
  }

  pub fn navigation(&self) -> Duration {
    Duration::from_millis(self.navigation_ms)
  }

  pub fn static_asset(&self) -> Duration {
    Duration::from_millis(self.static_ms)
  }

  pub fn sync(&self) -> Duration {
    Duration::from_millis(self.sync_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CachePolicyConfig {
  pub api_stale_after_secs: i64,
  pub fallback_stale_after_secs: i64,
  /// Cached page returned for navigations while offline
  pub shell_url: String,
  /// Page returned when no shell is cached
  pub offline_url: String,
}

impl Default for CachePolicyConfig {
  fn default() -> Self {
    Self {
      api_stale_after_secs: 60 * 60,
      fallback_stale_after_secs: 24 * 60 * 60,
      shell_url: "/".to_string(),
      offline_url: "/offline.html".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub max_attempts: u32,
  pub backoff_base_ms: u64,
  pub backoff_max_ms: u64,
  /// Cap on pending tasks; emergency triggers are always admitted
  pub max_pending: usize,
  /// Collapse identical pending health updates into one task
  pub dedup_health_updates: bool,
  /// Periodic drain interval while the agent runs
  pub drain_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      backoff_base_ms: 2_000,
      backoff_max_ms: 5 * 60 * 1_000,
      max_pending: 500,
      dedup_health_updates: true,
      drain_interval_secs: 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub app_name: String,
  /// Window after an audible normal notification during which further normal
  /// notifications are shown silently
  pub throttle_secs: i64,
  pub emergency_vibration: Vec<u32>,
  pub normal_vibration: Vec<u32>,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      app_name: "Careline".to_string(),
      throttle_secs: 30,
      emergency_vibration: vec![200, 100, 200, 100, 400, 100, 800],
      normal_vibration: vec![100],
    }
  }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, PartialEq, Eq)]
pub struct EmergencyContact {
  pub name: String,
  pub phone: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
  /// Asset manifest (JSON) for the current agent version
  pub manifest: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./careline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/careline/config.yaml
  ///
  /// Falls back to built-in defaults when no file exists.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Ok(url) = std::env::var("CARELINE_BACKEND_URL") {
      config.backend.base_url = url;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("careline.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("careline").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Directory for the database and log files.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("careline"))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(p) => Ok(p.clone()),
      None => Ok(Self::data_dir()?.join("careline.db")),
    }
  }
}
