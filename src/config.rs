use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin that requests are forwarded to
  pub upstream: Url,
  #[serde(default = "default_listen")]
  pub listen: SocketAddr,
  /// Public base URL pages use (defaults to http://{listen}/)
  pub scope: Option<Url>,
  #[serde(default = "default_control_prefix")]
  pub control_prefix: String,
  #[serde(default = "default_max_body_bytes")]
  pub max_body_bytes: usize,
  #[serde(default = "default_request_timeout_secs")]
  pub request_timeout_secs: u64,
  #[serde(default)]
  pub worker: WorkerConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

fn default_listen() -> SocketAddr {
  SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_control_prefix() -> String {
  "/__sw".to_string()
}

fn default_max_body_bytes() -> usize {
  10 * 1024 * 1024
}

fn default_request_timeout_secs() -> u64 {
  30
}

/// Caching policy of the worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  /// Prefix shared by every cache this application owns
  pub cache_prefix: String,
  /// Release identifier embedded in cache names
  pub version: String,
  pub api_prefix: String,
  /// API path prefixes whose responses may be served from the dynamic cache
  pub api_cache_patterns: Vec<String>,
  pub static_prefixes: Vec<String>,
  /// File extensions treated as static assets (case-insensitive)
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub static_extensions: BTreeSet<String>,
  /// URL schemes that are never intercepted
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub ignored_schemes: BTreeSet<String>,
  /// Paths fetched into the static cache on install
  pub precache: Vec<String>,
  pub offline_page: String,
  /// Fail the install if any precache entry cannot be stored
  pub strict_install: bool,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      cache_prefix: "rental-manager".to_string(),
      version: "1.0.0".to_string(),
      api_prefix: "/api/".to_string(),
      api_cache_patterns: [
        "/api/v1/properties",
        "/api/v1/rooms",
        "/api/v1/renters",
        "/api/v1/contracts",
        "/api/v1/services",
        "/api/v1/dashboard",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      static_prefixes: vec!["/static/".to_string(), "/icons/".to_string()],
      static_extensions: ["js", "css", "png", "jpg", "svg", "woff", "woff2"]
        .into_iter()
        .map(String::from)
        .collect(),
      ignored_schemes: ["chrome-extension", "moz-extension", "safari-web-extension"]
        .into_iter()
        .map(String::from)
        .collect(),
      precache: [
        "/",
        "/static/js/bundle.js",
        "/static/css/main.css",
        "/manifest.json",
        "/icons/icon-192x192.png",
        "/icons/icon-512x512.png",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      offline_page: "/offline.html".to_string(),
      strict_install: false,
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

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
  /// Caches and the offline queue live in an SQLite file and survive restarts
  #[default]
  Sqlite,
  /// Everything is lost when the process exits
  Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  pub backend: StorageBackend,
  /// Database file (defaults to $XDG_DATA_HOME/pwa-gate/cache.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Queue mutating requests that fail while offline
  pub enabled: bool,
  /// Replay attempts before an action is dropped
  pub max_attempts: u32,
  /// Seconds between connectivity probes, 0 disables probing
  pub probe_interval_secs: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      max_attempts: 5,
      probe_interval_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter directive, overridden by RUST_LOG
  pub level: String,
  /// Also write logs to this file
  pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./pwa-gate.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/pwa-gate/config.yaml
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/pwa-gate/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("pwa-gate.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("pwa-gate").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  /// Parse and validate configuration from YAML text.
  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.worker.cache_prefix.is_empty() {
      return Err(eyre!("worker.cache_prefix must not be empty"));
    }
    if self.worker.version.is_empty() {
      return Err(eyre!("worker.version must not be empty"));
    }
    if !self.control_prefix.starts_with('/') || self.control_prefix.len() < 2 {
      return Err(eyre!(
        "control_prefix must be a non-root path, got {:?}",
        self.control_prefix
      ));
    }
    Ok(())
  }

  /// Public base URL that intercepted request paths are resolved against.
  pub fn scope(&self) -> Result<Url> {
    match &self.scope {
      Some(scope) => Ok(scope.clone()),
      None => Url::parse(&format!("http://{}/", self.listen))
        .map_err(|e| eyre!("Failed to derive scope from listen address: {}", e)),
    }
  }

  /// Location of the SQLite database.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.storage.path {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("pwa-gate").join("cache.db"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("upstream: http://localhost:3000\n").unwrap();
    assert_eq!(config.listen, default_listen());
    assert_eq!(config.control_prefix, "/__sw");
    assert_eq!(config.worker.cache_prefix, "rental-manager");
    assert!(config.worker.static_extensions.contains("woff2"));
    assert_eq!(config.storage.backend, StorageBackend::Sqlite);
    assert!(config.queue.enabled);
    assert_eq!(
      config.scope().unwrap().as_str(),
      "http://127.0.0.1:8080/"
    );
  }

  #[test]
  fn test_extensions_are_normalized() {
    let yaml = r#"
upstream: http://localhost:3000
worker:
  static_extensions: [".JS", "Css"]
  ignored_schemes: ["Chrome-Extension"]
"#;
    let config = Config::parse(yaml).unwrap();
    assert!(config.worker.static_extensions.contains("js"));
    assert!(config.worker.static_extensions.contains("css"));
    assert!(config.worker.ignored_schemes.contains("chrome-extension"));
    // Unspecified fields keep their defaults
    assert_eq!(config.worker.api_prefix, "/api/");
  }

  #[test]
  fn test_storage_and_queue_sections() {
    let yaml = r#"
upstream: http://localhost:3000
scope: https://rentals.example.com/
storage:
  backend: memory
queue:
  enabled: false
  probe_interval_secs: 0
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.storage.backend, StorageBackend::Memory);
    assert!(!config.queue.enabled);
    assert_eq!(config.queue.max_attempts, 5);
    assert_eq!(
      config.scope().unwrap().as_str(),
      "https://rentals.example.com/"
    );
  }

  #[test]
  fn test_rejects_root_control_prefix() {
    let yaml = "upstream: http://localhost:3000\ncontrol_prefix: /\n";
    assert!(Config::parse(yaml).is_err());
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/nonexistent/pwa-gate.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_example_config_parses() {
    let config = Config::parse(include_str!("../config.example.yaml")).unwrap();
    assert_eq!(config.upstream.as_str(), "http://localhost:3000/");
    assert_eq!(config.worker.precache.len(), 6);
    assert_eq!(config.queue.max_attempts, 5);
  }
}
