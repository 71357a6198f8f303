use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::db::Database;
use crate::queue::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub replay: ReplayConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub base_url: Url,
  /// Path prefix of the API namespace; mutations are only queued under it
  #[serde(default = "default_api_prefix")]
  pub prefix: String,
  /// GET prefixes whose responses may be served stale while offline
  #[serde(default)]
  pub cacheable_prefixes: Vec<String>,
  /// Probed to decide whether the network is reachable
  #[serde(default = "default_health_path")]
  pub health_path: String,
}

fn default_api_prefix() -> String {
  "/api/".to_string()
}

fn default_health_path() -> String {
  "/api/health".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub enabled: bool,
  pub shell_version: String,
  pub api_version: String,
  /// Served for any uncached static request while offline
  pub shell_document: String,
  /// Fetched into the shell cache on startup
  pub shell_assets: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      shell_version: "v1".to_string(),
      api_version: "v1".to_string(),
      shell_document: "/index.html".to_string(),
      shell_assets: vec!["/".to_string(), "/index.html".to_string()],
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueConfig {
  /// Database file (default: $XDG_DATA_HOME/pacer/offline.db)
  pub path: Option<PathBuf>,
}

impl QueueConfig {
  pub fn resolve_path(&self) -> Result<PathBuf> {
    match &self.path {
      Some(p) => Ok(p.clone()),
      None => Database::default_path(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
  #[serde(flatten)]
  pub policy: RetryPolicy,
  /// How often the background worker retries a non-empty queue while online
  pub retry_interval_ms: u64,
}

impl Default for ReplayConfig {
  fn default() -> Self {
    Self {
      policy: RetryPolicy::default(),
      retry_interval_ms: 30_000,
    }
  }
}

impl ReplayConfig {
  pub fn retry_interval(&self) -> Duration {
    Duration::from_millis(self.retry_interval_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  pub probe_interval_ms: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_interval_ms: 5_000,
    }
  }
}

impl ConnectivityConfig {
  pub fn probe_interval(&self) -> Duration {
    Duration::from_millis(self.probe_interval_ms)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./pacer.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/pacer/config.yaml
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
        "No configuration file found. Create one at ~/.config/pacer/config.yaml\n\
                 with at least `api: {{ base_url: https://... }}`."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("pacer.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("pacer").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Get the API token from the environment, if one is set.
  ///
  /// Checks PACER_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("PACER_API_TOKEN").ok().filter(|t| !t.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("api:\n  base_url: https://pacer.example/\n").unwrap();
    assert_eq!(config.api.prefix, "/api/");
    assert_eq!(config.api.health_path, "/api/health");
    assert!(config.api.cacheable_prefixes.is_empty());
    assert!(config.cache.enabled);
    assert_eq!(config.cache.shell_document, "/index.html");
    assert_eq!(config.replay.policy, RetryPolicy::default());
    assert_eq!(config.replay.retry_interval(), Duration::from_secs(30));
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
api:
  base_url: https://pacer.example/
  cacheable_prefixes: ["/api/user", "/api/plans/"]
cache:
  shell_version: v7
  api_version: v3
  shell_assets: ["/index.html", "/app.js"]
queue:
  path: /tmp/pacer-test.db
replay:
  max_attempts: 5
  base_delay_ms: 1000
  retry_interval_ms: 2000
connectivity:
  probe_interval_ms: 750
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.api.cacheable_prefixes.len(), 2);
    assert_eq!(config.cache.shell_version, "v7");
    assert_eq!(config.cache.shell_document, "/index.html");
    assert_eq!(
      config.queue.resolve_path().unwrap(),
      PathBuf::from("/tmp/pacer-test.db")
    );
    assert_eq!(config.replay.policy.max_attempts, 5);
    assert_eq!(config.replay.policy.base_delay, Duration::from_secs(1));
    assert_eq!(config.replay.policy.max_delay, RetryPolicy::default().max_delay);
    assert_eq!(config.replay.retry_interval_ms, 2000);
    assert_eq!(config.connectivity.probe_interval(), Duration::from_millis(750));
  }

  #[test]
  fn test_missing_api_section_is_an_error() {
    assert!(Config::parse("cache:\n  enabled: false\n").is_err());
  }
}
