use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Base URL of the resource API; GETs below it are cached as resource data
  pub api_base_url: Url,
  /// Scopes the store file name
  #[serde(default = "default_namespace")]
  pub namespace: String,
  /// Bumping this discards the static asset cache on the next install
  #[serde(default = "default_cache_version")]
  pub cache_version: String,
  #[serde(default = "default_network_timeout_ms")]
  pub network_timeout_ms: u64,
  /// How long a cached resource read is served without asking the network
  #[serde(default = "default_cache_ttl_secs")]
  pub cache_ttl_secs: u64,
  /// Failed replays allowed before a mutation is dead-lettered
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  /// Document served for navigations when nothing better is cached
  pub app_shell: Option<Url>,
  /// URLs fetched into the static cache on install
  #[serde(default)]
  pub precache: Vec<Url>,
  /// URL schemes that always go straight to the network
  #[serde(default = "default_bypass_schemes")]
  pub bypass_schemes: Vec<String>,
  /// Request headers that take part in the resource read cache key
  #[serde(default = "default_relevant_headers")]
  pub relevant_headers: Vec<String>,
  /// Extra families to invalidate when a family is mutated
  #[serde(default)]
  pub related_families: BTreeMap<String, Vec<String>>,
  /// Probed to decide whether we are online
  pub health_url: Option<Url>,
  #[serde(default = "default_probe_interval_secs")]
  pub probe_interval_secs: u64,
  /// Periodic drain cadence; 0 disables periodic drains
  #[serde(default)]
  pub sync_interval_secs: u64,
  /// Initial connectivity assumption before the first probe
  #[serde(default = "default_true")]
  pub assume_online: bool,
  pub db_path: Option<PathBuf>,
}

fn default_namespace() -> String {
  "offsync".to_string()
}

fn default_cache_version() -> String {
  "1".to_string()
}

fn default_network_timeout_ms() -> u64 {
  5_000
}

fn default_cache_ttl_secs() -> u64 {
  300
}

fn default_max_retries() -> u32 {
  3
}

fn default_bypass_schemes() -> Vec<String> {
  ["chrome-extension", "moz-extension", "safari-web-extension"]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_relevant_headers() -> Vec<String> {
  vec!["accept".to_string(), "range".to_string()]
}

fn default_probe_interval_secs() -> u64 {
  15
}

fn default_true() -> bool {
  true
}

impl Config {
  /// Configuration with defaults for everything but the API base.
  pub fn new(api_base_url: Url) -> Self {
    Self {
      api_base_url,
      namespace: default_namespace(),
      cache_version: default_cache_version(),
      network_timeout_ms: default_network_timeout_ms(),
      cache_ttl_secs: default_cache_ttl_secs(),
      max_retries: default_max_retries(),
      app_shell: None,
      precache: Vec::new(),
      bypass_schemes: default_bypass_schemes(),
      relevant_headers: default_relevant_headers(),
      related_families: BTreeMap::new(),
      health_url: None,
      probe_interval_secs: default_probe_interval_secs(),
      sync_interval_secs: 0,
      assume_online: true,
      db_path: None,
    }
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/offsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("offsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offsync").join("config.yaml");
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
    if config.max_retries == 0 {
      return Err(eyre!("max_retries must be at least 1"));
    }
    if !config.assume_online && config.health_url.is_none() {
      // Nothing would ever report the network as back
      return Err(eyre!("assume_online: false requires a health_url"));
    }
    Ok(config)
  }

  /// Get the resource API token from the environment, if any.
  pub fn api_token() -> Option<String> {
    std::env::var("OFFSYNC_API_TOKEN").ok()
  }

  pub fn network_timeout(&self) -> Duration {
    Duration::from_millis(self.network_timeout_ms)
  }

  pub fn cache_ttl(&self) -> Duration {
    Duration::from_secs(self.cache_ttl_secs)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }

  pub fn sync_interval(&self) -> Option<Duration> {
    (self.sync_interval_secs > 0).then(|| Duration::from_secs(self.sync_interval_secs))
  }

  /// Name of the static asset partition for the current cache version.
  pub fn static_partition(&self) -> String {
    format!("{}{}", STATIC_PARTITION_PREFIX, self.cache_version)
  }

  /// Store file location; defaults to the user data directory.
  pub fn db_path(&self) -> Result<PathBuf> {
    if let Some(p) = &self.db_path {
      return Ok(p.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(
      data_dir
        .join("offsync")
        .join(format!("{}.db", self.namespace)),
    )
  }
}

pub const STATIC_PARTITION_PREFIX: &str = "cache-static-";
