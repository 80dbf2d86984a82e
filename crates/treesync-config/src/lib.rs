//! Configuration management for treesync
//!
//! The server reads one configuration file describing the applications it
//! publishes, the hot cache bounds and the change-watch debounce window. The
//! client keeps its last-used host, application and ignore list in a small
//! `.autoupdate` JSON file next to the synced tree.
//!
//! # Examples
//!
//! ```rust,no_run
//! use treesync_config::ConfigLoader;
//!
//! let config = ConfigLoader::load_from_file("treesync.yaml")
//!     .expect("Failed to load configuration");
//!
//! for (name, app) in &config.apps {
//!     println!("{} -> {}", name, app.dir.display());
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use treesync_types::TransferMode;

pub mod builder;
pub mod error;
pub mod loader;

pub use builder::ConfigBuilder;
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;

/// Name of the client state file kept in the synced directory
pub const CLIENT_STATE_FILE: &str = ".autoupdate";

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to
    pub listen: String,
    /// Directory where built patch archives are persisted
    pub cache_dir: PathBuf,
    /// Hot cache bounds
    pub cache: CacheSettings,
    /// Change-watch settings
    pub watch: WatchSettings,
    /// Published applications keyed by name
    pub apps: BTreeMap<String, AppConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            cache_dir: PathBuf::from("cache"),
            cache: CacheSettings::default(),
            watch: WatchSettings::default(),
            apps: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    /// Look up an application by name
    pub fn app(&self, name: &str) -> Option<&AppConfig> {
        self.apps.get(name)
    }

    /// Make the cache directory and every app directory absolute against `base`
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.cache_dir.is_relative() {
            self.cache_dir = base.join(&self.cache_dir);
        }
        for app in self.apps.values_mut() {
            if app.dir.is_relative() {
                app.dir = base.join(&app.dir);
            }
        }
    }
}

/// Hot cache bounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Maximum number of cached items, 0 for unbounded
    pub items_limit: usize,
    /// Minimum time between two eviction sweeps, in seconds
    pub sweep_period_secs: u64,
    /// Lifetime of cached files and archives since their last visit, in seconds
    pub ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            items_limit: 100,
            sweep_period_secs: 10 * 60,
            ttl_secs: 24 * 60 * 60,
        }
    }
}

impl CacheSettings {
    /// Sweep period as a duration
    pub fn sweep_period(&self) -> Duration {
        Duration::from_secs(self.sweep_period_secs)
    }

    /// Item lifetime as a duration
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Filesystem change-watch settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSettings {
    /// Whether app directories are watched for cache invalidation
    pub enabled: bool,
    /// Quiet period before a burst of writes to one path is delivered, in milliseconds
    pub minimal_pass_ms: u64,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            minimal_pass_ms: 500,
        }
    }
}

impl WatchSettings {
    /// Debounce window as a duration
    pub fn minimal_pass(&self) -> Duration {
        Duration::from_millis(self.minimal_pass_ms)
    }
}

/// One published application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Root of the authoritative tree
    pub dir: PathBuf,
    /// Glob patterns of server files never offered to clients
    #[serde(default)]
    pub ignore: Vec<String>,
}

impl AppConfig {
    /// Create an app rooted at `dir`
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            ignore: Vec::new(),
        }
    }
}

/// Resolved settings for one client run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server `host:port`, optionally with an `http://` scheme
    pub host: String,
    /// Application name on the server
    pub app: String,
    /// Local directory being kept up to date
    pub dir: PathBuf,
    /// Glob patterns of local files never reported or overwritten
    pub ignore: Vec<String>,
    /// How changed content is downloaded
    pub transfer: TransferMode,
    /// Only report whether an update exists
    pub check_only: bool,
    /// Timeout for each HTTP request
    pub request_timeout: Duration,
}

impl ClientConfig {
    /// Create a client configuration with default options
    pub fn new<P: AsRef<Path>>(host: impl Into<String>, app: impl Into<String>, dir: P) -> Self {
        Self {
            host: host.into(),
            app: app.into(),
            dir: dir.as_ref().to_path_buf(),
            ignore: Vec::new(),
            transfer: TransferMode::Archive,
            check_only: false,
            request_timeout: Duration::from_secs(300),
        }
    }

    /// Fill fields left empty from a saved state file
    pub fn merge_state(mut self, state: &ClientState) -> Self {
        if self.host.is_empty() {
            self.host.clone_from(&state.sync_host);
        }
        if self.app.is_empty() {
            self.app.clone_from(&state.sync_app);
        }
        if self.ignore.is_empty() {
            self.ignore.clone_from(&state.ignore);
        }
        self
    }

    /// Ignore patterns including the client's own bookkeeping files
    pub fn effective_ignore(&self) -> Vec<String> {
        let mut patterns = self.ignore.clone();
        for builtin in [CLIENT_STATE_FILE, "*.autoupdatetmpfile", "**/*.autoupdatetmpfile"] {
            if !patterns.iter().any(|p| p == builtin) {
                patterns.push(builtin.to_string());
            }
        }
        patterns
    }

    /// Check that a run has everything it needs
    pub fn validate(&self) -> ConfigResult<()> {
        if self.host.is_empty() {
            return Err(ConfigError::missing_required("host"));
        }
        if self.app.is_empty() {
            return Err(ConfigError::missing_required("app"));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::validation("Request timeout must be non-zero"));
        }
        Ok(())
    }

    /// State worth remembering for the next run
    pub fn to_state(&self) -> ClientState {
        ClientState {
            sync_host: self.host.clone(),
            sync_app: self.app.clone(),
            ignore: self.ignore.clone(),
        }
    }
}

/// Contents of the `.autoupdate` state file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ClientState {
    /// Last server used
    pub sync_host: String,
    /// Last application synced
    pub sync_app: String,
    /// Ignore patterns in effect
    pub ignore: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen, "127.0.0.1:8080");
        assert_eq!(config.cache.items_limit, 100);
        assert_eq!(config.cache.ttl(), Duration::from_secs(86_400));
        assert_eq!(config.cache.sweep_period(), Duration::from_secs(600));
        assert_eq!(config.watch.minimal_pass(), Duration::from_millis(500));
        assert!(config.apps.is_empty());
    }

    #[test]
    fn test_resolve_paths_only_touches_relative_dirs() {
        let mut config = ServerConfig::default();
        config.apps.insert("rel".to_string(), AppConfig::new("apps/rel"));
        let absolute = std::env::temp_dir().join("abs");
        config.apps.insert("abs".to_string(), AppConfig::new(&absolute));

        let base = std::env::temp_dir().join("base");
        config.resolve_paths(&base);

        assert_eq!(config.cache_dir, base.join("cache"));
        assert_eq!(config.app("rel").unwrap().dir, base.join("apps/rel"));
        assert_eq!(config.app("abs").unwrap().dir, absolute);
    }

    #[test]
    fn test_client_merge_state_prefers_explicit_values() {
        let state = ClientState {
            sync_host: "saved:8080".to_string(),
            sync_app: "saved-app".to_string(),
            ignore: vec!["logs/*.log".to_string()],
        };

        let merged = ClientConfig::new("", "game", ".").merge_state(&state);
        assert_eq!(merged.host, "saved:8080");
        assert_eq!(merged.app, "game");
        assert_eq!(merged.ignore, vec!["logs/*.log".to_string()]);
        assert!(merged.validate().is_ok());
    }

    #[test]
    fn test_client_validate_requires_host() {
        let config = ClientConfig::new("", "game", ".");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("host"));
    }

    #[test]
    fn test_effective_ignore_adds_bookkeeping_files_once() {
        let mut config = ClientConfig::new("h", "a", ".");
        config.ignore = vec![CLIENT_STATE_FILE.to_string()];

        let patterns = config.effective_ignore();
        assert_eq!(patterns.iter().filter(|p| *p == CLIENT_STATE_FILE).count(), 1);
        assert!(patterns.iter().any(|p| p == "*.autoupdatetmpfile"));
    }

    #[test]
    fn test_client_state_wire_names() {
        let state = ClientState {
            sync_host: "h:1".to_string(),
            sync_app: "a".to_string(),
            ignore: vec![],
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"SyncHost\""));
        assert!(json.contains("\"SyncApp\""));
        assert!(json.contains("\"Ignore\""));
    }
}
