//! Configuration loader utilities

use crate::{ClientState, ConfigBuilder, ConfigError, ConfigResult, ServerConfig};
use std::path::Path;

/// Environment prefix for server configuration overrides, e.g. `TREESYNC__LISTEN`
pub const ENV_PREFIX: &str = "TREESYNC";

/// Configuration loader with common loading patterns
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load server configuration from a specific file
    ///
    /// Relative directories in the file are resolved against the file's own
    /// directory, so a config can be moved together with its app trees.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> ConfigResult<ServerConfig> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "Configuration file not found"),
            ));
        }

        let mut config = ConfigBuilder::new()
            .add_source_file(path)
            .add_env_prefix(ENV_PREFIX)
            .build()?;

        let base = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map_or_else(|| Path::new(".").to_path_buf(), Path::to_path_buf);
        config.resolve_paths(&base);

        Ok(config)
    }

    /// Save server configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(config: &ServerConfig, path: P) -> ConfigResult<()> {
        let path = path.as_ref();

        let content = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::to_string_pretty(config)?,
            Some("json") => serde_json::to_string_pretty(config)?,
            _ => serde_yaml::to_string(config)?,
        };

        std::fs::write(path, content).map_err(|e| ConfigError::io(path, e))
    }

    /// Generate a default server configuration file
    pub fn generate_default_config<P: AsRef<Path>>(path: P) -> ConfigResult<()> {
        Self::save_to_file(&ServerConfig::default(), path)
    }

    /// Load the client state file, `None` when it does not exist yet
    pub fn load_client_state<P: AsRef<Path>>(path: P) -> ConfigResult<Option<ClientState>> {
        let path = path.as_ref();
        let content = match std::fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ConfigError::io(path, e)),
        };

        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
    }

    /// Write the client state file
    pub fn save_client_state<P: AsRef<Path>>(state: &ClientState, path: P) -> ConfigResult<()> {
        let path = path.as_ref();
        let content = serde_json::to_vec_pretty(state)?;
        std::fs::write(path, content).map_err(|e| ConfigError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AppConfig, CLIENT_STATE_FILE};
    use rstest::rstest;
    use tempfile::TempDir;

    #[rstest]
    #[case("server.yaml")]
    #[case("server.toml")]
    #[case("server.json")]
    fn test_save_and_load(#[case] name: &str) {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join(name);

        let mut original = ServerConfig::default();
        original.cache.items_limit = 42;
        original
            .apps
            .insert("game".to_string(), AppConfig::new("trees/game"));
        ConfigLoader::save_to_file(&original, &config_path).unwrap();

        let loaded = ConfigLoader::load_from_file(&config_path).unwrap();
        assert_eq!(loaded.cache.items_limit, 42);
        assert_eq!(
            loaded.app("game").unwrap().dir,
            temp_dir.path().join("trees/game")
        );
        assert_eq!(loaded.cache_dir, temp_dir.path().join("cache"));
    }

    #[test]
    fn test_load_missing_file() {
        let result = ConfigLoader::load_from_file("/nonexistent/treesync.yaml");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_generate_default_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("default.yaml");

        ConfigLoader::generate_default_config(&config_path).unwrap();
        assert!(config_path.exists());

        let config = ConfigLoader::load_from_file(&config_path).unwrap();
        assert_eq!(config.watch.minimal_pass_ms, 500);
    }

    #[test]
    fn test_client_state_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CLIENT_STATE_FILE);

        assert_eq!(ConfigLoader::load_client_state(&path).unwrap(), None);

        let state = ClientState {
            sync_host: "updates.local:8080".to_string(),
            sync_app: "game".to_string(),
            ignore: vec!["logs/*.log".to_string()],
        };
        ConfigLoader::save_client_state(&state, &path).unwrap();

        assert_eq!(ConfigLoader::load_client_state(&path).unwrap(), Some(state));
    }

    #[test]
    fn test_client_state_parse_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CLIENT_STATE_FILE);
        std::fs::write(&path, b"{not json").unwrap();

        let result = ConfigLoader::load_client_state(&path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }
}
