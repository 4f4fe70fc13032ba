//! Configuration loader.
//!
//! Loads configuration from:
//! 1. Default values
//! 2. `medley.yaml` in the working directory
//! 3. `~/.medley/config.yaml` in the home directory
//! 4. Environment variables with `MEDLEY_` prefix

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// HTTP server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7878
}

/// SQLite database location
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> PathBuf {
    data_dir().join("medley.db")
}

/// Plugin subsystem configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PluginsConfig {
    /// Master switch; when off, no plugin processes are started at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_plugins_dir")]
    pub dir: PathBuf,
    /// Budget in seconds for the handshake and each load-time call. A hung
    /// plugin executable costs at most this much per call, not forever.
    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: u64,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_plugins_dir(),
            load_timeout_secs: default_load_timeout_secs(),
        }
    }
}

impl PluginsConfig {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_plugins_dir() -> PathBuf {
    data_dir().join("plugins")
}

fn default_load_timeout_secs() -> u64 {
    10
}

/// Search aggregation configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    /// Per-indexer budget in seconds; one slow plugin cannot hold the whole
    /// aggregate past this.
    #[serde(default = "default_plugin_timeout_secs")]
    pub plugin_timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            plugin_timeout_secs: default_plugin_timeout_secs(),
        }
    }
}

impl SearchConfig {
    pub fn plugin_timeout(&self) -> Duration {
        Duration::from_secs(self.plugin_timeout_secs)
    }
}

fn default_plugin_timeout_secs() -> u64 {
    30
}

/// Static tokens accepted by the session layer.
///
/// Session resolution proper belongs to the surrounding application; this
/// is the minimal built-in resolver so the host runs standalone. With no
/// tokens configured every request is anonymous.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    /// Grants a regular user session (user id 1).
    #[serde(default)]
    pub session_token: Option<String>,
    /// Grants an admin session (user id 0); required for enable/disable.
    #[serde(default)]
    pub admin_token: Option<String>,
}

/// Data directory, `~/.medley` by default.
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".medley")
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.plugins.load_timeout_secs == 0 {
            return Err("plugins.load_timeout_secs must be at least 1".to_string());
        }
        if self.search.plugin_timeout_secs == 0 {
            return Err("search.plugin_timeout_secs must be at least 1".to_string());
        }
        if self.server.host.is_empty() {
            return Err("server.host cannot be empty".to_string());
        }
        Ok(())
    }
}

/// Load configuration from all sources
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder();

    // Set defaults
    builder = builder
        .set_default("server.host", default_host())?
        .set_default("server.port", default_port() as i64)?
        .set_default("plugins.enabled", true)?
        .set_default("plugins.load_timeout_secs", default_load_timeout_secs() as i64)?
        .set_default("search.plugin_timeout_secs", default_plugin_timeout_secs() as i64)?;

    // Load from working-directory config file
    let local_config = PathBuf::from("medley.yaml");
    if local_config.exists() {
        builder = builder.add_source(File::from(local_config).required(false));
    }

    // Load from home directory config file
    if let Some(home) = dirs::home_dir() {
        let home_config: PathBuf = home.join(".medley/config.yaml");
        if home_config.exists() {
            builder = builder.add_source(File::from(home_config).required(false));
        }
    }

    // Load from environment variables with MEDLEY_ prefix
    // e.g., MEDLEY_SERVER_PORT=7878, MEDLEY_PLUGINS_ENABLED=false
    builder = builder.add_source(
        Environment::with_prefix("MEDLEY")
            .separator("_")
            .try_parsing(true),
    );

    // Multi-word keys cannot round-trip through the `_` separator, so the
    // common secrets and paths get dedicated variables.
    if let Ok(token) = std::env::var("MEDLEY_SESSION_TOKEN") {
        builder = builder.set_override("auth.session_token", token)?;
    }
    if let Ok(token) = std::env::var("MEDLEY_ADMIN_TOKEN") {
        builder = builder.set_override("auth.admin_token", token)?;
    }
    if let Ok(dir) = std::env::var("MEDLEY_PLUGINS_DIR") {
        builder = builder.set_override("plugins.dir", dir)?;
    }
    if let Ok(path) = std::env::var("MEDLEY_DATABASE_PATH") {
        builder = builder.set_override("database.path", path)?;
    }

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        // This test verifies defaults work without any config files
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 7878);
        assert!(config.plugins.enabled);
        assert_eq!(config.plugins.load_timeout_secs, 10);
        assert_eq!(config.search.plugin_timeout_secs, 30);
        assert!(config.auth.session_token.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_paths_live_under_data_dir() {
        let config = AppConfig {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            plugins: PluginsConfig::default(),
            search: SearchConfig::default(),
            auth: AuthConfig::default(),
        };
        assert!(config.database.path.ends_with(".medley/medley.db"));
        assert!(config.plugins.dir.ends_with(".medley/plugins"));
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{
                "server": {"port": 9090},
                "plugins": {"dir": "/srv/medley/plugins"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.plugins.dir, PathBuf::from("/srv/medley/plugins"));
        assert_eq!(config.plugins.load_timeout_secs, 10);
    }

    #[test]
    fn test_timeout_helpers() {
        let config: AppConfig =
            serde_json::from_str(r#"{"search": {"plugin_timeout_secs": 5}}"#).unwrap();
        assert_eq!(config.search.plugin_timeout(), Duration::from_secs(5));
        assert_eq!(config.plugins.load_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let config: AppConfig =
            serde_json::from_str(r#"{"plugins": {"load_timeout_secs": 0}}"#).unwrap();
        assert!(config.validate().is_err());

        let config: AppConfig =
            serde_json::from_str(r#"{"search": {"plugin_timeout_secs": 0}}"#).unwrap();
        assert!(config.validate().is_err());
    }
}
