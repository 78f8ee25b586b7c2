//! Configuration management for rawadb.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/rawadb/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use adb_protocol::{ConnectOptions, MAX_PAYLOAD_LIMIT, SYNC_DATA_MAX};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be greater than 0")]
    InvalidTimeout(&'static str),

    #[error("max_payload must be between 1 and {max}, got {value}")]
    InvalidMaxPayload { value: usize, max: usize },

    #[error("chunk_size must be between 1 and {max}, got {value}")]
    InvalidChunkSize { value: usize, max: usize },

    #[error("default_mode must only contain permission bits (<= 0o7777), got {0:#o}")]
    InvalidMode(u32),

    #[error("tcp_port must not be 0")]
    InvalidPort,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Port adbd listens on in TCP mode.
pub const DEFAULT_TCP_PORT: u16 = 5555;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Connection and timeout settings.
    pub connection: ConnectionConfig,

    /// Authentication keys.
    pub auth: AuthConfig,

    /// File transfer settings.
    pub sync: SyncConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Connection and timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Identity sent to the device as `host::<banner>`.
    pub banner: String,

    /// Timeout for each read or write, in milliseconds.
    pub default_timeout_ms: u64,

    /// Overall handshake timeout in milliseconds, including the time the
    /// user needs to accept a new key on the device.
    pub auth_timeout_ms: u64,

    /// Largest payload this host accepts.
    pub max_payload: usize,

    /// Port used when a serial has no explicit port.
    pub tcp_port: u16,
}

/// Authentication keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// Private keys tried in order. The matching `.pub` file is used when
    /// present.
    pub key_paths: Vec<PathBuf>,
}

/// File transfer settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// DATA chunk size for pushes.
    pub chunk_size: usize,

    /// Permission bits for pushed files when the source has none.
    pub default_mode: u32,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            banner: default_banner(),
            default_timeout_ms: 10_000,
            auth_timeout_ms: 30_000,
            max_payload: adb_protocol::DEFAULT_MAX_PAYLOAD,
            tcp_port: DEFAULT_TCP_PORT,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            key_paths: vec![default_key_path()],
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: SYNC_DATA_MAX,
            default_mode: 0o644,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rawadb")
        .join("config.toml")
}

/// Returns the key the stock adb tools create, `~/.android/adbkey`.
pub fn default_key_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".android")
        .join("adbkey")
}

/// Returns the host name, falling back to `rawadb`.
fn default_banner() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "rawadb".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - RAWADB_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - RAWADB_KEY_PATH: Override key paths (separated like `PATH`)
    /// - RAWADB_TIMEOUT_MS: Override the per-call timeout
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("RAWADB_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.logging.log_level = level;
            }
        }

        if let Some(paths) = std::env::var_os("RAWADB_KEY_PATH") {
            if !paths.is_empty() {
                let key_paths: Vec<PathBuf> = std::env::split_paths(&paths).collect();
                tracing::info!("Overriding key_paths from environment: {:?}", key_paths);
                self.auth.key_paths = key_paths;
            }
        }

        if let Ok(timeout) = std::env::var("RAWADB_TIMEOUT_MS") {
            match timeout.parse::<u64>() {
                Ok(ms) => {
                    tracing::info!("Overriding default_timeout_ms from environment: {}", ms);
                    self.connection.default_timeout_ms = ms;
                }
                Err(_) if timeout.is_empty() => {}
                Err(e) => {
                    tracing::warn!("Ignoring RAWADB_TIMEOUT_MS={:?}: {}", timeout, e);
                }
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.default_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout("default_timeout_ms"));
        }
        if self.connection.auth_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout("auth_timeout_ms"));
        }

        let max_payload = self.connection.max_payload;
        if max_payload == 0 || max_payload > MAX_PAYLOAD_LIMIT {
            return Err(ConfigError::InvalidMaxPayload {
                value: max_payload,
                max: MAX_PAYLOAD_LIMIT,
            });
        }

        if self.connection.tcp_port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        let chunk_size = self.sync.chunk_size;
        if chunk_size == 0 || chunk_size > SYNC_DATA_MAX {
            return Err(ConfigError::InvalidChunkSize {
                value: chunk_size,
                max: SYNC_DATA_MAX,
            });
        }

        if self.sync.default_mode > 0o7777 {
            return Err(ConfigError::InvalidMode(self.sync.default_mode));
        }

        let level = self.logging.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.log_level.clone()));
        }

        Ok(())
    }

    /// Per-call timeout.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.default_timeout_ms)
    }

    /// Overall handshake timeout.
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.auth_timeout_ms)
    }

    /// Handshake options derived from the connection section.
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            banner: self.connection.banner.clone(),
            auth_timeout: self.auth_timeout(),
            max_payload: self.connection.max_payload,
        }
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_env() {
        std::env::remove_var("RAWADB_LOG_LEVEL");
        std::env::remove_var("RAWADB_KEY_PATH");
        std::env::remove_var("RAWADB_TIMEOUT_MS");
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.connection.default_timeout_ms, 10_000);
        assert_eq!(config.connection.auth_timeout_ms, 30_000);
        assert_eq!(config.connection.max_payload, 4096);
        assert_eq!(config.connection.tcp_port, 5555);
        assert!(!config.connection.banner.is_empty());
        assert_eq!(config.sync.chunk_size, 64 * 1024);
        assert_eq!(config.sync.default_mode, 0o644);
        assert_eq!(config.logging.log_level, "info");
    }

    #[test]
    fn test_default_key_path() {
        let config = AuthConfig::default();
        assert_eq!(config.key_paths.len(), 1);
        assert!(config.key_paths[0].ends_with(".android/adbkey"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("rawadb/config.toml"));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[connection]
default_timeout_ms = 2500

[logging]
log_level = "debug"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.connection.default_timeout_ms, 2500);
        assert_eq!(config.default_timeout(), Duration::from_millis(2500));
        assert_eq!(config.logging.log_level, "debug");
        // Other values should be defaults
        assert_eq!(config.connection.auth_timeout_ms, 30_000);
        assert_eq!(config.sync, SyncConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[connection]
banner = "ci-runner"
default_timeout_ms = 5000
auth_timeout_ms = 60000
max_payload = 262144
tcp_port = 5037

[auth]
key_paths = ["/keys/one", "/keys/two"]

[sync]
chunk_size = 16384
default_mode = 0o600

[logging]
log_level = "trace"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.connection.banner, "ci-runner");
        assert_eq!(config.connection.max_payload, 262_144);
        assert_eq!(config.connection.tcp_port, 5037);
        assert_eq!(
            config.auth.key_paths,
            vec![PathBuf::from("/keys/one"), PathBuf::from("/keys/two")]
        );
        assert_eq!(config.sync.chunk_size, 16_384);
        assert_eq!(config.sync.default_mode, 0o600);
        assert_eq!(config.logging.log_level, "trace");
        assert!(config.validate().is_ok());

        let options = config.connect_options();
        assert_eq!(options.banner, "ci-runner");
        assert_eq!(options.auth_timeout, Duration::from_secs(60));
        assert_eq!(options.max_payload, 262_144);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[connection
banner = "x"
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[connection]
tcp_port = "not a number"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.connection.banner = "lab".to_string();
        original.auth.key_paths = vec![PathBuf::from("/tmp/k")];
        original.sync.chunk_size = 1024;

        let toml = original.to_toml().unwrap();
        assert!(toml.contains("[connection]"));
        assert!(toml.contains("[auth]"));
        assert_eq!(Config::from_toml(&toml).unwrap(), original);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.connection.default_timeout_ms = 1234;
        config.save(&path).unwrap();

        assert!(path.exists());
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "this is not [valid toml").unwrap();

        let err = format!("{:#}", Config::load(&path).unwrap_err());
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml = r#"
[connection]
banner = "x"
future_option = true

[unknown_section]
key = "value"
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.connection.banner, "x");
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        clear_env();
        std::env::set_var("RAWADB_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.logging.log_level, "debug");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        clear_env();
        std::env::set_var("RAWADB_LOG_LEVEL", "");
        std::env::set_var("RAWADB_KEY_PATH", "");
        std::env::set_var("RAWADB_TIMEOUT_MS", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_key_paths() {
        clear_env();
        let joined = std::env::join_paths(["/a/adbkey", "/b/adbkey"]).unwrap();
        std::env::set_var("RAWADB_KEY_PATH", &joined);

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(
            config.auth.key_paths,
            vec![PathBuf::from("/a/adbkey"), PathBuf::from("/b/adbkey")]
        );

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_timeout() {
        clear_env();
        std::env::set_var("RAWADB_TIMEOUT_MS", "750");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.connection.default_timeout_ms, 750);

        std::env::set_var("RAWADB_TIMEOUT_MS", "soon");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.connection.default_timeout_ms, 10_000);

        clear_env();
    }

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_zero_timeouts() {
        let mut config = Config::default();
        config.connection.default_timeout_ms = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTimeout("default_timeout_ms"))
        );

        let mut config = Config::default();
        config.connection.auth_timeout_ms = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTimeout("auth_timeout_ms"))
        );
    }

    #[test]
    fn test_validate_max_payload_bounds() {
        let mut config = Config::default();
        config.connection.max_payload = MAX_PAYLOAD_LIMIT;
        assert!(config.validate().is_ok());

        config.connection.max_payload = MAX_PAYLOAD_LIMIT + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMaxPayload { .. })
        ));

        config.connection.max_payload = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_chunk_size_bounds() {
        let mut config = Config::default();
        config.sync.chunk_size = SYNC_DATA_MAX + 1;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidChunkSize {
                value: SYNC_DATA_MAX + 1,
                max: SYNC_DATA_MAX
            })
        );
    }

    #[test]
    fn test_validate_mode_and_port() {
        let mut config = Config::default();
        config.sync.default_mode = 0o100644;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMode(0o100644)));

        let mut config = Config::default();
        config.connection.tcp_port = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPort));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.logging.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.logging.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_validation_error_messages() {
        assert_eq!(
            ConfigError::InvalidTimeout("auth_timeout_ms").to_string(),
            "auth_timeout_ms must be greater than 0"
        );
        assert_eq!(
            ConfigError::InvalidMode(0o100644).to_string(),
            "default_mode must only contain permission bits (<= 0o7777), got 0o100644"
        );
    }
}
