//! Configuration for the execution core.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/gateway-exec/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::relay::DEFAULT_BUFFER_SIZE;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("relay_buffer_size must be between 1 and {MAX_RELAY_BUFFER_SIZE}, got {0}")]
    InvalidRelayBufferSize(usize),

    #[error("envfs dir must be an absolute path, got {0}")]
    InvalidEnvfsDir(String),

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Largest chunk a relay may read at once.
const MAX_RELAY_BUFFER_SIZE: usize = 1024 * 1024;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ExecConfig {
    /// Process execution settings.
    pub exec: ProcessConfig,

    /// Materialized `filesystem:` variables.
    pub envfs: EnvfsConfig,

    /// Logging settings.
    pub log: LogConfig,
}

/// Process execution settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessConfig {
    /// Chunk size used when relaying process output.
    pub relay_buffer_size: usize,

    /// `PATH` handed to child processes. Inherited from the gateway when unset.
    pub path: Option<String>,

    /// Forward the gateway's own `SIGWINCH` into interactive sessions.
    pub forward_sigwinch: bool,
}

/// Settings for file-backed environment variables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnvfsConfig {
    /// Directory the provisioned files are written to.
    pub dir: PathBuf,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            relay_buffer_size: DEFAULT_BUFFER_SIZE,
            path: None,
            forward_sigwinch: false,
        }
    }
}

impl Default for EnvfsConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gateway-exec")
        .join("config.toml")
}

impl ExecConfig {
    /// `PATH` for child processes: the configured value, else the gateway's.
    pub fn child_path(&self) -> Option<String> {
        self.exec
            .path
            .clone()
            .or_else(|| std::env::var("PATH").ok())
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported variables:
    /// - GATEWAY_EXEC_LOG_LEVEL: Override log level
    /// - GATEWAY_EXEC_ENVFS_DIR: Override the envfs directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("GATEWAY_EXEC_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.log.level = level;
            }
        }

        if let Ok(dir) = std::env::var("GATEWAY_EXEC_ENVFS_DIR") {
            if !dir.is_empty() {
                tracing::info!("Overriding envfs dir from environment: {}", dir);
                self.envfs.dir = PathBuf::from(dir);
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let size = self.exec.relay_buffer_size;
        if size == 0 || size > MAX_RELAY_BUFFER_SIZE {
            return Err(ConfigError::InvalidRelayBufferSize(size));
        }

        if !self.envfs.dir.is_absolute() {
            return Err(ConfigError::InvalidEnvfsDir(
                self.envfs.dir.display().to_string(),
            ));
        }

        let level = self.log.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log.level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
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

    /// Save configuration to a file, creating parent directories.
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

    #[test]
    fn test_default_config() {
        let config = ExecConfig::default();

        assert_eq!(config.exec.relay_buffer_size, 1024);
        assert!(config.exec.path.is_none());
        assert!(!config.exec.forward_sigwinch);
        assert_eq!(config.envfs.dir, std::env::temp_dir());
        assert_eq!(config.log.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_empty() {
        let config = ExecConfig::from_toml("").unwrap();
        assert_eq!(config, ExecConfig::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[exec]
relay_buffer_size = 4096

[log]
level = "debug"
"#;
        let config = ExecConfig::from_toml(toml).unwrap();

        assert_eq!(config.exec.relay_buffer_size, 4096);
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.envfs, EnvfsConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[exec]
relay_buffer_size = 2048
path = "/usr/local/bin:/usr/bin:/bin"
forward_sigwinch = true

[envfs]
dir = "/run/gateway/envfs"

[log]
level = "trace"
"#;
        let config = ExecConfig::from_toml(toml).unwrap();

        assert_eq!(config.exec.relay_buffer_size, 2048);
        assert_eq!(
            config.exec.path.as_deref(),
            Some("/usr/local/bin:/usr/bin:/bin")
        );
        assert!(config.exec.forward_sigwinch);
        assert_eq!(config.envfs.dir, PathBuf::from("/run/gateway/envfs"));
        assert_eq!(config.log.level, "trace");
        assert_eq!(config.child_path().as_deref(), Some("/usr/local/bin:/usr/bin:/bin"));
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = ExecConfig::from_toml("[exec\nrelay_buffer_size = 1");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[exec]
relay_buffer_size = "large"
"#;
        assert!(ExecConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = ExecConfig::default();
        original.exec.relay_buffer_size = 8192;
        original.exec.path = Some("/bin".to_string());
        original.log.level = "warn".to_string();

        let loaded = ExecConfig::from_toml(&original.to_toml().unwrap()).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = ExecConfig::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, ExecConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = ExecConfig::default();
        original.envfs.dir = temp_dir.path().to_path_buf();
        original.save(&config_path).unwrap();

        assert_eq!(ExecConfig::load(&config_path).unwrap(), original);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = ExecConfig::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("gateway-exec"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn test_validate_relay_buffer_size() {
        let mut config = ExecConfig::default();
        config.exec.relay_buffer_size = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidRelayBufferSize(0))
        );

        config.exec.relay_buffer_size = MAX_RELAY_BUFFER_SIZE + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_envfs_dir() {
        let mut config = ExecConfig::default();
        config.envfs.dir = PathBuf::from("relative/dir");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEnvfsDir(_))
        ));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = ExecConfig::default();
        config.log.level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.log.level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("GATEWAY_EXEC_LOG_LEVEL", "debug");
        std::env::set_var("GATEWAY_EXEC_ENVFS_DIR", "/dev/shm");

        let mut config = ExecConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.log.level, "debug");
        assert_eq!(config.envfs.dir, PathBuf::from("/dev/shm"));

        std::env::remove_var("GATEWAY_EXEC_LOG_LEVEL");
        std::env::remove_var("GATEWAY_EXEC_ENVFS_DIR");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("GATEWAY_EXEC_LOG_LEVEL", "");

        let mut config = ExecConfig::default();
        config.apply_env_overrides();
        assert_eq!(config.log.level, "info");

        std::env::remove_var("GATEWAY_EXEC_LOG_LEVEL");
    }
}
