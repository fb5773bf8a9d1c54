//! Server configuration, loadable from TOML. Every field has a default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Sync server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Snapshot storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Quiet period after the last edit before a save
    pub save_debounce_ms: u64,
    /// Upper bound on how long a burst of edits can postpone a save
    pub save_max_wait_ms: u64,
    /// Awareness slots not renewed within this are evicted
    pub presence_timeout_secs: u64,
    pub presence_check_interval_secs: u64,
    /// An idle actor (hibernated or never loaded) stops after this long
    pub room_retire_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            storage_path: None,
            save_debounce_ms: 2_000,
            save_max_wait_ms: 10_000,
            presence_timeout_secs: 30,
            presence_check_interval_secs: 3,
            room_retire_secs: 60,
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_peers_per_room == 0 {
            return Err(ConfigError::Invalid("max_peers_per_room must be > 0".into()));
        }
        if self.broadcast_capacity == 0 {
            return Err(ConfigError::Invalid("broadcast_capacity must be > 0".into()));
        }
        if self.save_max_wait_ms < self.save_debounce_ms {
            return Err(ConfigError::Invalid(
                "save_max_wait_ms must not be shorter than save_debounce_ms".into(),
            ));
        }
        if self.presence_check_interval_secs == 0 {
            return Err(ConfigError::Invalid("presence_check_interval_secs must be > 0".into()));
        }
        Ok(())
    }

    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }

    pub fn save_max_wait(&self) -> Duration {
        Duration::from_millis(self.save_max_wait_ms)
    }

    pub fn presence_timeout(&self) -> Duration {
        Duration::from_secs(self.presence_timeout_secs)
    }

    pub fn presence_check_interval(&self) -> Duration {
        Duration::from_secs(self.presence_check_interval_secs)
    }

    pub fn room_retire_after(&self) -> Duration {
        Duration::from_secs(self.room_retire_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert!(config.storage_path.is_none());
        assert_eq!(config.save_debounce(), Duration::from_secs(2));
        assert_eq!(config.save_max_wait(), Duration::from_secs(10));
        assert_eq!(config.presence_timeout(), Duration::from_secs(30));
        assert_eq!(config.room_retire_after(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ServerConfig::from_toml_str(
            r#"
            bind_addr = "0.0.0.0:8080"
            storage_path = "/var/lib/boardsync"
            save_debounce_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/boardsync")));
        assert_eq!(config.save_debounce_ms, 500);
        assert_eq!(config.save_max_wait_ms, 10_000);
        assert_eq!(config.max_peers_per_room, 100);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            ServerConfig::from_toml_str("save_debounce_ms = 20000"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ServerConfig::from_toml_str("max_peers_per_room = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ServerConfig::from_toml_str("bind_addr = 5"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boardsync.toml");
        std::fs::write(&path, "broadcast_capacity = 64\n").unwrap();

        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.broadcast_capacity, 64);

        assert!(matches!(
            ServerConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
