// Client configuration
// Loaded from a JSON file in the user's config directory, then overridden
// by environment variables and command line flags.

use anyhow::{anyhow, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chat::connection::RetryPolicy;
use crate::chat::engine::EngineSettings;
use crate::error::ChatError;

pub const ENV_ENDPOINT: &str = "CHATSYNC_ENDPOINT";
pub const ENV_USER_ID: &str = "CHATSYNC_USER_ID";
pub const ENV_TOKEN: &str = "CHATSYNC_TOKEN";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ChatConfig {
    pub endpoint: String,
    pub user_id: String,
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub retry_budget: u32,
    pub retry_base_interval_ms: u64,
    pub watchdog_interval_ms: u64,
    pub connect_timeout_ms: u64,
    /// Retry after an already-established session drops (off by default).
    pub reconnect_after_established: bool,
    pub typing_debounce_ms: u64,
    pub delete_window_secs: u64,
    pub heartbeat_interval_secs: Option<u64>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        ChatConfig {
            endpoint: String::new(),
            user_id: String::new(),
            display_name: None,
            auth_token: None,
            retry_budget: 3,
            retry_base_interval_ms: 1000,
            watchdog_interval_ms: 1000,
            connect_timeout_ms: 10_000,
            reconnect_after_established: false,
            typing_debounce_ms: 2000,
            delete_window_secs: 15 * 60,
            heartbeat_interval_secs: None,
        }
    }
}

impl ChatConfig {
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.endpoint.trim().is_empty() {
            return Err(ChatError::Config("endpoint is empty".to_string()));
        }
        if self.user_id.trim().is_empty() {
            return Err(ChatError::Config("user_id is empty".to_string()));
        }
        if self.typing_debounce_ms == 0 {
            return Err(ChatError::Config("typing_debounce_ms must be positive".to_string()));
        }
        Ok(())
    }

    /// Endpoint with the auth token appended as a query parameter.
    pub fn socket_url(&self) -> String {
        match &self.auth_token {
            Some(token) => {
                let separator = if self.endpoint.contains('?') { '&' } else { '?' };
                format!("{}{}token={}", self.endpoint, separator, token)
            }
            None => self.endpoint.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            budget: self.retry_budget,
            base_interval: Duration::from_millis(self.retry_base_interval_ms),
            reconnect_after_established: self.reconnect_after_established,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            local_user_id: self.user_id.clone(),
            typing_debounce: Duration::from_millis(self.typing_debounce_ms),
            delete_window: Duration::from_secs(self.delete_window_secs),
        }
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Apply `CHATSYNC_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(endpoint) = env::var(ENV_ENDPOINT) {
            self.endpoint = endpoint;
        }
        if let Ok(user_id) = env::var(ENV_USER_ID) {
            self.user_id = user_id;
        }
        if let Ok(token) = env::var(ENV_TOKEN) {
            self.auth_token = Some(token);
        }
    }
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("chatsync");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.json"))
}

pub fn save_config(config: &ChatConfig, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, config)?;
    info!("Configuration saved to {}", path.display());
    Ok(())
}

/// Load the config at `path`, falling back to defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<ChatConfig> {
    if !path.exists() {
        info!("No config at {}, using defaults", path.display());
        return Ok(ChatConfig::default());
    }

    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let config: ChatConfig = serde_json::from_str(&contents)?;
    info!("Loaded configuration for {} from {}", config.user_id, path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChatConfig::default();
        assert_eq!(config.retry_budget, 3);
        assert_eq!(config.typing_debounce_ms, 2000);
        assert!(!config.reconnect_after_established);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_socket_url_appends_token() {
        let mut config = ChatConfig {
            endpoint: "wss://chat.example/ws".to_string(),
            auth_token: Some("t0k".to_string()),
            ..Default::default()
        };
        assert_eq!(config.socket_url(), "wss://chat.example/ws?token=t0k");
        config.endpoint = "wss://chat.example/ws?v=2".to_string();
        assert_eq!(config.socket_url(), "wss://chat.example/ws?v=2&token=t0k");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = ChatConfig {
            endpoint: "ws://localhost:9000".to_string(),
            user_id: "u1".to_string(),
            heartbeat_interval_secs: Some(30),
            ..Default::default()
        };
        save_config(&config, &path).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(loaded.validate().is_ok());
        assert_eq!(loaded.heartbeat_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"endpoint":"ws://x","user_id":"me"}"#).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.retry_budget, 3);
        assert_eq!(loaded.delete_window_secs, 900);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_config(&dir.path().join("nope.json")).unwrap();
        assert_eq!(loaded, ChatConfig::default());
    }
}
