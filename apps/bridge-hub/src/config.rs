//! Bridge configuration management.
//!
//! Configuration is stored as TOML. The file is taken from the first
//! command-line argument, then `L4D2_BRIDGE_CONFIG`, then
//! `~/.config/l4d2-bridge/bridge.toml`. A default file is written when
//! none exists.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use l4d2_bridge_data_channel::StoreConfig;
use l4d2_bridge_hub::{DeliveryPolicy, HubConfig, LargePush};
use l4d2_bridge_protocol::constants::{
    DEFAULT_ALLOWED_EXTENSIONS, DEFAULT_FILE_PATH, DEFAULT_INLINE_THRESHOLD,
    DEFAULT_MAX_AUTH_FAILURES, DEFAULT_MAX_FILE_SIZE, DEFAULT_MAX_SESSIONS, DEFAULT_WS_PATH,
    WS_CHUNK_SIZE, WS_MAX_MESSAGE_SIZE,
};
use l4d2_bridge_transfer::ExtensionPolicy;
use serde::{Deserialize, Serialize};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "L4D2_BRIDGE_CONFIG";

/// Bridge configuration. Durations are in seconds, sizes in bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Shared secret for envelope signatures and the data channel.
    #[serde(default = "default_token")]
    pub token: String,

    #[serde(default = "default_ws_bind")]
    pub ws_bind: SocketAddr,

    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    /// Data channel listen address.
    #[serde(default = "default_http_bind")]
    pub http_bind: SocketAddr,

    /// Data channel base path.
    #[serde(default = "default_file_path")]
    pub file_path: String,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,

    #[serde(default = "default_auth_timeout")]
    pub auth_timeout: u64,

    #[serde(default = "default_signature_window")]
    pub signature_window: u64,

    #[serde(default = "default_dedup_window")]
    pub dedup_window: u64,

    #[serde(default = "default_transfer_idle_timeout")]
    pub transfer_idle_timeout: u64,

    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout: u64,

    #[serde(default = "default_completed_retention")]
    pub completed_retention: u64,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    #[serde(default = "default_max_auth_failures")]
    pub max_auth_failures: u32,

    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Files up to this size travel inline in one envelope.
    #[serde(default = "default_inline_threshold")]
    pub inline_threshold: u64,

    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Empty allows every extension.
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    /// Display names keyed by server id.
    #[serde(default)]
    pub server_names: HashMap<String, String>,

    /// Where received and staged files are kept.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,

    #[serde(default)]
    pub delivery: DeliveryPolicy,

    #[serde(default)]
    pub large_push: LargePush,
}

fn default_token() -> String {
    "change_me_to_a_secure_token".into()
}

fn default_ws_bind() -> SocketAddr {
    ([0, 0, 0, 0], 8765).into()
}

fn default_ws_path() -> String {
    DEFAULT_WS_PATH.into()
}

fn default_http_bind() -> SocketAddr {
    ([0, 0, 0, 0], 8766).into()
}

fn default_file_path() -> String {
    DEFAULT_FILE_PATH.into()
}

fn default_heartbeat_interval() -> u64 {
    15
}

fn default_auth_timeout() -> u64 {
    10
}

fn default_signature_window() -> u64 {
    30
}

fn default_dedup_window() -> u64 {
    600
}

fn default_transfer_idle_timeout() -> u64 {
    300
}

fn default_delivery_timeout() -> u64 {
    600
}

fn default_completed_retention() -> u64 {
    60
}

fn default_max_sessions() -> usize {
    DEFAULT_MAX_SESSIONS
}

fn default_max_auth_failures() -> u32 {
    DEFAULT_MAX_AUTH_FAILURES
}

fn default_max_message_size() -> usize {
    WS_MAX_MESSAGE_SIZE
}

fn default_chunk_size() -> usize {
    WS_CHUNK_SIZE
}

fn default_inline_threshold() -> u64 {
    DEFAULT_INLINE_THRESHOLD
}

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

fn default_allowed_extensions() -> Vec<String> {
    DEFAULT_ALLOWED_EXTENSIONS
        .iter()
        .map(|e| e.to_string())
        .collect()
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("data/Document")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token: default_token(),
            ws_bind: default_ws_bind(),
            ws_path: default_ws_path(),
            http_bind: default_http_bind(),
            file_path: default_file_path(),
            heartbeat_interval: default_heartbeat_interval(),
            auth_timeout: default_auth_timeout(),
            signature_window: default_signature_window(),
            dedup_window: default_dedup_window(),
            transfer_idle_timeout: default_transfer_idle_timeout(),
            delivery_timeout: default_delivery_timeout(),
            completed_retention: default_completed_retention(),
            max_sessions: default_max_sessions(),
            max_auth_failures: default_max_auth_failures(),
            max_message_size: default_max_message_size(),
            chunk_size: default_chunk_size(),
            inline_threshold: default_inline_threshold(),
            max_file_size: default_max_file_size(),
            allowed_extensions: default_allowed_extensions(),
            server_names: HashMap::new(),
            upload_dir: default_upload_dir(),
            delivery: DeliveryPolicy::default(),
            large_push: LargePush::default(),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or writes and returns the default
    /// if the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::warn!(path = %path.display(), "no configuration found, wrote defaults");
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // The file holds the shared token.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Checks values that would make the bridge unusable.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.token.trim().is_empty() {
            anyhow::bail!("token must not be empty");
        }
        if self.heartbeat_interval == 0 {
            anyhow::bail!("heartbeat_interval must be positive");
        }
        if self.chunk_size == 0 || self.chunk_size >= self.max_message_size {
            anyhow::bail!("chunk_size must be positive and below max_message_size");
        }
        if !self.ws_path.starts_with('/') || !self.file_path.starts_with('/') {
            anyhow::bail!("ws_path and file_path must start with '/'");
        }
        if self.token == default_token() {
            tracing::warn!("using the default token; change it before exposing the bridge");
        }
        Ok(())
    }

    /// Hub server settings derived from this configuration.
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            token: self.token.clone(),
            bind: self.ws_bind,
            ws_path: self.ws_path.clone(),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval),
            auth_timeout: Duration::from_secs(self.auth_timeout),
            signature_window: Duration::from_secs(self.signature_window),
            dedup_window: Duration::from_secs(self.dedup_window),
            transfer_idle_timeout: Duration::from_secs(self.transfer_idle_timeout),
            delivery_timeout: Duration::from_secs(self.delivery_timeout),
            completed_retention: Duration::from_secs(self.completed_retention),
            max_sessions: self.max_sessions,
            max_auth_failures: self.max_auth_failures,
            max_message_size: self.max_message_size,
            chunk_size: self.chunk_size,
            inline_threshold: self.inline_threshold,
            max_file_size: self.max_file_size,
            policy: self.extension_policy(),
            server_names: self.server_names.clone(),
            delivery: self.delivery,
            large_push: self.large_push,
        }
    }

    /// Object store settings for the data channel.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            policy: self.extension_policy(),
            max_file_size: self.max_file_size,
            ..StoreConfig::new(&self.upload_dir)
        }
    }

    pub fn extension_policy(&self) -> ExtensionPolicy {
        if self.allowed_extensions.is_empty() {
            ExtensionPolicy::allow_all()
        } else {
            ExtensionPolicy::new(&self.allowed_extensions)
        }
    }
}

/// Resolves the configuration file path.
pub fn config_path(arg: Option<String>) -> PathBuf {
    if let Some(path) = arg {
        return PathBuf::from(path);
    }
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".config")
        .join("l4d2-bridge")
        .join("bridge.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.token, "change_me_to_a_secure_token");
        assert_eq!(config.ws_bind.port(), 8765);
        assert_eq!(config.http_bind.port(), 8766);
        assert_eq!(config.ws_path, "/ws/l4d2");
        assert_eq!(config.file_path, "/v1/files");
        assert_eq!(config.allowed_extensions, vec!["vpk".to_string()]);
        assert_eq!(config.upload_dir, PathBuf::from("data/Document"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_partial_toml() {
        let toml_str = r#"
            token = "s3cret"
            large_push = "object_store"
            delivery = "acknowledged"

            [server_names]
            srv1 = "Versus #1"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.token, "s3cret");
        assert_eq!(config.large_push, LargePush::ObjectStore);
        assert_eq!(config.delivery, DeliveryPolicy::Acknowledged);
        assert_eq!(config.heartbeat_interval, 15);
        assert_eq!(config.server_names["srv1"], "Versus #1");
    }

    #[test]
    fn hub_config_converts_units() {
        let config = Config {
            heartbeat_interval: 5,
            allowed_extensions: vec![],
            ..Config::default()
        };
        let hub = config.hub_config();
        assert_eq!(hub.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(hub.bind, config.ws_bind);
        assert!(hub.policy.check("anything.zip").is_ok());

        let store = config.store_config();
        assert_eq!(store.dir, config.upload_dir);
        assert_eq!(store.max_file_size, config.max_file_size);
    }

    #[test]
    fn validate_rejects_unusable_values() {
        let empty = Config {
            token: " ".into(),
            ..Config::default()
        };
        assert!(empty.validate().is_err());

        let chunk = Config {
            chunk_size: WS_MAX_MESSAGE_SIZE,
            ..Config::default()
        };
        assert!(chunk.validate().is_err());
    }

    #[test]
    fn load_writes_defaults_then_reads_back() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("bridge.toml");

        let first = Config::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(first, Config::default());

        let changed = Config {
            token: "other".into(),
            ..Config::default()
        };
        changed.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap().token, "other");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn explicit_path_wins() {
        assert_eq!(
            config_path(Some("/etc/bridge.toml".into())),
            PathBuf::from("/etc/bridge.toml")
        );
    }
}
