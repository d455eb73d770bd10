//! Agent configuration.

use std::path::PathBuf;
use std::time::Duration;

use l4d2_bridge_protocol::constants::{
    DEFAULT_AUTH_TIMEOUT, DEFAULT_DEDUP_WINDOW, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_INLINE_THRESHOLD, DEFAULT_MAX_FILE_SIZE, DEFAULT_SIGNATURE_WINDOW,
    DEFAULT_TRANSFER_IDLE_TIMEOUT, WS_CHUNK_SIZE, WS_MAX_MESSAGE_SIZE,
};
use l4d2_bridge_transfer::ExtensionPolicy;

/// How files above the inline threshold are sent to the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LargeUpload {
    /// FILE_CHUNK envelopes over the WebSocket.
    #[default]
    Chunked,
    /// Upload through the HTTP data channel, then a FILE_NOTICE with the id.
    ObjectStore,
}

/// Settings for one agent connection.
///
/// Constructed by the embedding process; start from [`AgentConfig::new`]
/// and override what differs.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Hub WebSocket endpoint, e.g. `ws://hub:8765/ws/l4d2`.
    pub ws_url: String,
    /// Base URL of the hub's data channel, e.g. `http://hub:8766/v1/files`.
    pub http_url: Option<String>,
    pub token: String,
    pub server_id: String,
    pub agent_version: String,
    /// Used until the hub announces its own interval in AUTH_ACK.
    pub heartbeat_interval: Duration,
    /// How long to wait for AUTH_ACK.
    pub auth_timeout: Duration,
    pub signature_window: Duration,
    pub dedup_window: Duration,
    pub transfer_idle_timeout: Duration,
    pub completed_retention: Duration,
    pub max_message_size: usize,
    pub chunk_size: usize,
    pub inline_threshold: u64,
    pub max_file_size: u64,
    pub policy: ExtensionPolicy,
    /// Where received files land (the game's addons directory).
    pub download_dir: PathBuf,
    pub large_upload: LargeUpload,
}

impl AgentConfig {
    pub fn new(
        ws_url: impl Into<String>,
        token: impl Into<String>,
        server_id: impl Into<String>,
    ) -> Self {
        Self {
            ws_url: ws_url.into(),
            http_url: None,
            token: token.into(),
            server_id: server_id.into(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            signature_window: DEFAULT_SIGNATURE_WINDOW,
            dedup_window: DEFAULT_DEDUP_WINDOW,
            transfer_idle_timeout: DEFAULT_TRANSFER_IDLE_TIMEOUT,
            completed_retention: Duration::from_secs(60),
            max_message_size: WS_MAX_MESSAGE_SIZE,
            chunk_size: WS_CHUNK_SIZE,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            policy: ExtensionPolicy::default(),
            download_dir: PathBuf::from("addons"),
            large_upload: LargeUpload::default(),
        }
    }

    /// Sets the data channel base URL.
    pub fn with_http_url(mut self, url: impl Into<String>) -> Self {
        self.http_url = Some(url.into());
        self
    }

    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_hub() {
        let c = AgentConfig::new("ws://127.0.0.1:8765/ws/l4d2", "t", "srv1");
        assert_eq!(c.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(c.chunk_size, 1024 * 1024);
        assert_eq!(c.inline_threshold, 64 * 1024);
        assert_eq!(c.large_upload, LargeUpload::Chunked);
        assert!(c.http_url.is_none());
    }

    #[test]
    fn builders_override() {
        let c = AgentConfig::new("ws://h/ws/l4d2", "t", "srv1")
            .with_http_url("http://h:8766/v1/files")
            .with_download_dir("/srv/l4d2/left4dead2/addons");
        assert_eq!(c.http_url.as_deref(), Some("http://h:8766/v1/files"));
        assert_eq!(c.download_dir, PathBuf::from("/srv/l4d2/left4dead2/addons"));
    }
}
