//! Runtime settings of the hub server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use l4d2_bridge_protocol::constants::{
    DEFAULT_AUTH_TIMEOUT, DEFAULT_DEDUP_WINDOW, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_INLINE_THRESHOLD, DEFAULT_MAX_AUTH_FAILURES, DEFAULT_MAX_FILE_SIZE,
    DEFAULT_MAX_SESSIONS, DEFAULT_SIGNATURE_WINDOW, DEFAULT_TRANSFER_IDLE_TIMEOUT,
    DEFAULT_WS_PATH, WS_CHUNK_SIZE, WS_MAX_MESSAGE_SIZE,
};
use l4d2_bridge_transfer::ExtensionPolicy;
use serde::{Deserialize, Serialize};

/// When an outbound push counts as delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// Resolved once the last envelope is handed to the socket.
    #[default]
    FireAndForget,
    /// Resolved by the agent's TASK_RESULT.
    Acknowledged,
}

/// How files above the inline threshold travel to agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LargePush {
    /// FILE_CHUNK envelopes over the WebSocket.
    #[default]
    Chunked,
    /// Registered in the object store and announced by file id.
    ObjectStore,
}

/// Hub server configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Shared secret used for envelope signatures.
    pub token: String,
    pub bind: SocketAddr,
    pub ws_path: String,
    pub heartbeat_interval: Duration,
    pub auth_timeout: Duration,
    pub signature_window: Duration,
    pub dedup_window: Duration,
    pub transfer_idle_timeout: Duration,
    pub delivery_timeout: Duration,
    /// How long terminal transfers and unread tasks are kept.
    pub completed_retention: Duration,
    pub max_sessions: usize,
    pub max_auth_failures: u32,
    pub max_message_size: usize,
    pub chunk_size: usize,
    pub inline_threshold: u64,
    pub max_file_size: u64,
    pub policy: ExtensionPolicy,
    /// Display names keyed by server id.
    pub server_names: HashMap<String, String>,
    pub delivery: DeliveryPolicy,
    pub large_push: LargePush,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            bind: ([0, 0, 0, 0], 8765).into(),
            ws_path: DEFAULT_WS_PATH.to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            signature_window: DEFAULT_SIGNATURE_WINDOW,
            dedup_window: DEFAULT_DEDUP_WINDOW,
            transfer_idle_timeout: DEFAULT_TRANSFER_IDLE_TIMEOUT,
            delivery_timeout: Duration::from_secs(600),
            completed_retention: Duration::from_secs(60),
            max_sessions: DEFAULT_MAX_SESSIONS,
            max_auth_failures: DEFAULT_MAX_AUTH_FAILURES,
            max_message_size: WS_MAX_MESSAGE_SIZE,
            chunk_size: WS_CHUNK_SIZE,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            policy: ExtensionPolicy::default(),
            server_names: HashMap::new(),
            delivery: DeliveryPolicy::default(),
            large_push: LargePush::default(),
        }
    }
}

impl HubConfig {
    /// Display name for a server, falling back to its id.
    pub fn display_name(&self, server_id: &str) -> String {
        self.server_names
            .get(server_id)
            .cloned()
            .unwrap_or_else(|| server_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol() {
        let c = HubConfig::default();
        assert_eq!(c.ws_path, "/ws/l4d2");
        assert_eq!(c.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(c.max_sessions, 16);
        assert_eq!(c.chunk_size, 1024 * 1024);
        assert_eq!(c.delivery, DeliveryPolicy::FireAndForget);
        assert_eq!(c.large_push, LargePush::Chunked);
    }

    #[test]
    fn display_name_falls_back_to_id() {
        let mut c = HubConfig::default();
        c.server_names.insert("srv1".into(), "Versus #1".into());
        assert_eq!(c.display_name("srv1"), "Versus #1");
        assert_eq!(c.display_name("srv2"), "srv2");
    }
}
