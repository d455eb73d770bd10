use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Envelope format version carried in every message.
pub const PROTOCOL_VERSION: u32 = 1;

/// Sender id the hub stamps on its own envelopes.
pub const HUB_SENDER_ID: &str = "bridge";

/// Default WebSocket path agents connect to.
pub const DEFAULT_WS_PATH: &str = "/ws/l4d2";

/// Default base path of the HTTP object channel.
pub const DEFAULT_FILE_PATH: &str = "/v1/files";

/// Allowed clock skew between sender and receiver.
pub const DEFAULT_SIGNATURE_WINDOW: Duration = Duration::from_secs(30);

/// How long a message id is remembered for replay detection.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(600);

/// Hard cap on remembered ids per session, independent of the window.
pub const DEFAULT_DEDUP_CAPACITY: usize = 16 * 1024;

/// Interval between heartbeats on a connected session.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Number of silent intervals after which a session is declared dead.
pub const HEARTBEAT_MISS_THRESHOLD: u32 = 3;

/// Grace period for the first AUTH envelope after a raw connect.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// A transfer with no chunk progress for this long is abandoned.
pub const DEFAULT_TRANSFER_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Time allowed to write a WebSocket message.
pub const WS_WRITE_WAIT: Duration = Duration::from_secs(30);

/// Maximum WebSocket message size in bytes (8 MiB).
pub const WS_MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Raw bytes carried by one FILE_CHUNK (1 MiB, before base64).
pub const WS_CHUNK_SIZE: usize = 1024 * 1024;

/// Files at or below this size travel inline in a single FILE_NOTICE.
pub const DEFAULT_INLINE_THRESHOLD: u64 = 64 * 1024;

/// Largest file accepted in either direction (10 GiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Maximum number of live agent sessions on one hub.
pub const DEFAULT_MAX_SESSIONS: usize = 16;

/// Consecutive signature failures tolerated on an authenticated session.
pub const DEFAULT_MAX_AUTH_FAILURES: u32 = 5;

/// Extensions accepted when no allow-list is configured.
pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &["vpk"];

/// Longest accepted server id.
pub const MAX_SERVER_ID_LEN: usize = 64;

/// Envelope type identifier.
///
/// The set is closed: an envelope with any other `type` fails to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Handshake
    #[serde(rename = "auth")]
    Auth,
    #[serde(rename = "auth_ack")]
    AuthAck,

    // Liveness
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "heartbeat_ack")]
    HeartbeatAck,

    // File movement
    #[serde(rename = "file_chunk")]
    FileChunk,
    #[serde(rename = "file_complete")]
    FileComplete,
    #[serde(rename = "file_notice")]
    FileNotice,

    // Results and control
    #[serde(rename = "task_result")]
    TaskResult,
    #[serde(rename = "ack")]
    Ack,
    #[serde(rename = "error")]
    Error,
}

impl MessageType {
    /// Wire name, as used in the `type` field and in signed bytes.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::AuthAck => "auth_ack",
            Self::Heartbeat => "heartbeat",
            Self::HeartbeatAck => "heartbeat_ack",
            Self::FileChunk => "file_chunk",
            Self::FileComplete => "file_complete",
            Self::FileNotice => "file_notice",
            Self::TaskResult => "task_result",
            Self::Ack => "ack",
            Self::Error => "error",
        }
    }

    /// Liveness and acknowledgement traffic is never deduplicated.
    pub fn is_control(self) -> bool {
        matches!(self, Self::Heartbeat | Self::HeartbeatAck | Self::Ack)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_serialization() {
        assert_eq!(
            serde_json::to_string(&MessageType::FileChunk).unwrap(),
            "\"file_chunk\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::AuthAck).unwrap(),
            "\"auth_ack\""
        );
    }

    #[test]
    fn message_type_deserialization() {
        let mt: MessageType = serde_json::from_str("\"task_result\"").unwrap();
        assert_eq!(mt, MessageType::TaskResult);
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        assert!(serde_json::from_str::<MessageType>("\"future_type\"").is_err());
    }

    #[test]
    fn as_str_matches_serde_name() {
        for mt in [
            MessageType::Auth,
            MessageType::AuthAck,
            MessageType::Heartbeat,
            MessageType::HeartbeatAck,
            MessageType::FileChunk,
            MessageType::FileComplete,
            MessageType::FileNotice,
            MessageType::TaskResult,
            MessageType::Ack,
            MessageType::Error,
        ] {
            let json = serde_json::to_string(&mt).unwrap();
            assert_eq!(json, format!("\"{}\"", mt.as_str()));
        }
    }

    #[test]
    fn chunk_fits_in_message_after_base64() {
        let encoded = WS_CHUNK_SIZE.div_ceil(3) * 4;
        assert!(encoded + 4096 < WS_MAX_MESSAGE_SIZE);
    }
}
