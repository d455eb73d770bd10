//! Events reported to the embedding process.

use std::path::PathBuf;
use std::time::Duration;

use l4d2_bridge_protocol::ErrorCode;
use tokio::sync::mpsc;

/// A verified file pushed by the hub, already moved into the download dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub channel: String,
    pub transfer_id: String,
    pub file_name: String,
    pub size: u64,
    pub sha256: String,
    pub path: PathBuf,
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// AUTH_ACK received.
    Connected {
        server_id: String,
        heartbeat_interval: Duration,
    },
    /// The connection ended. Emitted exactly once.
    Disconnected { code: ErrorCode, reason: String },
    FileReceived(ReceivedFile),
    /// The hub forwarded a download link; fetching it is up to the caller,
    /// who should answer with [`report_result`](crate::AgentClient::report_result).
    FileOffered {
        channel: String,
        file_name: String,
        url: String,
        caption: String,
        task_id: Option<String>,
    },
    TransferFailed {
        channel: String,
        transfer_id: String,
        file_name: String,
        code: ErrorCode,
        message: String,
    },
    /// ERROR envelope from the hub.
    Error {
        code: ErrorCode,
        message: String,
        ref_msg_id: String,
    },
}

pub type AgentEventSender = mpsc::UnboundedSender<AgentEvent>;
pub type AgentEventReceiver = mpsc::UnboundedReceiver<AgentEvent>;

pub(crate) fn emit(events: &AgentEventSender, event: AgentEvent) {
    // The receiver may be gone; the connection keeps working without it.
    let _ = events.send(event);
}
