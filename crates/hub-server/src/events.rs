//! Notifications from the hub to the command layer.

use std::path::PathBuf;

use l4d2_bridge_protocol::{ErrorCode, TaskResult};
use tokio::sync::mpsc;

/// A verified file received from an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Routing tag the agent attached, echoed to the chat layer.
    pub channel: String,
    /// Server id of the sending agent.
    pub sender: String,
    /// Object store id; the file can also be fetched over HTTP with it.
    pub file_id: String,
    pub file_name: String,
    pub size: u64,
    pub sha256: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Connected {
        server_id: String,
        display_name: String,
    },
    Disconnected {
        server_id: String,
        code: ErrorCode,
        reason: String,
    },
    /// First bytes of an inbound chunked transfer arrived.
    UploadStarted {
        server_id: String,
        channel: String,
        file_name: String,
        size: u64,
    },
    FileReceived(ReceivedFile),
    TransferFailed {
        server_id: String,
        channel: String,
        transfer_id: String,
        file_name: String,
        code: ErrorCode,
        message: String,
    },
    /// A task reached a terminal status. Raised once per task.
    TaskResult {
        task_id: String,
        success: bool,
        code: u16,
        message: String,
    },
    /// TASK_RESULT that matched no pending task, passed through verbatim.
    AgentReport {
        server_id: String,
        channel: String,
        report: TaskResult,
    },
}

pub type EventSender = mpsc::UnboundedSender<BridgeEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<BridgeEvent>;

/// Sends an event, ignoring a dropped receiver.
pub(crate) fn emit(events: &EventSender, event: BridgeEvent) {
    if events.send(event).is_err() {
        tracing::trace!("event receiver dropped");
    }
}
