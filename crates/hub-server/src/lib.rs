//! Hub side of the L4D2 bridge.
//!
//! Accepts agent connections over WebSocket, authenticates them with a
//! signed AUTH envelope, keeps one session per server id, and moves files
//! in both directions: small files inline, large ones as checksummed
//! chunks or through the HTTP object store. Every push is tracked as a
//! task whose outcome is reported on the event channel.

mod config;
mod connection;
mod events;
mod push;
mod registry;
mod server;
mod session;
mod tasks;

pub use config::{DeliveryPolicy, HubConfig, LargePush};
pub use connection::SendError;
pub use events::{BridgeEvent, EventReceiver, EventSender, ReceivedFile};
pub use push::FileSource;
pub use registry::SessionRegistry;
pub use server::BridgeServer;
pub use session::SessionState;
pub use tasks::{Task, TaskKind, TaskStatus, TaskTracker};

use l4d2_bridge_data_channel::DataChannelError;
use l4d2_bridge_protocol::ErrorCode;
use l4d2_bridge_transfer::TransferError;

/// Errors produced by the hub server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connection rejected: {0}")]
    ConnectionRejected(ErrorCode),
}

/// Errors returned by [`BridgeServer::push_file`].
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("server not connected: {0}")]
    ServerUnknown(String),

    #[error(transparent)]
    Rejected(#[from] TransferError),

    #[error("object store: {0}")]
    Store(#[from] DataChannelError),
}

impl PushError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PushError::ServerUnknown(_) => ErrorCode::ServerUnknown,
            PushError::Rejected(e) => e.code(),
            PushError::Store(DataChannelError::Rejected(e)) => e.code(),
            PushError::Store(_) => ErrorCode::Internal,
        }
    }
}
