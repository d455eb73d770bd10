//! Game-server side of the L4D2 bridge.
//!
//! An [`AgentClient`] holds one authenticated WebSocket connection to the
//! hub. It probes liveness with heartbeats, reassembles and verifies files
//! pushed by the hub into its download directory, sends local files up,
//! and reports task outcomes. Everything noteworthy is delivered as an
//! [`AgentEvent`].
//!
//! There is no automatic reconnection; the embedding process decides when
//! to dial again after [`AgentEvent::Disconnected`].

mod client;
mod config;
mod events;
mod link;
mod pumps;

pub use client::{AgentClient, SentFile};
pub use config::{AgentConfig, LargeUpload};
pub use events::{AgentEvent, AgentEventReceiver, AgentEventSender, ReceivedFile};
pub use link::SEND_BUFFER_SIZE;

use l4d2_bridge_data_channel::DataChannelError;
use l4d2_bridge_protocol::{ErrorCode, ProtocolError};
use l4d2_bridge_transfer::TransferError;
use tokio_tungstenite::tungstenite;

/// Errors from the agent client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("data channel: {0}")]
    DataChannel(#[from] DataChannelError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out waiting for AUTH_ACK")]
    Timeout,

    #[error("hub refused the connection: {code}: {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("connection closed")]
    Closed,

    #[error("no data channel configured")]
    NoDataChannel,
}

impl ClientError {
    /// Wire code closest to this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            ClientError::Transfer(e) => e.code(),
            ClientError::DataChannel(DataChannelError::Rejected(e)) => e.code(),
            ClientError::Rejected { code, .. } => *code,
            ClientError::Timeout => ErrorCode::AuthTimeout,
            ClientError::Closed | ClientError::WebSocket(_) => ErrorCode::Disconnected,
            ClientError::Protocol(_) => ErrorCode::InvalidPayload,
            ClientError::DataChannel(_) | ClientError::Io(_) | ClientError::NoDataChannel => {
                ErrorCode::Internal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(ClientError::Timeout.to_string(), "timed out waiting for AUTH_ACK");
        assert_eq!(ClientError::Closed.to_string(), "connection closed");
        let rejected = ClientError::Rejected {
            code: ErrorCode::AuthInvalidSignature,
            message: "AUTH_INVALID_SIGNATURE".into(),
        };
        assert!(rejected.to_string().contains("1001"));
    }

    #[test]
    fn error_codes() {
        assert_eq!(ClientError::Timeout.code(), ErrorCode::AuthTimeout);
        assert_eq!(
            ClientError::from(TransferError::TooLarge { size: 2, limit: 1 }).code(),
            ErrorCode::FileTooLarge
        );
        assert_eq!(ClientError::NoDataChannel.code(), ErrorCode::Internal);
    }
}
