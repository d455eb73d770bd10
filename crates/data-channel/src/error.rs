//! Error types for the data channel.

use l4d2_bridge_transfer::TransferError;

/// Errors produced by the object store, its HTTP routes and its client.
#[derive(Debug, thiserror::Error)]
pub enum DataChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid file id: {0}")]
    InvalidFileId(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("file rejected: {0}")]
    Rejected(#[from] TransferError),

    #[error("empty upload")]
    Empty,
}
