//! Signed envelope protocol spoken between the bridge hub and game-server
//! agents.
//!
//! Every frame is a JSON [`Envelope`] whose header and raw payload bytes are
//! covered by an HMAC-SHA256 signature over a shared token. On top of the
//! envelope this crate provides the pieces both roles share: the
//! [`ReplayFilter`] that drops repeated message ids and the
//! [`HeartbeatMonitor`] that decides when a silent peer is dead.

pub mod codes;
pub mod constants;
pub mod envelope;
pub mod heartbeat;
pub mod ids;
pub mod messages;
pub mod replay;
pub mod signing;

// Re-export primary types for convenience.
pub use codes::ErrorCode;
pub use constants::MessageType;
pub use envelope::Envelope;
pub use heartbeat::{HeartbeatMonitor, Liveness};
pub use messages::{
    Ack, AuthAck, AuthRequest, Body, ErrorPayload, FileChunk, FileComplete, FileNotice,
    TaskResult,
};
pub use replay::ReplayFilter;
pub use signing::AuthError;

/// Errors produced while encoding or decoding envelopes.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0} envelope is missing its payload")]
    MissingPayload(MessageType),

    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),
}
