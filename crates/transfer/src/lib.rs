//! Chunked file transfer with range-tracked reassembly and SHA-256
//! verification.
//!
//! Outbound files are split with [`ChunkReader`] or [`split_bytes`].
//! Inbound files are reassembled per session by a [`TransferTable`], which
//! owns every [`Transfer`] of that session and drives it through
//! `Pending → InProgress → Verifying → Complete | Failed`.

mod assembly;
mod chunked;
mod table;
mod types;
mod validation;

pub use assembly::{Assembled, Assembly, Placement, RangeSet};
pub use chunked::{
    ChunkReader, calculate_file_checksum, checksum_bytes, chunk_count, split_bytes,
};
pub use table::{ChunkOutcome, CompletedFile, FailedTransfer, TableConfig, TransferTable};
pub use types::{Chunk, Direction, Transfer, TransferDeclaration, TransferState};
pub use validation::{ExtensionPolicy, safe_filename};

use l4d2_bridge_protocol::ErrorCode;

/// Default chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = l4d2_bridge_protocol::constants::WS_CHUNK_SIZE;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("inconsistent transfer: {0}")]
    Inconsistent(String),

    #[error("invalid declaration: {0}")]
    InvalidDeclaration(String),

    #[error("file too large: {size} > {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("extension not allowed: {0}")]
    ExtensionRejected(String),

    #[error("transfer timed out")]
    TimedOut,

    #[error("transfer aborted: {0}")]
    Aborted(ErrorCode),

    #[error("transfer not found: {0}")]
    NotFound(String),
}

impl TransferError {
    /// Wire code reported to the peer and to the command layer.
    pub fn code(&self) -> ErrorCode {
        match self {
            TransferError::Io(_) => ErrorCode::Internal,
            TransferError::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            TransferError::Inconsistent(_) => ErrorCode::TransferInconsistent,
            TransferError::InvalidDeclaration(_) => ErrorCode::InvalidPayload,
            TransferError::TooLarge { .. } => ErrorCode::FileTooLarge,
            TransferError::ExtensionRejected(_) => ErrorCode::ExtensionRejected,
            TransferError::TimedOut => ErrorCode::TransferTimeout,
            TransferError::Aborted(code) => *code,
            TransferError::NotFound(_) => ErrorCode::FileNotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(
            TransferError::ChecksumMismatch {
                expected: "a".into(),
                actual: "b".into()
            }
            .code(),
            ErrorCode::ChecksumMismatch
        );
        assert_eq!(TransferError::TimedOut.code(), ErrorCode::TransferTimeout);
        assert_eq!(
            TransferError::Aborted(ErrorCode::Superseded).code(),
            ErrorCode::Superseded
        );
        assert_eq!(
            TransferError::ExtensionRejected("exe".into()).code(),
            ErrorCode::ExtensionRejected
        );
    }
}
