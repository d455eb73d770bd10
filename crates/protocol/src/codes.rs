use serde::{Deserialize, Serialize};

/// Numeric error codes carried in ERROR payloads, task results and
/// disconnect notices.
///
/// Codes are grouped by the scope of the failure: 1xxx auth and liveness
/// (connection-fatal, except duplicates), 2xxx malformed input, 3xxx
/// transfer-fatal, 4xxx routing, 5xxx internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum ErrorCode {
    AuthInvalidSignature,
    InvalidSignature,
    AuthExpiredTimestamp,
    DuplicateMessage,
    AuthTimeout,
    HeartbeatTimeout,
    Superseded,
    Disconnected,
    InvalidPayload,
    FileTooLarge,
    ExtensionRejected,
    FileNotFound,
    ChecksumMismatch,
    TransferInconsistent,
    TransferTimeout,
    ServerUnknown,
    Internal,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            Self::AuthInvalidSignature => 1001,
            Self::InvalidSignature => 1002,
            Self::AuthExpiredTimestamp => 1003,
            Self::DuplicateMessage => 1004,
            Self::AuthTimeout => 1005,
            Self::HeartbeatTimeout => 1006,
            Self::Superseded => 1007,
            Self::Disconnected => 1008,
            Self::InvalidPayload => 2001,
            Self::FileTooLarge => 3001,
            Self::ExtensionRejected => 3002,
            Self::FileNotFound => 3003,
            Self::ChecksumMismatch => 3004,
            Self::TransferInconsistent => 3005,
            Self::TransferTimeout => 3006,
            Self::ServerUnknown => 4004,
            Self::Internal => 5000,
        }
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            1001 => Self::AuthInvalidSignature,
            1002 => Self::InvalidSignature,
            1003 => Self::AuthExpiredTimestamp,
            1004 => Self::DuplicateMessage,
            1005 => Self::AuthTimeout,
            1006 => Self::HeartbeatTimeout,
            1007 => Self::Superseded,
            1008 => Self::Disconnected,
            2001 => Self::InvalidPayload,
            3001 => Self::FileTooLarge,
            3002 => Self::ExtensionRejected,
            3003 => Self::FileNotFound,
            3004 => Self::ChecksumMismatch,
            3005 => Self::TransferInconsistent,
            3006 => Self::TransferTimeout,
            4004 => Self::ServerUnknown,
            5000 => Self::Internal,
            _ => return None,
        })
    }

    /// Symbolic name used in logs and event reasons.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthInvalidSignature => "AUTH_INVALID_SIGNATURE",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::AuthExpiredTimestamp => "AUTH_EXPIRED_TIMESTAMP",
            Self::DuplicateMessage => "DUPLICATE_MESSAGE",
            Self::AuthTimeout => "AUTH_TIMEOUT",
            Self::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
            Self::Superseded => "SUPERSEDED",
            Self::Disconnected => "DISCONNECTED",
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::FileTooLarge => "FILE_TOO_LARGE",
            Self::ExtensionRejected => "EXTENSION_REJECTED",
            Self::FileNotFound => "FILE_NOT_FOUND",
            Self::ChecksumMismatch => "CHECKSUM_MISMATCH",
            Self::TransferInconsistent => "TRANSFER_INCONSISTENT",
            Self::TransferTimeout => "TRANSFER_TIMEOUT",
            Self::ServerUnknown => "SERVER_UNKNOWN",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether a failure with this code ends the connection.
    pub fn is_connection_fatal(self) -> bool {
        matches!(
            self,
            Self::AuthInvalidSignature
                | Self::AuthExpiredTimestamp
                | Self::AuthTimeout
                | Self::HeartbeatTimeout
                | Self::Superseded
        )
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        code.as_u16()
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        ErrorCode::from_u16(code).ok_or_else(|| format!("unknown error code {code}"))
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_number() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::ChecksumMismatch).unwrap(),
            "3004"
        );
        let code: ErrorCode = serde_json::from_str("1001").unwrap();
        assert_eq!(code, ErrorCode::AuthInvalidSignature);
    }

    #[test]
    fn unknown_number_fails() {
        assert!(serde_json::from_str::<ErrorCode>("42").is_err());
        assert_eq!(ErrorCode::from_u16(0), None);
    }

    #[test]
    fn u16_mapping_is_bijective() {
        for n in 0..=u16::MAX {
            if let Some(code) = ErrorCode::from_u16(n) {
                assert_eq!(code.as_u16(), n);
            }
        }
    }

    #[test]
    fn fatality_classes() {
        assert!(ErrorCode::HeartbeatTimeout.is_connection_fatal());
        assert!(ErrorCode::AuthTimeout.is_connection_fatal());
        assert!(!ErrorCode::ChecksumMismatch.is_connection_fatal());
        assert!(!ErrorCode::DuplicateMessage.is_connection_fatal());
        assert!(!ErrorCode::ServerUnknown.is_connection_fatal());
    }

    #[test]
    fn display_includes_name_and_number() {
        assert_eq!(
            ErrorCode::TransferTimeout.to_string(),
            "TRANSFER_TIMEOUT (3006)"
        );
    }
}
