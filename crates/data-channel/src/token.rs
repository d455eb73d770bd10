//! File id generation and token validation.

use rand::Rng;

/// File id length in bytes (produces 16 hex characters).
const FILE_ID_BYTES: usize = 8;

/// Longest file id accepted on download.
const MAX_FILE_ID_LEN: usize = 32;

/// Generates a CSPRNG file id as a 16-character lowercase hex string.
pub fn generate_file_id() -> String {
    let mut bytes = [0u8; FILE_ID_BYTES];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Whether `id` looks like a file id: 1 to 32 lowercase hex characters.
pub fn is_valid_file_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_FILE_ID_LEN
        && id.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Validates a received token against the expected value.
///
/// Uses constant-time comparison to prevent timing attacks.
pub fn validate_token(received: &str, expected: &str) -> bool {
    if received.len() != expected.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in received.bytes().zip(expected.bytes()) {
        diff |= a ^ b;
    }
    diff == 0
}
