//! Identifier, nonce and clock helpers.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::constants::MAX_SERVER_ID_LEN;

/// Nonce length in bytes (produces 32 hex characters).
const NONCE_BYTES: usize = 16;

/// Generates a random 16-character message id.
pub fn new_msg_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// Generates a random 32-character id for transfers and tasks.
pub fn new_long_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Generates a CSPRNG nonce as a lowercase hex string.
pub fn new_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Current wall clock time in Unix seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn is_server_id_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.' || c == '-'
}

/// Normalizes an agent-supplied server id.
///
/// Disallowed characters become `_`, the result is capped at 64 characters,
/// and an empty id becomes `unknown`.
pub fn sanitize_server_id(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if is_server_id_char(c) { c } else { '_' })
        .take(MAX_SERVER_ID_LEN)
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_id_shape() {
        let id = new_msg_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_msg_id());
    }

    #[test]
    fn nonce_shape() {
        let nonce = new_nonce();
        assert_eq!(nonce.len(), 32);
        assert_ne!(nonce, new_nonce());
    }

    #[test]
    fn sanitize_keeps_valid_ids() {
        assert_eq!(sanitize_server_id("server-1"), "server-1");
        assert_eq!(sanitize_server_id("eu.coop_2"), "eu.coop_2");
    }

    #[test]
    fn sanitize_replaces_and_truncates() {
        assert_eq!(sanitize_server_id("a b/c"), "a_b_c");
        assert_eq!(sanitize_server_id(""), "unknown");
        let long = "x".repeat(100);
        assert_eq!(sanitize_server_id(&long).len(), MAX_SERVER_ID_LEN);
    }

    #[test]
    fn unix_now_is_recent() {
        assert!(unix_now() > 1_600_000_000);
    }
}
