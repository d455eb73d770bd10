//! HMAC-SHA256 signing and verification of canonical envelope bytes.
//!
//! Both functions are pure: the caller supplies the clock reading, which
//! keeps the timestamp window testable at its exact boundaries.

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Reasons an envelope fails authentication.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("signature does not match")]
    SignatureInvalid,

    #[error("timestamp {timestamp} is {skew}s away from local clock")]
    TimestampOutOfWindow { timestamp: i64, skew: u64 },

    #[error("unusable signing key")]
    InvalidKey,
}

fn mac(secret: &[u8]) -> Result<HmacSha256, AuthError> {
    <HmacSha256 as Mac>::new_from_slice(secret).map_err(|_| AuthError::InvalidKey)
}

/// Signs `canonical` with `secret`, returning the lowercase hex digest.
pub fn sign(canonical: &[u8], secret: &[u8]) -> Result<String, AuthError> {
    let mut mac = mac(secret)?;
    mac.update(canonical);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verifies a hex `signature` over `canonical` and checks that `timestamp`
/// lies within `window` of `now` (inclusive).
///
/// The digest comparison is constant-time. Signature is checked before the
/// timestamp, so a forged envelope is always reported as such.
pub fn verify(
    canonical: &[u8],
    signature: &str,
    secret: &[u8],
    timestamp: i64,
    now: i64,
    window: Duration,
) -> Result<(), AuthError> {
    let expected = hex::decode(signature).map_err(|_| AuthError::SignatureInvalid)?;
    let mut mac = mac(secret)?;
    mac.update(canonical);
    mac.verify_slice(&expected)
        .map_err(|_| AuthError::SignatureInvalid)?;

    let skew = now.abs_diff(timestamp);
    if skew > window.as_secs() {
        return Err(AuthError::TimestampOutOfWindow { timestamp, skew });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"shared-secret";
    const WINDOW: Duration = Duration::from_secs(30);

    #[test]
    fn sign_then_verify() {
        let sig = sign(b"payload", SECRET).unwrap();
        assert_eq!(sig.len(), 64);
        verify(b"payload", &sig, SECRET, 1000, 1000, WINDOW).unwrap();
    }

    #[test]
    fn flipping_any_payload_byte_fails() {
        let msg = b"1|auth|abc|server-1|1000|n|c|{}".to_vec();
        let sig = sign(&msg, SECRET).unwrap();
        for i in 0..msg.len() {
            let mut tampered = msg.clone();
            tampered[i] ^= 0x01;
            assert_eq!(
                verify(&tampered, &sig, SECRET, 1000, 1000, WINDOW),
                Err(AuthError::SignatureInvalid),
                "byte {i}"
            );
        }
    }

    #[test]
    fn flipping_any_signature_char_fails() {
        let sig = sign(b"payload", SECRET).unwrap();
        for i in 0..sig.len() {
            let mut chars: Vec<char> = sig.chars().collect();
            chars[i] = if chars[i] == '0' { '1' } else { '0' };
            let tampered: String = chars.into_iter().collect();
            assert!(verify(b"payload", &tampered, SECRET, 0, 0, WINDOW).is_err());
        }
    }

    #[test]
    fn wrong_secret_fails() {
        let sig = sign(b"payload", SECRET).unwrap();
        assert_eq!(
            verify(b"payload", &sig, b"other", 0, 0, WINDOW),
            Err(AuthError::SignatureInvalid)
        );
    }

    #[test]
    fn non_hex_signature_fails() {
        assert_eq!(
            verify(b"payload", "not-hex", SECRET, 0, 0, WINDOW),
            Err(AuthError::SignatureInvalid)
        );
    }

    #[test]
    fn window_boundary_is_inclusive() {
        let sig = sign(b"m", SECRET).unwrap();
        let now = 10_000;
        verify(b"m", &sig, SECRET, now - 30, now, WINDOW).unwrap();
        verify(b"m", &sig, SECRET, now + 30, now, WINDOW).unwrap();
        assert_eq!(
            verify(b"m", &sig, SECRET, now - 31, now, WINDOW),
            Err(AuthError::TimestampOutOfWindow {
                timestamp: now - 31,
                skew: 31
            })
        );
        assert!(verify(b"m", &sig, SECRET, now + 31, now, WINDOW).is_err());
    }

    #[test]
    fn forged_stale_message_reports_signature() {
        assert_eq!(
            verify(b"m", &"00".repeat(32), SECRET, 0, 10_000, WINDOW),
            Err(AuthError::SignatureInvalid)
        );
    }
}
