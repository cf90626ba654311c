//! HMAC-SHA256 callback signatures.
//!
//! The signed message is `"<unix_timestamp>.<payload>"`; the signature is
//! carried as `v1=<hex digest>`.

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const TIMESTAMP_HEADER: &str = "X-Job-Timestamp";
pub const SIGNATURE_HEADER: &str = "X-Job-Signature";
pub const SIGNATURE_VERSION: &str = "v1";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("signing key rejected")]
    InvalidKey,

    #[error("signature header is malformed")]
    Malformed,

    #[error("timestamp is {skew_sec}s away from now")]
    Expired { skew_sec: i64 },

    #[error("signature does not match")]
    Mismatch,
}

fn mac_for(secret: &[u8], timestamp: i64, payload: &str) -> Result<HmacSha256, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::InvalidKey)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    Ok(mac)
}

/// Sign `payload` at `timestamp` (unix seconds).
pub fn sign(payload: &str, secret: &[u8], timestamp: i64) -> Result<String, SignatureError> {
    let mac = mac_for(secret, timestamp, payload)?;
    Ok(format!(
        "{SIGNATURE_VERSION}={}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Verify a signature produced by [`sign`].
///
/// The digest comparison is constant time. Timestamps further than
/// `tolerance` from `now` are rejected before the digest is checked.
pub fn verify(
    payload: &str,
    secret: &[u8],
    timestamp: i64,
    signature: &str,
    now: i64,
    tolerance: Duration,
) -> Result<(), SignatureError> {
    if now.abs_diff(timestamp) > tolerance.as_secs() {
        return Err(SignatureError::Expired {
            skew_sec: now.saturating_sub(timestamp),
        });
    }

    let digest_hex = signature
        .trim()
        .strip_prefix(SIGNATURE_VERSION)
        .and_then(|rest| rest.strip_prefix('='))
        .ok_or(SignatureError::Malformed)?;
    let digest = hex::decode(digest_hex).map_err(|_| SignatureError::Malformed)?;

    mac_for(secret, timestamp, payload)?
        .verify_slice(&digest)
        .map_err(|_| SignatureError::Mismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"whsec_test";
    const TOLERANCE: Duration = Duration::from_secs(300);

    #[test]
    fn sign_then_verify() {
        let payload = r#"{"id":"j1","status":"succeeded"}"#;
        let sig = sign(payload, SECRET, 1_700_000_000).unwrap();
        assert!(sig.starts_with("v1="));
        assert_eq!(sig.len(), 3 + 64);
        verify(payload, SECRET, 1_700_000_000, &sig, 1_700_000_010, TOLERANCE).unwrap();
    }

    #[test]
    fn wrong_secret_or_payload_fails() {
        let payload = r#"{"id":"j1"}"#;
        let sig = sign(payload, SECRET, 1_700_000_000).unwrap();
        assert_eq!(
            verify(payload, b"other", 1_700_000_000, &sig, 1_700_000_000, TOLERANCE),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify(r#"{"id":"j2"}"#, SECRET, 1_700_000_000, &sig, 1_700_000_000, TOLERANCE),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn timestamp_is_part_of_the_signature() {
        let payload = "{}";
        let sig = sign(payload, SECRET, 1_700_000_000).unwrap();
        assert_eq!(
            verify(payload, SECRET, 1_700_000_001, &sig, 1_700_000_001, TOLERANCE),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn outside_tolerance_fails() {
        let payload = "{}";
        let sig = sign(payload, SECRET, 1_700_000_000).unwrap();
        assert!(matches!(
            verify(payload, SECRET, 1_700_000_000, &sig, 1_700_000_301, TOLERANCE),
            Err(SignatureError::Expired { skew_sec: 301 })
        ));
        assert!(matches!(
            verify(payload, SECRET, 1_700_000_000, &sig, 1_699_999_000, TOLERANCE),
            Err(SignatureError::Expired { .. })
        ));
        verify(payload, SECRET, 1_700_000_000, &sig, 1_700_000_300, TOLERANCE).unwrap();
    }

    #[test]
    fn extreme_timestamps_are_expired() {
        let now = 1_700_000_000;
        assert_eq!(
            verify("{}", SECRET, i64::MIN, "v1=00", now, TOLERANCE),
            Err(SignatureError::Expired { skew_sec: i64::MAX })
        );
        assert_eq!(
            verify("{}", SECRET, i64::MAX, "v1=00", now, TOLERANCE),
            Err(SignatureError::Expired {
                skew_sec: now - i64::MAX
            })
        );
        assert!(matches!(
            verify("{}", SECRET, i64::MAX, "v1=00", i64::MIN, TOLERANCE),
            Err(SignatureError::Expired { skew_sec: i64::MIN })
        ));
    }

    #[test]
    fn malformed_header() {
        assert_eq!(
            verify("{}", SECRET, 0, "v0=abcd", 0, TOLERANCE),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify("{}", SECRET, 0, "v1=zz", 0, TOLERANCE),
            Err(SignatureError::Malformed)
        );
    }
}
