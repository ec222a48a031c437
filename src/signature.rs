//! HMAC signature verification for inbound webhooks (§4.1).
//!
//! Two schemes, selected per provider: a plain HMAC over the raw body, or an
//! HMAC over `v1:<timestamp>:<body>` with a bounded clock skew. Both use a
//! constant-time comparison of the decoded digest.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::model::Provider;

type HmacSha256 = Hmac<Sha256>;

const MAX_TIMESTAMP_SKEW_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("missing signature header")]
    MissingHeader,
    #[error("signature header was not valid hex")]
    BadEncoding,
    #[error("signature did not match")]
    BadSignature,
    #[error("missing or invalid timestamp header")]
    MissingTimestamp,
    #[error("timestamp outside the allowed window")]
    StaleTimestamp,
}

pub type Result<T> = std::result::Result<T, SignatureError>;

/// Which header(s) carry the signature for a given provider, and how the MAC
/// input is built. Selected once per request by `Provider`, never sniffed.
fn scheme_for(provider: Provider) -> Scheme {
    match provider {
        Provider::Chat => Scheme::TimestampPrefixed,
        Provider::CodeForge | Provider::Tracker | Provider::ErrorMonitor => Scheme::RawBody,
    }
}

enum Scheme {
    RawBody,
    TimestampPrefixed,
}

/// Verify `body` against `signature_hex` (hex-encoded HMAC-SHA256 digest)
/// using `secret`. For the timestamp-prefixed scheme, `timestamp_ms` must
/// also be supplied and within `MAX_TIMESTAMP_SKEW_MS` of now.
pub fn verify(
    provider: Provider,
    secret: &str,
    body: &[u8],
    signature_hex: Option<&str>,
    timestamp_ms: Option<i64>,
) -> Result<()> {
    let signature_hex = signature_hex.ok_or(SignatureError::MissingHeader)?;
    let expected = hex::decode(strip_prefix(signature_hex)).map_err(|_| SignatureError::BadEncoding)?;

    let mac_input: Vec<u8> = match scheme_for(provider) {
        Scheme::RawBody => body.to_vec(),
        Scheme::TimestampPrefixed => {
            let ts = timestamp_ms.ok_or(SignatureError::MissingTimestamp)?;
            if !timestamp_within_window(ts, Utc::now().timestamp_millis()) {
                return Err(SignatureError::StaleTimestamp);
            }
            let mut input = format!("v1:{ts}:").into_bytes();
            input.extend_from_slice(body);
            input
        }
    };

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(&mac_input);
    let computed = mac.finalize().into_bytes();

    if computed.ct_eq(&expected).into() {
        Ok(())
    } else {
        Err(SignatureError::BadSignature)
    }
}

fn strip_prefix(sig: &str) -> &str {
    sig.strip_prefix("sha256=").unwrap_or(sig)
}

fn timestamp_within_window(timestamp_ms: i64, now_ms: i64) -> bool {
    (now_ms - timestamp_ms).abs() <= MAX_TIMESTAMP_SKEW_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, input: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(input);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn raw_body_roundtrip() {
        let secret = "shh";
        let body = br#"{"action":"opened"}"#;
        let sig = sign(secret, body);
        assert!(verify(Provider::CodeForge, secret, body, Some(&sig), None).is_ok());
    }

    #[test]
    fn raw_body_wrong_secret_fails() {
        let body = b"payload";
        let sig = sign("right", body);
        let err = verify(Provider::Tracker, "wrong", body, Some(&sig), None).unwrap_err();
        assert!(matches!(err, SignatureError::BadSignature));
    }

    #[test]
    fn timestamp_prefixed_roundtrip() {
        let secret = "chat-secret";
        let body = b"hello";
        let now = Utc::now().timestamp_millis();
        let input = {
            let mut v = format!("v1:{now}:").into_bytes();
            v.extend_from_slice(body);
            v
        };
        let sig = sign(secret, &input);
        assert!(verify(Provider::Chat, secret, body, Some(&sig), Some(now)).is_ok());
    }

    #[test]
    fn stale_timestamp_rejected() {
        let secret = "chat-secret";
        let body = b"hello";
        let old = Utc::now().timestamp_millis() - 10 * 60 * 1000;
        let input = {
            let mut v = format!("v1:{old}:").into_bytes();
            v.extend_from_slice(body);
            v
        };
        let sig = sign(secret, &input);
        let err = verify(Provider::Chat, secret, body, Some(&sig), Some(old)).unwrap_err();
        assert!(matches!(err, SignatureError::StaleTimestamp));
    }

    #[test]
    fn missing_header_rejected() {
        let err = verify(Provider::CodeForge, "s", b"x", None, None).unwrap_err();
        assert!(matches!(err, SignatureError::MissingHeader));
    }
}
