//! Webhook payload signing.
//!
//! Scheme: `X-Ruche-Signature: v1={hex(hmac_sha256(secret, "{ts}.{body}"))}`
//! with `X-Ruche-Timestamp` carrying unix seconds. Receivers verify with a
//! constant-time comparison and a 300-second replay tolerance.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use ruche_domain::webhook::REPLAY_TOLERANCE_SECS;

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 over `"{timestamp}.{body}"`.
pub fn sign(secret: &str, timestamp: i64, body: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Full header value: `v1={hex}`.
pub fn signature_header(secret: &str, timestamp: i64, body: &str) -> String {
    format!("v1={}", sign(secret, timestamp, body))
}

/// Receiver-side verification: constant-time signature comparison plus the
/// replay-tolerance window around `now`.
pub fn verify(secret: &str, timestamp: i64, body: &str, header: &str, now: i64) -> bool {
    if (now - timestamp).abs() > REPLAY_TOLERANCE_SECS {
        return false;
    }
    let presented = header.strip_prefix("v1=").unwrap_or(header);
    let expected = sign(secret, timestamp, body);
    expected.as_bytes().ct_eq(presented.as_bytes()).unwrap_u8() == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn signing_is_deterministic() {
        let a = sign(SECRET, 1_700_000_000, r#"{"k":"v"}"#);
        let b = sign(SECRET, 1_700_000_000, r#"{"k":"v"}"#);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn header_prefixed_with_v1() {
        let header = signature_header(SECRET, 1_700_000_000, "{}");
        assert!(header.starts_with("v1="));
    }

    #[test]
    fn verify_accepts_what_sign_produces() {
        let ts = 1_700_000_000;
        let body = r#"{"event":"tool.executed"}"#;
        let header = signature_header(SECRET, ts, body);
        assert!(verify(SECRET, ts, body, &header, ts + 10));
    }

    #[test]
    fn verify_rejects_tampered_body() {
        let ts = 1_700_000_000;
        let header = signature_header(SECRET, ts, "{}");
        assert!(!verify(SECRET, ts, r#"{"x":1}"#, &header, ts));
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let ts = 1_700_000_000;
        let header = signature_header(SECRET, ts, "{}");
        assert!(!verify("another-secret-another-secret-32", ts, "{}", &header, ts));
    }

    #[test]
    fn verify_enforces_replay_window() {
        let ts = 1_700_000_000;
        let header = signature_header(SECRET, ts, "{}");
        assert!(verify(SECRET, ts, "{}", &header, ts + 300));
        assert!(!verify(SECRET, ts, "{}", &header, ts + 301));
        assert!(!verify(SECRET, ts, "{}", &header, ts - 301));
    }

    #[test]
    fn timestamp_participates_in_signature() {
        let h1 = signature_header(SECRET, 1_700_000_000, "{}");
        let h2 = signature_header(SECRET, 1_700_000_001, "{}");
        assert_ne!(h1, h2);
    }
}
