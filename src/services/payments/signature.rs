//! HMAC-SHA256 webhook signatures over `"{timestamp}.{payload}"`.
//!
//! Two header layouts are accepted: Stripe's `Stripe-Signature: t=..,v1=..`
//! and a plain `x-timestamp` / `x-signature` pair used by the sandbox.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::ServiceError;

type HmacSha256 = Hmac<Sha256>;

pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";
pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const SIGNATURE_HEADER: &str = "x-signature";

fn mac_for(secret: &str, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, ServiceError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::InternalError(format!("invalid webhook secret: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

/// Hex signature of `payload` at `timestamp`.
pub fn sign(secret: &str, timestamp: i64, payload: &[u8]) -> Result<String, ServiceError> {
    Ok(hex::encode(mac_for(secret, timestamp, payload)?.finalize().into_bytes()))
}

/// `Stripe-Signature` header value for `payload` at `timestamp`.
pub fn stripe_header(secret: &str, timestamp: i64, payload: &[u8]) -> Result<String, ServiceError> {
    Ok(format!("t={},v1={}", timestamp, sign(secret, timestamp, payload)?))
}

/// Checks one candidate signature in constant time.
fn verify_one(
    secret: &str,
    timestamp: i64,
    payload: &[u8],
    candidate_hex: &str,
) -> Result<bool, ServiceError> {
    let Ok(candidate) = hex::decode(candidate_hex) else {
        return Ok(false);
    };
    Ok(mac_for(secret, timestamp, payload)?
        .verify_slice(&candidate)
        .is_ok())
}

fn check_tolerance(timestamp: i64, now: i64, tolerance_secs: u64) -> Result<(), ServiceError> {
    if (now - timestamp).unsigned_abs() > tolerance_secs {
        return Err(ServiceError::InvalidSignature(
            "timestamp outside tolerance".into(),
        ));
    }
    Ok(())
}

/// Verifies `Stripe-Signature`. Any `v1` entry may match, which lets the
/// provider roll secrets.
pub fn verify_stripe(
    headers: &HeaderMap,
    payload: &[u8],
    secret: &str,
    tolerance_secs: u64,
    now: i64,
) -> Result<(), ServiceError> {
    let header = headers
        .get(STRIPE_SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| ServiceError::InvalidSignature("missing Stripe-Signature".into()))?;

    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }
    let timestamp =
        timestamp.ok_or_else(|| ServiceError::InvalidSignature("missing timestamp".into()))?;
    check_tolerance(timestamp, now, tolerance_secs)?;

    for candidate in candidates {
        if verify_one(secret, timestamp, payload, candidate)? {
            return Ok(());
        }
    }
    Err(ServiceError::InvalidSignature("signature mismatch".into()))
}

/// Verifies the `x-timestamp` / `x-signature` pair.
pub fn verify_plain(
    headers: &HeaderMap,
    payload: &[u8],
    secret: &str,
    tolerance_secs: u64,
    now: i64,
) -> Result<(), ServiceError> {
    let get = |name: &str| headers.get(name).and_then(|h| h.to_str().ok());
    let (Some(ts), Some(signature)) = (get(TIMESTAMP_HEADER), get(SIGNATURE_HEADER)) else {
        return Err(ServiceError::InvalidSignature(
            "missing signature headers".into(),
        ));
    };
    let timestamp = ts
        .parse::<i64>()
        .map_err(|_| ServiceError::InvalidSignature("malformed timestamp".into()))?;
    check_tolerance(timestamp, now, tolerance_secs)?;

    if verify_one(secret, timestamp, payload, signature)? {
        Ok(())
    } else {
        Err(ServiceError::InvalidSignature("signature mismatch".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "whsec_test_secret";

    fn stripe_headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(STRIPE_SIGNATURE_HEADER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn stripe_signature_round_trip() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = stripe_header(SECRET, 1_700_000_000, payload).unwrap();
        assert!(verify_stripe(&stripe_headers(&header), payload, SECRET, 300, 1_700_000_100).is_ok());
    }

    #[test]
    fn stripe_signature_rejects_tampered_payload() {
        let header = stripe_header(SECRET, 1_700_000_000, b"original").unwrap();
        let err = verify_stripe(&stripe_headers(&header), b"tampered", SECRET, 300, 1_700_000_000)
            .unwrap_err();
        assert_eq!(err.code(), "invalid_signature");
    }

    #[test]
    fn stripe_signature_rejects_stale_timestamp() {
        let header = stripe_header(SECRET, 1_700_000_000, b"p").unwrap();
        assert!(verify_stripe(&stripe_headers(&header), b"p", SECRET, 300, 1_700_000_301).is_err());
    }

    #[test]
    fn stripe_signature_accepts_any_matching_v1() {
        let good = sign(SECRET, 1_700_000_000, b"p").unwrap();
        let header = format!("t=1700000000,v1=deadbeef,v1={}", good);
        assert!(verify_stripe(&stripe_headers(&header), b"p", SECRET, 300, 1_700_000_000).is_ok());
    }

    #[test]
    fn plain_signature_requires_both_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(TIMESTAMP_HEADER, HeaderValue::from_static("1700000000"));
        assert!(verify_plain(&headers, b"p", SECRET, 300, 1_700_000_000).is_err());

        let sig = sign(SECRET, 1_700_000_000, b"p").unwrap();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&sig).unwrap());
        assert!(verify_plain(&headers, b"p", SECRET, 300, 1_700_000_000).is_ok());
    }
}
