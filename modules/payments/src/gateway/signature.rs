//! HMAC-SHA256 webhook signature schemes shared by the drivers

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Default replay window for timestamped signatures, in seconds
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Hex-encoded HMAC-SHA256 of `payload`
pub fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> String {
    // HMAC accepts keys of any length, so this cannot fail
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time byte comparison
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Verify a plain hex HMAC over the raw body
pub fn verify_body_hmac(payload: &[u8], signature: &str, secret: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Ok(received) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(expected) = hex::decode(hmac_sha256_hex(secret, payload)) else {
        return false;
    };
    constant_time_eq(&received, &expected)
}

/// Verify a `t=<unix>,v1=<hex>` signature computed over `"{t}.{body}"`
pub fn verify_timestamped(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now_unix: i64,
) -> bool {
    if secret.is_empty() {
        return false;
    }

    let parts: Vec<&str> = header.split(',').map(str::trim).collect();
    let Some(timestamp) = parts.iter().find_map(|p| p.strip_prefix("t=")) else {
        return false;
    };
    let Some(received) = parts.iter().find_map(|p| p.strip_prefix("v1=")) else {
        return false;
    };

    let Ok(sent_at) = timestamp.parse::<i64>() else {
        return false;
    };
    if (now_unix - sent_at).abs() > tolerance_secs {
        return false;
    }

    let mut signed = Vec::with_capacity(timestamp.len() + 1 + payload.len());
    signed.extend_from_slice(timestamp.as_bytes());
    signed.push(b'.');
    signed.extend_from_slice(payload);

    verify_body_hmac(&signed, received, secret)
}

/// Build a `t=..,v1=..` header. Used by tests and local tooling.
pub fn sign_timestamped(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let mut signed = format!("{}.", timestamp).into_bytes();
    signed.extend_from_slice(payload);
    format!("t={},v1={}", timestamp, hmac_sha256_hex(secret, &signed))
}
