//! Request signing.
//!
//! Every authenticated request carries a `Timestamp` header (RFC-1123, GMT) and
//! an `X-Signature` header holding the hex HMAC-SHA256 of the signed payload
//! followed by that timestamp. The payload is the request body for POST and the
//! endpoint path (e.g. `/task/get/7`) for GET.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_WORKER_ID: &str = "X-Worker-Id";
pub const HEADER_SIGNATURE: &str = "X-Signature";
pub const HEADER_TIMESTAMP: &str = "Timestamp";

/// Format `time` as an RFC-1123 date, e.g. `Mon, 19 Oct 2026 06:53:00 GMT`.
pub fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Hex HMAC-SHA256 of `payload || timestamp` keyed by `secret`.
pub fn sign(secret: &[u8], payload: &[u8], timestamp: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(payload);
    mac.update(timestamp.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Check a received signature in constant time.
pub fn verify(secret: &[u8], payload: &[u8], timestamp: &str, signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.update(timestamp.as_bytes());
    mac.verify_slice(&expected).is_ok()
}
