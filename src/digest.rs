//! Request signing for the MySmartGrid API.
//!
//! The middleware authenticates uploads by an HMAC-SHA1 over the raw JSON
//! body, keyed by the channel's secret, carried in the `X-Digest` header.

use ring::hmac;

pub const DIGEST_HEADER: &str = "X-Digest";

/// HMAC-SHA1 of `body` under `secret`, as lowercase hex bytes joined by `:`.
pub fn hmac_sha1_hex(secret: &str, body: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, secret.as_bytes());
    let tag = hmac::sign(&key, body);
    tag.as_ref()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}
