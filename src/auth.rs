//! src/auth.rs
//!
//! HMAC-SHA256 signing of wire traffic with the shared cluster secret.
//!
//! Signatures are computed over the exact serialized bytes and carried as
//! lowercase hex, either in the `X-Repram-Signature` HTTP header or in the
//! `signature` field of an attachment frame. Verification compares digests,
//! not encodings, so casing in transit does not matter.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HTTP header carrying the hex signature on signed endpoints.
pub const SIGNATURE_HEADER: &str = "x-repram-signature";

/// Signs `payload` with `secret`, returning lowercase hex.
pub fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies a hex signature over `payload`. Constant-time on the digest
/// comparison (via `Mac::verify_slice`); malformed hex fails outright.
pub fn verify(secret: &str, payload: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}
