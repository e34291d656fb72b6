//! HMAC-SHA256 webhook signatures.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn keyed(secret: &str) -> Option<HmacSha256> {
    HmacSha256::new_from_slice(secret.as_bytes()).ok()
}

/// Check a hex signature of `body` under `secret` in constant time.
/// An empty secret never verifies.
pub fn verify_signature(body: &[u8], signature_hex: &str, secret: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Some(mut mac) = keyed(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Hex HMAC-SHA256 of `body`, as the gateway sends it. `None` if the key is rejected.
pub fn sign(body: &[u8], secret: &str) -> Option<String> {
    let mut mac = keyed(secret)?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}
