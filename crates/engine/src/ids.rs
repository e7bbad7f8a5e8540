//! Identifier and bearer-token generation.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;

/// Random row id: `prefix_` plus 24 hex chars.
pub(crate) fn new_id(prefix: &str) -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut id = String::with_capacity(prefix.len() + 1 + bytes.len() * 2);
    id.push_str(prefix);
    id.push('_');
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(id, "{b:02x}");
    }
    id
}

/// Opaque magic token: 32 random bytes, URL-safe base64. Not signed or
/// structured -- validity is a store lookup plus an expiry comparison,
/// so revocation is immediate and needs no blocklist.
pub(crate) fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_prefixed_and_unique() {
        let a = new_id("run");
        let b = new_id("run");
        assert!(a.starts_with("run_"));
        assert_eq!(a.len(), "run_".len() + 24);
        assert_ne!(a, b);
    }

    #[test]
    fn tokens_are_url_safe() {
        let token = generate_token();
        assert!(token.len() >= 40);
        assert!(!token.contains('+') && !token.contains('/') && !token.contains('='));
    }
}
