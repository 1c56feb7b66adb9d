pub mod assessment;
pub mod quiz;
pub mod session;
pub mod tenant;

pub use assessment::*;
pub use quiz::*;
pub use session::*;
pub use tenant::*;

use sha2::{Digest, Sha256};

/// Hashes a guest token for storage/lookup, mirroring the teacher's
/// `hash_token` pattern for bearer tokens — we never persist the raw
/// secret, only this digest, and compare hashes in constant time at the
/// call site via `subtle`.
pub fn hash_guest_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_guest_token_is_deterministic_and_hex() {
        let a = hash_guest_token("secret-token");
        let b = hash_guest_token("secret-token");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_guest_token_differs_per_input() {
        assert_ne!(hash_guest_token("a"), hash_guest_token("b"));
    }
}
