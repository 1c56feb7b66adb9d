use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;

/// Room-code alphabet: 32 characters, no `I`, `O`, `0`, `1` (spec.md §6).
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Injectable CSPRNG capability (C4). Room codes and guest tokens are the
/// only things in the core that need randomness; both are expressed in
/// terms of this trait so tests can supply a deterministic sequence.
pub trait Random: Send + Sync {
    fn fill_bytes(&self, buf: &mut [u8]);

    fn room_code(&self, length: usize) -> String {
        let mut idx_bytes = vec![0u8; length];
        self.fill_bytes(&mut idx_bytes);
        idx_bytes
            .into_iter()
            .map(|b| ROOM_CODE_ALPHABET[(b as usize) % ROOM_CODE_ALPHABET.len()] as char)
            .collect()
    }

    fn guest_token(&self, length_bytes: usize) -> String {
        let mut buf = vec![0u8; length_bytes];
        self.fill_bytes(&mut buf);
        URL_SAFE_NO_PAD.encode(buf)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl Random for OsRandom {
    fn fill_bytes(&self, buf: &mut [u8]) {
        rand::rng().fill_bytes(buf);
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Deterministic `Random` for tests: replays a fixed cycle of byte
    /// values so room-code collisions / retries can be exercised on demand.
    pub struct ScriptedRandom {
        values: Mutex<std::collections::VecDeque<u8>>,
        fallback: u8,
    }

    impl ScriptedRandom {
        pub fn new(values: impl IntoIterator<Item = u8>) -> Self {
            Self {
                values: Mutex::new(values.into_iter().collect()),
                fallback: 0,
            }
        }
    }

    impl Random for ScriptedRandom {
        fn fill_bytes(&self, buf: &mut [u8]) {
            let mut queue = self.values.lock().unwrap();
            for slot in buf.iter_mut() {
                *slot = queue.pop_front().unwrap_or(self.fallback);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_code_uses_only_allowed_alphabet() {
        let rng = OsRandom;
        let code = rng.room_code(6);
        assert_eq!(code.len(), 6);
        assert!(code.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b)));
    }

    #[test]
    fn guest_token_is_url_safe_and_long_enough() {
        let rng = OsRandom;
        let token = rng.guest_token(32);
        assert!(token.len() >= 40);
        assert!(token.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'));
    }
}
