use data_encoding::{BASE64URL_NOPAD, HEXLOWER};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Random bytes in a session secret.
pub const SECRET_BYTES: usize = 32;

/// The opaque value held in a session cookie. Only its hash is stored, so a
/// database leak does not hand out live sessions.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionSecret(String);

impl SessionSecret {
    /// Generate a fresh secret.
    pub fn generate() -> Self {
        let mut bytes = [0_u8; SECRET_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(BASE64URL_NOPAD.encode(&bytes))
    }

    /// Wrap a value received from a client.
    pub fn from_client(value: &str) -> Self {
        Self(value.to_string())
    }

    /// The value to send to the client.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The value to store and look sessions up by.
    pub fn hash(&self) -> String {
        HEXLOWER.encode(&Sha256::digest(self.0.as_bytes()))
    }
}

// Never log the secret itself.
impl std::fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionSecret(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_unique_and_hash_stably() {
        let a = SessionSecret::generate();
        let b = SessionSecret::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 43);

        let received = SessionSecret::from_client(a.as_str());
        assert_eq!(received.hash(), a.hash());
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash().len(), 64);
        assert_eq!(format!("{a:?}"), "SessionSecret(..)");
    }
}
