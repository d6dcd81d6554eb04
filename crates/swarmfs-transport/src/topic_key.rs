//! Topic key derivation (§4.7, §6).
//!
//! A topic key is the sole capability for swarm membership — anyone who
//! holds it can both announce and discover peers on that topic. Two
//! derivation modes are accepted: a deterministic, publicly guessable hash
//! of the topic name (the default, for public topics anyone can compute
//! their way into), or a password-derived key for private topics that only
//! password holders should be able to join.

use crate::error::TransportError;
use argon2::{Algorithm, Argon2, Params, Version};

/// A 32-byte capability: possession grants swarm membership on a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TopicKey(pub [u8; 32]);

impl TopicKey {
    /// Derive the default, publicly guessable key for a topic name.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self(*blake3::hash(name.as_bytes()).as_bytes())
    }

    /// Derive a private topic key from a password, salted with the topic
    /// name so the same password yields different keys on different
    /// topics.
    ///
    /// # Errors
    ///
    /// Returns an error if Argon2id parameter construction or the
    /// derivation itself fails.
    pub fn from_password(name: &str, password: &[u8]) -> Result<Self, TransportError> {
        let salt = format!("swarmfs:topic:{name}");
        let params = Params::new(19_456, 2, 1, Some(32))
            .map_err(|e| TransportError::KeyDerivation(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut out = [0u8; 32];
        argon2
            .hash_password_into(password, salt.as_bytes(), &mut out)
            .map_err(|e| TransportError::KeyDerivation(e.to_string()))?;
        Ok(Self(out))
    }

    /// Raw bytes of this key.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for TopicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_derivation_is_deterministic() {
        assert_eq!(TopicKey::from_name("alpha"), TopicKey::from_name("alpha"));
        assert_ne!(TopicKey::from_name("alpha"), TopicKey::from_name("beta"));
    }

    #[test]
    fn password_derivation_is_salted_by_topic_name() {
        let a = TopicKey::from_password("alpha", b"hunter2").unwrap();
        let b = TopicKey::from_password("beta", b"hunter2").unwrap();
        assert_ne!(a, b);

        let a_again = TopicKey::from_password("alpha", b"hunter2").unwrap();
        assert_eq!(a, a_again);
    }

    #[test]
    fn different_password_yields_different_key() {
        let a = TopicKey::from_password("alpha", b"hunter2").unwrap();
        let b = TopicKey::from_password("alpha", b"correct-horse").unwrap();
        assert_ne!(a, b);
    }
}
