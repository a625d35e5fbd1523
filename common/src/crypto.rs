//! Common cryptography helper functions for Agora

use crate::hash::Hash;
use blake2::{digest::consts::U32, Blake2b, Digest};
use cryptoxide::ed25519::{self, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Get a Blake2b-256 hash of arbitrary content
pub fn content_hash(data: &[u8]) -> Hash<32> {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(data);
    let digest: [u8; 32] = hasher.finalize().into();
    Hash::new(digest)
}

/// Ed25519 public key. Can be used to verify a [`Signature`] produced by
/// the matching [`Keypair`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "serde_bytes_hex")] [u8; PUBLIC_KEY_LENGTH]);

/// Ed25519 signature over a message.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes_hex")] [u8; SIGNATURE_LENGTH]);

/// Ed25519 signing keypair, expanded from a 32-byte seed.
#[derive(Clone)]
pub struct Keypair {
    keypair: [u8; ed25519::KEYPAIR_LENGTH],
    public: PublicKey,
}

impl Keypair {
    /// Derive a keypair from a 32-byte seed.
    pub fn from_seed(seed: &[u8; ed25519::SEED_LENGTH]) -> Self {
        let (keypair, public) = ed25519::keypair(seed);
        Self {
            keypair,
            public: PublicKey(public),
        }
    }

    /// The public half of this keypair.
    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// Sign a message.
    pub fn sign<T: AsRef<[u8]>>(&self, message: T) -> Signature {
        Signature(ed25519::signature(message.as_ref(), &self.keypair))
    }
}

impl PublicKey {
    /// Verify the cryptographic [`Signature`] against the `message` and the
    /// [`PublicKey`] `self`.
    #[inline]
    pub fn verify<T>(&self, message: T, signature: &Signature) -> bool
    where
        T: AsRef<[u8]>,
    {
        ed25519::verify(message.as_ref(), &self.0, &signature.0)
    }

    /// The 32-byte hash of this key, used as a validator identity.
    pub fn id(&self) -> Hash<32> {
        content_hash(&self.0)
    }
}

impl Default for Signature {
    fn default() -> Self {
        Self([0u8; SIGNATURE_LENGTH])
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; PUBLIC_KEY_LENGTH]> for PublicKey {
    fn from(bytes: [u8; PUBLIC_KEY_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.as_ref()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&hex::encode(self.as_ref())).finish()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.as_ref()))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signature").field(&hex::encode(self.as_ref())).finish()
    }
}

/// Hex serde for fixed-size byte arrays (serde can't derive these generically).
mod serde_bytes_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        let mut bytes = [0u8; N];
        hex::decode_to_slice(&s, &mut bytes).map_err(serde::de::Error::custom)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_stable() {
        let h1 = content_hash(b"agora");
        let h2 = content_hash(b"agora");
        assert_eq!(h1, h2);
        assert_ne!(h1, content_hash(b"agorb"));
    }

    #[test]
    fn sign_and_verify() {
        let keypair = Keypair::from_seed(&[7u8; 32]);
        let signature = keypair.sign(b"block bytes");
        assert!(keypair.public().verify(b"block bytes", &signature));
        assert!(!keypair.public().verify(b"other bytes", &signature));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let signer = Keypair::from_seed(&[1u8; 32]);
        let other = Keypair::from_seed(&[2u8; 32]);
        let signature = signer.sign(b"payload");
        assert!(!other.public().verify(b"payload", &signature));
    }
}
