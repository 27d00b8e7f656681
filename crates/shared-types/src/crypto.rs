//! # Keys and Signatures
//!
//! Ed25519 keys. Ed25519 has no public-key recovery, so every signature
//! carries the signer key next to the signature bytes; "recovering" a key
//! means verifying the signature against the digest and returning that key.

use crate::errors::TypeError;
use crate::primitives::Digest;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ed25519 public key bytes.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; 32]);

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PUB_ED_{}", hex::encode(&self.0[..6]))
    }
}

/// A signature with the key that produced it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub signer: PublicKey,
    pub bytes: Vec<u8>,
}

impl Signature {
    /// Verify against `digest` and return the signer key.
    pub fn recover(&self, digest: &Digest) -> Result<PublicKey, TypeError> {
        let key = VerifyingKey::from_bytes(&self.signer.0)
            .map_err(|_| TypeError::InvalidPublicKey)?;
        let raw: [u8; 64] = self
            .bytes
            .as_slice()
            .try_into()
            .map_err(|_| TypeError::InvalidSignature)?;
        let sig = ed25519_dalek::Signature::from_bytes(&raw);
        key.verify(digest.as_bytes(), &sig)
            .map_err(|_| TypeError::InvalidSignature)?;
        Ok(self.signer)
    }

    /// Encoded size used for signature-related billing.
    pub fn packed_size(&self) -> usize {
        32 + self.bytes.len()
    }
}

/// Ed25519 signing key.
#[derive(Clone)]
pub struct PrivateKey(SigningKey);

impl PrivateKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        PrivateKey(SigningKey::from_bytes(bytes))
    }

    /// Deterministic key derived from a seed string.
    pub fn from_seed(seed: &str) -> Self {
        Self::from_bytes(&Digest::hash_bytes(seed.as_bytes()).0)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key().to_bytes())
    }

    pub fn sign(&self, digest: &Digest) -> Signature {
        Signature {
            signer: self.public_key(),
            bytes: self.0.sign(digest.as_bytes()).to_bytes().to_vec(),
        }
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey({:?})", self.public_key())
    }
}
