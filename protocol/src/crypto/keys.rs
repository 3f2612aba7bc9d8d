//! # Key Management
//!
//! Ed25519 keys for computors, the arbitrator and local entities.
//!
//! The wire formats carry raw key and signature bytes at fixed offsets, so
//! [`PublicKey`] and [`Signature`] are plain fixed-size arrays. Turning them
//! into dalek types happens at the last possible moment, inside `verify`.
//! A 32-byte field that is not a valid curve point is not a decode error
//! here: it simply fails verification later.
//!
//! ## Security considerations
//!
//! - Private keys are zeroized on drop by ed25519-dalek.
//! - Key bytes are never logged. `Debug` on [`Keypair`] prints the public
//!   half only.

use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

use super::hash::domain_separated_hash;
use crate::config::{PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};

/// Context string for deriving entity secret keys from a seed and an index.
const ENTITY_KEY_CONTEXT: &str = "ticknet 2026-01 entity secret key";

/// Errors that can occur during key operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("seed must not be empty")]
    EmptySeed,

    #[error("invalid public key encoding")]
    InvalidPublicKey,
}

/// A signing identity. Owns the secret half and is not `Clone`.
pub struct Keypair {
    signing_key: SigningKey,
}

/// Raw 32-byte Ed25519 verifying key as it appears on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PublicKey([u8; PUBLIC_KEY_LENGTH]);

/// Raw 64-byte Ed25519 signature as it appears on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_LENGTH]);

impl Keypair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Builds a keypair whose secret key *is* `secret`.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    /// Derives the keypair of entity `index` under `seed`.
    ///
    /// Deterministic: the same seed and index always give the same identity,
    /// and different indices under one seed give unrelated keys.
    pub fn from_seed_index(seed: &str, index: u32) -> Result<Self, KeyError> {
        if seed.is_empty() {
            return Err(KeyError::EmptySeed);
        }
        let mut material = Vec::with_capacity(seed.len() + 4);
        material.extend_from_slice(seed.as_bytes());
        material.extend_from_slice(&index.to_le_bytes());
        let secret = domain_separated_hash(ENTITY_KEY_CONTEXT, &material);
        Ok(Self::from_secret_bytes(&secret))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Signs `message`. Callers sign digests, never whole frames.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair(pub={})", self.public_key().to_hex())
    }
}

// ---------------------------------------------------------------------------
// PublicKey
// ---------------------------------------------------------------------------

impl PublicKey {
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Copies a key out of a wire field. `None` if the slice is not exactly
    /// 32 bytes long.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        slice.try_into().ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.0
    }

    /// The all-zero key. Never a valid identity on this network.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Returns `true` only for a well-formed signature by this key over
    /// `message`. Invalid points and malformed signatures are just `false`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let dalek_signature = DalekSignature::from_bytes(&signature.0);
        verifying_key.verify(message, &dalek_signature).is_ok()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidPublicKey)?;
        Self::from_slice(&bytes).ok_or(KeyError::InvalidPublicKey)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", &self.to_hex()[..16])
    }
}

// Keys travel through config files and JSON APIs as hex strings.
impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

impl Signature {
    pub const fn from_bytes(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        slice.try_into().ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Default for Signature {
    fn default() -> Self {
        Self([0u8; SIGNATURE_LENGTH])
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex_str = self.to_hex();
        write!(f, "Signature({}...{})", &hex_str[..8], &hex_str[120..])
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}
