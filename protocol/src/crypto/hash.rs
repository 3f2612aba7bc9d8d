//! # Hashing Utilities
//!
//! Two hash shapes are used across ticknet:
//!
//! - **BLAKE3** produces every 32-byte digest: computor-set digests, tick
//!   digests, tick essences and transaction digests. It also provides the
//!   8-byte digests chained by the transaction seen-filter.
//! - **SHAKE256** (an extendable-output sponge) expands a key and a nonce
//!   into an arbitrarily long pseudorandom tape for the resource test.
//!   Every node must produce the same tape for the same inputs, so this one
//!   must never be swapped for a faster RNG.

use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake256;

use crate::config::DIGEST_LENGTH;

/// A 32-byte protocol digest.
pub type Digest = [u8; DIGEST_LENGTH];

/// BLAKE3 digest of `data`.
pub fn digest(data: &[u8]) -> Digest {
    *blake3::hash(data).as_bytes()
}

/// Hashes several slices as if they were concatenated, without allocating.
pub fn digest_multi(parts: &[&[u8]]) -> Digest {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// First 8 bytes of the BLAKE3 output, read as a little-endian integer.
pub fn short_digest(data: &[u8]) -> u64 {
    let mut out = [0u8; 8];
    let mut reader = blake3::Hasher::new().update(data).finalize_xof();
    reader.fill(&mut out);
    u64::from_le_bytes(out)
}

/// Domain-separated BLAKE3, via `derive_key` mode. Two contexts never
/// collide even over identical data.
pub fn domain_separated_hash(context: &str, data: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Fills `out` with the pseudorandom tape seeded by `(key, nonce)`.
///
/// The sponge absorbs `key || nonce` once and is squeezed for as many bytes
/// as requested, so a longer `out` is always an extension of a shorter one.
pub fn random_tape(key: &[u8; 32], nonce: &[u8; 32], out: &mut [u8]) {
    let mut sponge = Shake256::default();
    sponge.update(key);
    sponge.update(nonce);
    let mut reader = sponge.finalize_xof();
    reader.read(out);
}
