//! # Cryptographic Primitives
//!
//! Thin, typed wrappers over audited crates. Nothing here is novel and
//! nothing here should become novel:
//!
//! - **Ed25519** (`ed25519-dalek`) signs every computor set, tick and
//!   transaction digest.
//! - **BLAKE3** produces every digest.
//! - **SHAKE256** (`sha3`) expands seeds into the resource-test tape.

pub mod hash;
pub mod keys;

pub use hash::{digest, digest_multi, domain_separated_hash, random_tape, short_digest, Digest};
pub use keys::{KeyError, Keypair, PublicKey, Signature};
