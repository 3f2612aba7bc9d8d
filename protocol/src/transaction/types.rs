//! The transaction wire layout and its decoded form.
//!
//! ```text
//! offset 0    source        32 bytes
//! offset 32   destination   32 bytes
//! offset 64   energy        u64 LE
//! offset 72   tick          u32 LE
//! offset 76   input type    u16 LE
//! offset 78   input size    u16 LE
//! offset 80   input         input-size bytes
//! ...         signature     64 bytes, by `source` over the digest of the above
//! ```
//!
//! Unlike ticks and computor sets, a transaction has one variable-length
//! region, so the signature offset depends on the declared input size.

use serde::Serialize;
use std::fmt;

use super::verification::TransactionError;
use crate::codec::hex_serde;
use crate::codec::{Bytes, Field};
use crate::config::{
    MAX_ENERGY_AMOUNT, MAX_INPUT_SIZE, MAX_TRANSACTION_SIZE, MIN_TRANSACTION_SIZE, NONCE_LENGTH,
    PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH, TRANSACTION_HEADER_LENGTH,
};
use crate::crypto::{digest, Digest, PublicKey, Signature};

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

const SOURCE: Bytes = Bytes::at(0, PUBLIC_KEY_LENGTH);
const DESTINATION: Bytes = Bytes::after_bytes(&SOURCE, PUBLIC_KEY_LENGTH);
const ENERGY: Field<u64> = Field::after_bytes(&DESTINATION);
const TICK: Field<u32> = Field::after(&ENERGY);
const INPUT_TYPE: Field<u16> = Field::after(&TICK);
const INPUT_SIZE: Field<u16> = Field::after(&INPUT_TYPE);
pub(crate) const INPUT_OFFSET: usize = INPUT_SIZE.end();

const _: () = assert!(INPUT_OFFSET == TRANSACTION_HEADER_LENGTH);

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// A decoded, signed transaction.
///
/// `digest` is the hash of every byte before the signature. It is what the
/// source signs and what identifies the transaction in events and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transaction {
    pub source: PublicKey,
    pub destination: PublicKey,
    pub energy: u64,
    pub tick: u32,
    pub input_type: u16,
    #[serde(serialize_with = "hex_serde::serialize")]
    pub input: Vec<u8>,
    pub signature: Signature,
    #[serde(serialize_with = "hex_serde::serialize")]
    pub digest: Digest,
}

impl Transaction {
    /// Decodes `bytes` without checking the signature.
    ///
    /// The buffer must be exactly as long as its declared input size says,
    /// inside the protocol size bounds, with energy within range.
    pub fn decode(bytes: &[u8]) -> Result<Self, TransactionError> {
        if bytes.len() < MIN_TRANSACTION_SIZE || bytes.len() > MAX_TRANSACTION_SIZE {
            return Err(TransactionError::InvalidSize(bytes.len()));
        }
        let input_size = usize::from(INPUT_SIZE.read(bytes));
        if input_size > MAX_INPUT_SIZE {
            return Err(TransactionError::InputTooLarge(input_size));
        }
        let declared = MIN_TRANSACTION_SIZE + input_size;
        if declared != bytes.len() {
            return Err(TransactionError::SizeMismatch {
                declared,
                actual: bytes.len(),
            });
        }
        let energy = ENERGY.read(bytes);
        if energy > MAX_ENERGY_AMOUNT {
            return Err(TransactionError::EnergyOutOfRange(energy));
        }

        let input = Bytes::at(INPUT_OFFSET, input_size);
        let signature = Bytes::after_bytes(&input, SIGNATURE_LENGTH);
        Ok(Self {
            source: PublicKey::from_bytes(SOURCE.read_array(bytes)),
            destination: PublicKey::from_bytes(DESTINATION.read_array(bytes)),
            energy,
            tick: TICK.read(bytes),
            input_type: INPUT_TYPE.read(bytes),
            input: input.slice(bytes).to_vec(),
            signature: Signature::from_bytes(signature.read_array(bytes)),
            digest: digest(&bytes[..signature.offset]),
        })
    }

    /// Canonical wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.unsigned_bytes();
        out.extend_from_slice(self.signature.as_bytes());
        out
    }

    /// Everything the signature covers.
    pub(crate) fn unsigned_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; INPUT_OFFSET];
        SOURCE.write(&mut out, self.source.as_bytes());
        DESTINATION.write(&mut out, self.destination.as_bytes());
        ENERGY.write(&mut out, self.energy);
        TICK.write(&mut out, self.tick);
        INPUT_TYPE.write(&mut out, self.input_type);
        INPUT_SIZE.write(&mut out, self.input.len() as u16);
        out.extend_from_slice(&self.input);
        out
    }

    pub fn encoded_len(&self) -> usize {
        MIN_TRANSACTION_SIZE + self.input.len()
    }

    /// Checks the signature against `source`.
    pub fn verify(&self) -> Result<(), TransactionError> {
        if self.source.verify(&self.digest, &self.signature) {
            Ok(())
        } else {
            Err(TransactionError::InvalidSignature)
        }
    }

    /// The input read as a resource-test nonce, when it has exactly the
    /// right size.
    pub fn nonce(&self) -> Option<[u8; NONCE_LENGTH]> {
        self.input.as_slice().try_into().ok()
    }

    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }
}

/// Lowercase hex of the wire bytes.
impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.encode()))
    }
}
