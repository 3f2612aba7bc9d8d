//! Building signed transactions for local entities.
//!
//! [`create_transaction`] checks the ranges the wire format cannot express
//! on its own (energy cap, input budget), lays the bytes out, hashes them and
//! signs the digest. The result is ready for broadcast.

use super::types::Transaction;
use super::verification::TransactionError;
use crate::config::{MAX_ENERGY_AMOUNT, MAX_INPUT_SIZE};
use crate::crypto::{digest, Keypair, PublicKey};

/// What a caller specifies; the source is implied by the signing key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionParams {
    pub destination: PublicKey,
    pub energy: u64,
    pub tick: u32,
    pub input_type: u16,
    pub input: Vec<u8>,
}

/// Builds and signs a transaction from `source`.
pub fn create_transaction(
    source: &Keypair,
    params: TransactionParams,
) -> Result<Transaction, TransactionError> {
    if params.energy > MAX_ENERGY_AMOUNT {
        return Err(TransactionError::EnergyOutOfRange(params.energy));
    }
    if params.input.len() > MAX_INPUT_SIZE {
        return Err(TransactionError::InputTooLarge(params.input.len()));
    }

    let mut tx = Transaction {
        source: source.public_key(),
        destination: params.destination,
        energy: params.energy,
        tick: params.tick,
        input_type: params.input_type,
        input: params.input,
        signature: Default::default(),
        digest: [0u8; 32],
    };
    tx.digest = digest(&tx.unsigned_bytes());
    tx.signature = source.sign(&tx.digest);
    Ok(tx)
}
