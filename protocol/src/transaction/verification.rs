//! Transaction validation.
//!
//! Stateless: a transaction is valid if it is well-formed, within the size
//! and energy bounds, and signed by its source. Whether anyone can afford it
//! is not a question this node can answer.
//!
//! Checks run cheapest first. A transaction with absurd energy is rejected
//! before a single curve operation is spent on it.

use thiserror::Error;

use super::types::Transaction;
use crate::config::NONCE_LENGTH;
use crate::crypto::{Digest, PublicKey};

/// Why a transaction was rejected or could not be built.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("transaction size {0} is outside the protocol bounds")]
    InvalidSize(usize),

    #[error("input of {0} bytes exceeds the maximum input size")]
    InputTooLarge(usize),

    #[error("declared size {declared} does not match actual size {actual}")]
    SizeMismatch { declared: usize, actual: usize },

    #[error("energy {0} exceeds the maximum amount")]
    EnergyOutOfRange(u64),

    #[error("signature does not verify against the source")]
    InvalidSignature,
}

/// Validates raw transaction bytes and returns their digest.
pub fn validate_transaction(bytes: &[u8]) -> Result<Digest, TransactionError> {
    let tx = Transaction::decode(bytes)?;
    tx.verify()?;
    Ok(tx.digest)
}

/// `true` when `tx` has the shape of a resource-test solution: no energy,
/// input type 0, a nonce-sized input, sent to the arbitrator.
pub fn is_resource_test_candidate(tx: &Transaction, arbitrator: &PublicKey) -> bool {
    tx.energy == 0
        && tx.input_type == 0
        && tx.input.len() == NONCE_LENGTH
        && tx.destination == *arbitrator
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_ENERGY_AMOUNT;
    use crate::crypto::Keypair;
    use crate::transaction::{create_transaction, TransactionParams};

    fn signed(source: &Keypair, params: TransactionParams) -> Transaction {
        create_transaction(source, params).unwrap()
    }

    #[test]
    fn valid_transaction_yields_its_digest() {
        let tx = signed(&Keypair::generate(), TransactionParams::default());
        assert_eq!(validate_transaction(&tx.encode()), Ok(tx.digest));
    }

    #[test]
    fn tampered_transaction_is_rejected() {
        let tx = signed(
            &Keypair::generate(),
            TransactionParams {
                energy: 10,
                ..Default::default()
            },
        );
        let mut bytes = tx.encode();
        bytes[64] ^= 0x01;
        assert_eq!(
            validate_transaction(&bytes),
            Err(TransactionError::InvalidSignature)
        );
    }

    #[test]
    fn energy_over_cap_is_rejected_before_signature() {
        let tx = signed(&Keypair::generate(), TransactionParams::default());
        let mut bytes = tx.encode();
        bytes[64..72].copy_from_slice(&(MAX_ENERGY_AMOUNT + 1).to_le_bytes());
        assert_eq!(
            validate_transaction(&bytes),
            Err(TransactionError::EnergyOutOfRange(MAX_ENERGY_AMOUNT + 1))
        );
    }

    #[test]
    fn forged_source_is_rejected() {
        let tx = signed(&Keypair::generate(), TransactionParams::default());
        let mut bytes = tx.encode();
        bytes[..32].copy_from_slice(Keypair::generate().public_key().as_bytes());
        assert_eq!(
            validate_transaction(&bytes),
            Err(TransactionError::InvalidSignature)
        );
    }

    #[test]
    fn resource_test_candidate_predicate() {
        let arbitrator = Keypair::generate().public_key();
        let candidate = TransactionParams {
            destination: arbitrator,
            input: vec![1; NONCE_LENGTH],
            ..Default::default()
        };
        let source = Keypair::generate();
        assert!(is_resource_test_candidate(
            &signed(&source, candidate.clone()),
            &arbitrator
        ));

        let with_energy = TransactionParams {
            energy: 1,
            ..candidate.clone()
        };
        let wrong_type = TransactionParams {
            input_type: 1,
            ..candidate.clone()
        };
        let short_input = TransactionParams {
            input: vec![1; NONCE_LENGTH - 1],
            ..candidate.clone()
        };
        let elsewhere = TransactionParams {
            destination: Keypair::generate().public_key(),
            ..candidate
        };
        for params in [with_energy, wrong_type, short_input, elsewhere] {
            assert!(!is_resource_test_candidate(&signed(&source, params), &arbitrator));
        }
    }
}
