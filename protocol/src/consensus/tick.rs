//! # Ticks
//!
//! Every computor signs one tick per tick number. A tick carries a calendar
//! timestamp, the digests of the previous state and the digest of the
//! transactions it includes:
//!
//! ```text
//! offset   0  computor index                u16 LE
//! offset   2  epoch                         u16 LE
//! offset   4  tick                          u32 LE
//! offset   8  millisecond                   u16 LE
//! offset  10  second, minute, hour, day, month, year   u8 each
//! offset  16  prev spectrum digest          32
//! offset  48  prev universe digest          32
//! offset  80  prev computer digest          32
//! offset 112  salted spectrum digest        32
//! offset 144  salted universe digest        32
//! offset 176  salted computer digest        32
//! offset 208  transaction digest            32
//! offset 240  expected next tick tx digest  32
//! offset 272  signature                     64
//! ```
//!
//! The **essence** is the part every honest computor agrees on: timestamp,
//! the three previous-state digests and the transaction digest. Salted
//! digests differ per computor by construction. A tick number is final once
//! [`QUORUM`](crate::config::QUORUM) computors signed the same essence.
//!
//! The signed digest mixes the broadcast-tick message type into the first
//! byte, so a tick signature can never be replayed as another message kind.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use super::state::ConsensusState;
use crate::codec::{Bytes, Field, MessageType};
use crate::config::{DIGEST_LENGTH, NUMBER_OF_COMPUTORS, SIGNATURE_LENGTH};
use crate::crypto::{digest, Digest, Keypair, PublicKey, Signature};

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

const COMPUTOR_INDEX: Field<u16> = Field::at(0);
const EPOCH: Field<u16> = Field::after(&COMPUTOR_INDEX);
const TICK: Field<u32> = Field::after(&EPOCH);
const MILLISECOND: Field<u16> = Field::after(&TICK);
const SECOND: Field<u8> = Field::after(&MILLISECOND);
const MINUTE: Field<u8> = Field::after(&SECOND);
const HOUR: Field<u8> = Field::after(&MINUTE);
const DAY: Field<u8> = Field::after(&HOUR);
const MONTH: Field<u8> = Field::after(&DAY);
const YEAR: Field<u8> = Field::after(&MONTH);
const PREV_SPECTRUM_DIGEST: Bytes = Bytes::after(&YEAR, DIGEST_LENGTH);
const PREV_UNIVERSE_DIGEST: Bytes = Bytes::after_bytes(&PREV_SPECTRUM_DIGEST, DIGEST_LENGTH);
const PREV_COMPUTER_DIGEST: Bytes = Bytes::after_bytes(&PREV_UNIVERSE_DIGEST, DIGEST_LENGTH);
const SALTED_SPECTRUM_DIGEST: Bytes = Bytes::after_bytes(&PREV_COMPUTER_DIGEST, DIGEST_LENGTH);
const SALTED_UNIVERSE_DIGEST: Bytes = Bytes::after_bytes(&SALTED_SPECTRUM_DIGEST, DIGEST_LENGTH);
const SALTED_COMPUTER_DIGEST: Bytes = Bytes::after_bytes(&SALTED_UNIVERSE_DIGEST, DIGEST_LENGTH);
const TRANSACTION_DIGEST: Bytes = Bytes::after_bytes(&SALTED_COMPUTER_DIGEST, DIGEST_LENGTH);
const EXPECTED_NEXT_TICK_TRANSACTION_DIGEST: Bytes =
    Bytes::after_bytes(&TRANSACTION_DIGEST, DIGEST_LENGTH);
const SIGNATURE: Bytes =
    Bytes::after_bytes(&EXPECTED_NEXT_TICK_TRANSACTION_DIGEST, SIGNATURE_LENGTH);

/// Exact length of a tick payload.
pub const TICK_LENGTH: usize = SIGNATURE.end();

// Essence: timestamp block, then four digests.
const ESSENCE_TIMESTAMP: Bytes = Bytes::at(0, YEAR.end() - MILLISECOND.offset);
const ESSENCE_PREV_SPECTRUM: Bytes = Bytes::after_bytes(&ESSENCE_TIMESTAMP, DIGEST_LENGTH);
const ESSENCE_PREV_UNIVERSE: Bytes = Bytes::after_bytes(&ESSENCE_PREV_SPECTRUM, DIGEST_LENGTH);
const ESSENCE_PREV_COMPUTER: Bytes = Bytes::after_bytes(&ESSENCE_PREV_UNIVERSE, DIGEST_LENGTH);
const ESSENCE_TRANSACTION: Bytes = Bytes::after_bytes(&ESSENCE_PREV_COMPUTER, DIGEST_LENGTH);

/// Length of the essence preimage.
pub const ESSENCE_LENGTH: usize = ESSENCE_TRANSACTION.end();

// ---------------------------------------------------------------------------
// Errors & verdicts
// ---------------------------------------------------------------------------

/// Reasons a tick is rejected. Each one closes the channel that sent it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TickError {
    #[error("tick has the wrong length ({0} bytes)")]
    InvalidLength(usize),

    #[error("computor index {0} out of range")]
    ComputorIndexOutOfRange(u16),

    #[error("invalid tick timestamp: {0}")]
    InvalidTimestamp(&'static str),

    #[error("tick signature does not verify for computor {0}")]
    InvalidSignature(u16),

    #[error("computor {computor_index} signed a different essence for tick {tick}")]
    ConflictingEssence { computor_index: u16, tick: u32 },

    #[error("computor {computor_index} changed its expected next tick digest for tick {tick}")]
    ConflictingExpectedDigest { computor_index: u16, tick: u32 },
}

/// Why a well-formed tick was dropped without blaming the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotApplicable {
    /// No computor set has been adopted yet.
    NoComputorSet,
    /// Signed for an epoch other than ours.
    EpochMismatch { tick_epoch: u16, epoch: u16 },
    /// Below the latest finalized tick number.
    AlreadyFinalized { tick: u32, latest: u32 },
}

/// Non-rejecting tick outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum TickVerdict {
    /// Valid; forwarded to peers. `finalized` is set when this tick
    /// completed a quorum.
    Accepted {
        tick: Tick,
        finalized: Option<FinalizedTick>,
    },
    /// Silently dropped; not forwarded and not held against the sender.
    NotApplicable(NotApplicable),
}

// ---------------------------------------------------------------------------
// Timestamp
// ---------------------------------------------------------------------------

/// Calendar timestamp of a tick. `year` counts from 2000.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TickTimestamp {
    pub millisecond: u16,
    pub second: u8,
    pub minute: u8,
    pub hour: u8,
    pub day: u8,
    pub month: u8,
    pub year: u8,
}

impl TickTimestamp {
    /// Rejects impossible dates. February has 29 days whenever the two-digit
    /// year is divisible by four.
    pub fn validate(&self) -> Result<(), TickError> {
        if !(1..=12).contains(&self.month) {
            return Err(TickError::InvalidTimestamp("month"));
        }
        let days_in_month = match self.month {
            1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
            4 | 6 | 9 | 11 => 30,
            _ if self.year & 3 == 0 => 29,
            _ => 28,
        };
        if self.day == 0 || self.day > days_in_month {
            return Err(TickError::InvalidTimestamp("day"));
        }
        if self.hour > 23 {
            return Err(TickError::InvalidTimestamp("hour"));
        }
        if self.minute > 59 {
            return Err(TickError::InvalidTimestamp("minute"));
        }
        if self.second > 59 {
            return Err(TickError::InvalidTimestamp("second"));
        }
        if self.millisecond > 999 {
            return Err(TickError::InvalidTimestamp("millisecond"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tick
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Tick {
    pub computor_index: u16,
    pub epoch: u16,
    pub tick: u32,
    pub timestamp: TickTimestamp,
    #[serde(serialize_with = "crate::codec::hex_serde::serialize")]
    pub prev_spectrum_digest: Digest,
    #[serde(serialize_with = "crate::codec::hex_serde::serialize")]
    pub prev_universe_digest: Digest,
    #[serde(serialize_with = "crate::codec::hex_serde::serialize")]
    pub prev_computer_digest: Digest,
    #[serde(serialize_with = "crate::codec::hex_serde::serialize")]
    pub salted_spectrum_digest: Digest,
    #[serde(serialize_with = "crate::codec::hex_serde::serialize")]
    pub salted_universe_digest: Digest,
    #[serde(serialize_with = "crate::codec::hex_serde::serialize")]
    pub salted_computer_digest: Digest,
    #[serde(serialize_with = "crate::codec::hex_serde::serialize")]
    pub transaction_digest: Digest,
    #[serde(serialize_with = "crate::codec::hex_serde::serialize")]
    pub expected_next_tick_transaction_digest: Digest,
    pub signature: Signature,
}

impl Tick {
    pub fn decode(bytes: &[u8]) -> Result<Self, TickError> {
        if bytes.len() != TICK_LENGTH {
            return Err(TickError::InvalidLength(bytes.len()));
        }
        Ok(Self {
            computor_index: COMPUTOR_INDEX.read(bytes),
            epoch: EPOCH.read(bytes),
            tick: TICK.read(bytes),
            timestamp: TickTimestamp {
                millisecond: MILLISECOND.read(bytes),
                second: SECOND.read(bytes),
                minute: MINUTE.read(bytes),
                hour: HOUR.read(bytes),
                day: DAY.read(bytes),
                month: MONTH.read(bytes),
                year: YEAR.read(bytes),
            },
            prev_spectrum_digest: PREV_SPECTRUM_DIGEST.read_array(bytes),
            prev_universe_digest: PREV_UNIVERSE_DIGEST.read_array(bytes),
            prev_computer_digest: PREV_COMPUTER_DIGEST.read_array(bytes),
            salted_spectrum_digest: SALTED_SPECTRUM_DIGEST.read_array(bytes),
            salted_universe_digest: SALTED_UNIVERSE_DIGEST.read_array(bytes),
            salted_computer_digest: SALTED_COMPUTER_DIGEST.read_array(bytes),
            transaction_digest: TRANSACTION_DIGEST.read_array(bytes),
            expected_next_tick_transaction_digest: EXPECTED_NEXT_TICK_TRANSACTION_DIGEST
                .read_array(bytes),
            signature: Signature::from_bytes(SIGNATURE.read_array(bytes)),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; TICK_LENGTH];
        COMPUTOR_INDEX.write(&mut out, self.computor_index);
        EPOCH.write(&mut out, self.epoch);
        TICK.write(&mut out, self.tick);
        MILLISECOND.write(&mut out, self.timestamp.millisecond);
        SECOND.write(&mut out, self.timestamp.second);
        MINUTE.write(&mut out, self.timestamp.minute);
        HOUR.write(&mut out, self.timestamp.hour);
        DAY.write(&mut out, self.timestamp.day);
        MONTH.write(&mut out, self.timestamp.month);
        YEAR.write(&mut out, self.timestamp.year);
        PREV_SPECTRUM_DIGEST.write(&mut out, &self.prev_spectrum_digest);
        PREV_UNIVERSE_DIGEST.write(&mut out, &self.prev_universe_digest);
        PREV_COMPUTER_DIGEST.write(&mut out, &self.prev_computer_digest);
        SALTED_SPECTRUM_DIGEST.write(&mut out, &self.salted_spectrum_digest);
        SALTED_UNIVERSE_DIGEST.write(&mut out, &self.salted_universe_digest);
        SALTED_COMPUTER_DIGEST.write(&mut out, &self.salted_computer_digest);
        TRANSACTION_DIGEST.write(&mut out, &self.transaction_digest);
        EXPECTED_NEXT_TICK_TRANSACTION_DIGEST
            .write(&mut out, &self.expected_next_tick_transaction_digest);
        SIGNATURE.write(&mut out, self.signature.as_bytes());
        out
    }

    /// The digest a computor signs.
    pub fn digest(&self) -> Digest {
        let mut body = self.encode();
        body.truncate(SIGNATURE.offset);
        body[0] ^= MessageType::BroadcastTick.to_u8();
        digest(&body)
    }

    /// Preimage of the essence digest.
    pub fn essence(&self) -> [u8; ESSENCE_LENGTH] {
        let mut out = [0u8; ESSENCE_LENGTH];
        let calendar = [
            self.timestamp.second,
            self.timestamp.minute,
            self.timestamp.hour,
            self.timestamp.day,
            self.timestamp.month,
            self.timestamp.year,
        ];
        out[..2].copy_from_slice(&self.timestamp.millisecond.to_le_bytes());
        out[2..ESSENCE_TIMESTAMP.end()].copy_from_slice(&calendar);
        ESSENCE_PREV_SPECTRUM.write(&mut out, &self.prev_spectrum_digest);
        ESSENCE_PREV_UNIVERSE.write(&mut out, &self.prev_universe_digest);
        ESSENCE_PREV_COMPUTER.write(&mut out, &self.prev_computer_digest);
        ESSENCE_TRANSACTION.write(&mut out, &self.transaction_digest);
        out
    }

    pub fn essence_digest(&self) -> Digest {
        digest(&self.essence())
    }

    pub fn has_expected_next_digest(&self) -> bool {
        self.expected_next_tick_transaction_digest != [0u8; DIGEST_LENGTH]
    }

    /// Signs the tick in place with a computor key.
    pub fn sign(mut self, computor: &Keypair) -> Self {
        self.signature = computor.sign(&self.digest());
        self
    }

    pub fn verify(&self, computor: &PublicKey) -> bool {
        computor.verify(&self.digest(), &self.signature)
    }
}

// ---------------------------------------------------------------------------
// Finalized tick
// ---------------------------------------------------------------------------

/// One computor's contribution to a finalized tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickSignature {
    pub computor_index: u16,
    pub public_key: PublicKey,
    #[serde(serialize_with = "crate::codec::hex_serde::serialize")]
    pub digest: Digest,
    pub signature: Signature,
}

/// A tick number agreed by at least a quorum of computors. Once emitted it
/// is never revised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalizedTick {
    pub tick: u32,
    pub epoch: u16,
    pub timestamp: TickTimestamp,
    #[serde(serialize_with = "crate::codec::hex_serde::serialize")]
    pub prev_spectrum_digest: Digest,
    #[serde(serialize_with = "crate::codec::hex_serde::serialize")]
    pub prev_universe_digest: Digest,
    #[serde(serialize_with = "crate::codec::hex_serde::serialize")]
    pub prev_computer_digest: Digest,
    #[serde(serialize_with = "crate::codec::hex_serde::serialize")]
    pub transaction_digest: Digest,
    #[serde(serialize_with = "crate::codec::hex_serde::serialize")]
    pub essence_digest: Digest,
    /// Agreeing computors, highest computor index first.
    pub signatures: Vec<TickSignature>,
}

impl FinalizedTick {
    /// Builds the finalized view from the agreeing ticks. `reference`
    /// supplies the shared essence fields.
    pub(crate) fn from_agreeing(
        reference: &Tick,
        essence_digest: Digest,
        mut signatures: Vec<TickSignature>,
    ) -> Self {
        signatures.sort_by(|a, b| b.computor_index.cmp(&a.computor_index));
        Self {
            tick: reference.tick,
            epoch: reference.epoch,
            timestamp: reference.timestamp,
            prev_spectrum_digest: reference.prev_spectrum_digest,
            prev_universe_digest: reference.prev_universe_digest,
            prev_computer_digest: reference.prev_computer_digest,
            transaction_digest: reference.transaction_digest,
            essence_digest,
            signatures,
        }
    }
}

// ---------------------------------------------------------------------------
// Processing
// ---------------------------------------------------------------------------

/// Validates a tick payload against the consensus state and records it.
///
/// Order matters: cheap structural checks first, then the signature, then
/// comparison with whatever this computor already told us about the same
/// tick number.
pub fn process_tick(bytes: &[u8], state: &mut ConsensusState) -> Result<TickVerdict, TickError> {
    let tick = Tick::decode(bytes)?;

    if state.computors().is_none() {
        return Ok(TickVerdict::NotApplicable(NotApplicable::NoComputorSet));
    }
    if tick.epoch != state.epoch() {
        return Ok(TickVerdict::NotApplicable(NotApplicable::EpochMismatch {
            tick_epoch: tick.epoch,
            epoch: state.epoch(),
        }));
    }
    if usize::from(tick.computor_index) >= NUMBER_OF_COMPUTORS {
        return Err(TickError::ComputorIndexOutOfRange(tick.computor_index));
    }
    let latest = state.latest_tick_number();
    if tick.tick < latest {
        return Ok(TickVerdict::NotApplicable(NotApplicable::AlreadyFinalized {
            tick: tick.tick,
            latest,
        }));
    }
    tick.timestamp.validate()?;

    let computor = state
        .computor_public_key(tick.computor_index)
        .ok_or(TickError::ComputorIndexOutOfRange(tick.computor_index))?;
    if !tick.verify(&computor) {
        warn!(computor = tick.computor_index, tick = tick.tick, "invalid tick signature");
        return Err(TickError::InvalidSignature(tick.computor_index));
    }

    let stored = state
        .stored_tick(tick.tick, tick.computor_index)
        .filter(|stored| stored.epoch == tick.epoch)
        .cloned();

    let Some(stored) = stored else {
        let finalized = state.record_tick(tick.clone());
        return Ok(TickVerdict::Accepted { tick, finalized });
    };

    if stored.essence_digest() != tick.essence_digest() {
        warn!(computor = tick.computor_index, tick = tick.tick, "conflicting tick essence");
        return Err(TickError::ConflictingEssence {
            computor_index: tick.computor_index,
            tick: tick.tick,
        });
    }

    match (stored.has_expected_next_digest(), tick.has_expected_next_digest()) {
        // Nothing to compare against yet; the stored copy stays.
        (false, _) => Ok(TickVerdict::Accepted {
            tick,
            finalized: None,
        }),
        (true, true) => {
            if stored.expected_next_tick_transaction_digest != tick.expected_next_tick_transaction_digest {
                warn!(computor = tick.computor_index, tick = tick.tick, "conflicting expected digest");
                return Err(TickError::ConflictingExpectedDigest {
                    computor_index: tick.computor_index,
                    tick: tick.tick,
                });
            }
            Ok(TickVerdict::Accepted {
                tick,
                finalized: None,
            })
        }
        (true, false) => {
            debug!(computor = tick.computor_index, tick = tick.tick, "stored tick replaced");
            let finalized = state.record_tick(tick.clone());
            Ok(TickVerdict::Accepted { tick, finalized })
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::QUORUM;

    pub(crate) fn sample_tick(epoch: u16, tick: u32, computor_index: u16) -> Tick {
        Tick {
            computor_index,
            epoch,
            tick,
            timestamp: TickTimestamp {
                millisecond: 250,
                second: 30,
                minute: 15,
                hour: 12,
                day: 28,
                month: 2,
                year: 26,
            },
            prev_spectrum_digest: [1u8; 32],
            prev_universe_digest: [2u8; 32],
            prev_computer_digest: [3u8; 32],
            salted_spectrum_digest: [computor_index as u8; 32],
            transaction_digest: [4u8; 32],
            ..Tick::default()
        }
    }

    /// State with an adopted set whose computors are `keys`.
    pub(crate) fn state_with(epoch: u16, keys: &[Keypair]) -> ConsensusState {
        let arbitrator = Keypair::generate();
        let set = crate::consensus::computors::tests::signed_set(epoch, keys, &arbitrator);
        let mut state = ConsensusState::new(None);
        assert!(state.accept_computor_set(set));
        state
    }

    #[test]
    fn layout_matches_wire_offsets() {
        assert_eq!(PREV_SPECTRUM_DIGEST.offset, 16);
        assert_eq!(EXPECTED_NEXT_TICK_TRANSACTION_DIGEST.offset, 240);
        assert_eq!(SIGNATURE.offset, 272);
        assert_eq!(TICK_LENGTH, 336);
        assert_eq!(ESSENCE_LENGTH, 136);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let keys = vec![Keypair::generate()];
        let tick = sample_tick(1, 10, 0).sign(&keys[0]);
        let decoded = Tick::decode(&tick.encode()).unwrap();
        assert_eq!(decoded, tick);
        assert!(decoded.verify(&keys[0].public_key()));
    }

    #[test]
    fn signed_digest_is_bound_to_the_message_type() {
        let tick = sample_tick(1, 10, 0);
        let mut plain = tick.encode();
        plain.truncate(SIGNATURE.offset);
        assert_ne!(tick.digest(), digest(&plain));
    }

    #[test]
    fn essence_ignores_salted_digests_and_signer() {
        let a = sample_tick(1, 10, 0);
        let b = sample_tick(1, 10, 1);
        assert_ne!(a.salted_spectrum_digest, b.salted_spectrum_digest);
        assert_eq!(a.essence_digest(), b.essence_digest());

        let mut c = sample_tick(1, 10, 2);
        c.transaction_digest = [9u8; 32];
        assert_ne!(a.essence_digest(), c.essence_digest());
    }

    #[test]
    fn calendar_rules() {
        let mut ts = sample_tick(1, 1, 0).timestamp;
        ts.month = 2;
        ts.day = 30;
        assert_eq!(ts.validate(), Err(TickError::InvalidTimestamp("day")));

        ts.day = 29;
        ts.year = 24;
        assert!(ts.validate().is_ok());
        ts.year = 25;
        assert_eq!(ts.validate(), Err(TickError::InvalidTimestamp("day")));

        ts = sample_tick(1, 1, 0).timestamp;
        ts.month = 13;
        assert_eq!(ts.validate(), Err(TickError::InvalidTimestamp("month")));
        ts.month = 4;
        ts.day = 31;
        assert_eq!(ts.validate(), Err(TickError::InvalidTimestamp("day")));
        ts.day = 30;
        ts.millisecond = 1_000;
        assert_eq!(
            ts.validate(),
            Err(TickError::InvalidTimestamp("millisecond"))
        );
    }

    #[test]
    fn february_thirtieth_is_rejected() {
        let keys = vec![Keypair::generate()];
        let mut state = state_with(1, &keys);
        let mut tick = sample_tick(1, 5, 0);
        tick.timestamp.day = 30;
        let bytes = tick.sign(&keys[0]).encode();
        assert_eq!(
            process_tick(&bytes, &mut state),
            Err(TickError::InvalidTimestamp("day"))
        );
    }

    #[test]
    fn wrong_length_is_rejected() {
        let mut state = ConsensusState::new(None);
        assert_eq!(
            process_tick(&[0u8; 12], &mut state),
            Err(TickError::InvalidLength(12))
        );
    }

    #[test]
    fn ticks_for_other_epochs_are_not_applicable() {
        let keys = vec![Keypair::generate()];
        let mut state = state_with(4, &keys);
        let bytes = sample_tick(3, 5, 0).sign(&keys[0]).encode();
        assert_eq!(
            process_tick(&bytes, &mut state).unwrap(),
            TickVerdict::NotApplicable(NotApplicable::EpochMismatch {
                tick_epoch: 3,
                epoch: 4
            })
        );
    }

    #[test]
    fn ticks_before_a_computor_set_are_not_applicable() {
        let keys = vec![Keypair::generate()];
        let mut state = ConsensusState::new(None);
        let bytes = sample_tick(0, 5, 0).sign(&keys[0]).encode();
        assert_eq!(
            process_tick(&bytes, &mut state).unwrap(),
            TickVerdict::NotApplicable(NotApplicable::NoComputorSet)
        );
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let keys = vec![Keypair::generate()];
        let mut state = state_with(1, &keys);
        let bytes = sample_tick(1, 5, NUMBER_OF_COMPUTORS as u16).encode();
        assert_eq!(
            process_tick(&bytes, &mut state),
            Err(TickError::ComputorIndexOutOfRange(676))
        );
    }

    #[test]
    fn signature_by_another_computor_is_rejected() {
        let keys = vec![Keypair::generate(), Keypair::generate()];
        let mut state = state_with(1, &keys);
        let bytes = sample_tick(1, 5, 0).sign(&keys[1]).encode();
        assert_eq!(
            process_tick(&bytes, &mut state),
            Err(TickError::InvalidSignature(0))
        );
    }

    #[test]
    fn conflicting_essence_from_the_same_computor_is_rejected() {
        let keys = vec![Keypair::generate()];
        let mut state = state_with(1, &keys);
        let first = sample_tick(1, 5, 0).sign(&keys[0]).encode();
        assert!(matches!(
            process_tick(&first, &mut state).unwrap(),
            TickVerdict::Accepted { .. }
        ));

        let mut other = sample_tick(1, 5, 0);
        other.prev_universe_digest = [7u8; 32];
        let second = other.sign(&keys[0]).encode();
        assert_eq!(
            process_tick(&second, &mut state),
            Err(TickError::ConflictingEssence {
                computor_index: 0,
                tick: 5
            })
        );
    }

    fn with_expected_digest(fill: u8, key: &Keypair) -> Tick {
        let mut tick = sample_tick(1, 5, 0);
        tick.expected_next_tick_transaction_digest = [fill; 32];
        tick.sign(key)
    }

    #[test]
    fn stored_tick_without_expected_digest_is_kept() {
        let keys = vec![Keypair::generate()];
        let mut state = state_with(1, &keys);
        let early = sample_tick(1, 5, 0).sign(&keys[0]);
        process_tick(&early.encode(), &mut state).unwrap();

        let late = with_expected_digest(8, &keys[0]);
        assert!(matches!(
            process_tick(&late.encode(), &mut state).unwrap(),
            TickVerdict::Accepted { finalized: None, .. }
        ));
        assert_eq!(state.stored_tick(5, 0), Some(&early));
    }

    #[test]
    fn expected_digests_must_agree() {
        let keys = vec![Keypair::generate()];
        let mut state = state_with(1, &keys);
        let first = with_expected_digest(8, &keys[0]);
        process_tick(&first.encode(), &mut state).unwrap();

        assert!(matches!(
            process_tick(&first.encode(), &mut state).unwrap(),
            TickVerdict::Accepted { .. }
        ));
        assert_eq!(
            process_tick(&with_expected_digest(9, &keys[0]).encode(), &mut state),
            Err(TickError::ConflictingExpectedDigest {
                computor_index: 0,
                tick: 5
            })
        );
        assert_eq!(state.stored_tick(5, 0), Some(&first));
    }

    #[test]
    fn copy_without_expected_digest_replaces_the_stored_one() {
        let keys = vec![Keypair::generate()];
        let mut state = state_with(1, &keys);
        let first = with_expected_digest(8, &keys[0]);
        process_tick(&first.encode(), &mut state).unwrap();

        let plain = sample_tick(1, 5, 0).sign(&keys[0]);
        assert!(matches!(
            process_tick(&plain.encode(), &mut state).unwrap(),
            TickVerdict::Accepted { .. }
        ));
        assert_eq!(state.stored_tick(5, 0), Some(&plain));
    }

    #[test]
    fn quorum_of_matching_ticks_finalizes() {
        let keys: Vec<Keypair> = (0..QUORUM).map(|_| Keypair::generate()).collect();
        let mut state = state_with(2, &keys);

        let mut finalized = None;
        for (index, key) in keys.iter().enumerate() {
            let bytes = sample_tick(2, 100, index as u16).sign(key).encode();
            match process_tick(&bytes, &mut state).unwrap() {
                TickVerdict::Accepted {
                    finalized: Some(f), ..
                } => {
                    assert_eq!(index + 1, QUORUM, "finalized before quorum");
                    finalized = Some(f);
                }
                TickVerdict::Accepted { .. } => {}
                other => panic!("unexpected verdict {other:?}"),
            }
        }

        let finalized = finalized.expect("quorum reached");
        assert_eq!(finalized.tick, 100);
        assert_eq!(finalized.signatures.len(), QUORUM);
        assert_eq!(
            finalized.signatures[0].computor_index as usize,
            QUORUM - 1
        );
        assert!(finalized
            .signatures
            .windows(2)
            .all(|w| w[0].computor_index > w[1].computor_index));
        assert_eq!(state.latest_tick_number(), 100);

        // Anything below the finalized number is now stale.
        let stale = sample_tick(2, 99, 0).sign(&keys[0]).encode();
        assert!(matches!(
            process_tick(&stale, &mut state).unwrap(),
            TickVerdict::NotApplicable(NotApplicable::AlreadyFinalized { .. })
        ));
    }
}
