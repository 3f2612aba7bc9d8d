//! # Consensus State
//!
//! The node's local view of the ledger: current epoch, adopted computor
//! set, ticks received per tick number, the latest finalized tick and the
//! registry of local entities.
//!
//! Finality is monotonic. A tick number becomes final the moment a quorum
//! of computors stored ticks with one identical essence, and only if it is
//! above the previous final tick number. Ticks below the finalized number
//! are dropped from memory at that point; nothing can change them anymore.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::info;

use super::computors::ComputorSet;
use super::tick::{FinalizedTick, Tick, TickSignature};
use crate::config::{MAX_ENERGY_AMOUNT, QUORUM};
use crate::crypto::{Digest, PublicKey};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("entity {0} is already registered")]
    DuplicateEntity(PublicKey),

    #[error("entity {0} is not registered")]
    UnknownEntity(PublicKey),

    #[error("energy {0} exceeds the maximum amount")]
    EnergyOutOfRange(u64),
}

/// What the node knows about one of its local entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityRecord {
    pub public_key: PublicKey,
    pub energy: u64,
    /// Position in the current computor set, if the entity is a computor.
    pub computor_index: Option<u16>,
}

#[derive(Debug, Default)]
pub struct ConsensusState {
    epoch: u16,
    computors: Option<ComputorSet>,
    ticks: BTreeMap<u32, HashMap<u16, Tick>>,
    latest: Option<FinalizedTick>,
    initial_tick: Option<u32>,
    entities: HashMap<PublicKey, EntityRecord>,
}

impl ConsensusState {
    pub fn new(initial_tick: Option<u32>) -> Self {
        Self {
            initial_tick,
            ..Self::default()
        }
    }

    pub fn epoch(&self) -> u16 {
        self.epoch
    }

    pub fn computors(&self) -> Option<&ComputorSet> {
        self.computors.as_ref()
    }

    pub fn computors_digest(&self) -> Option<Digest> {
        self.computors.as_ref().map(|set| set.digest)
    }

    pub fn computor_public_key(&self, index: u16) -> Option<PublicKey> {
        self.computors
            .as_ref()
            .and_then(|set| set.public_keys.get(usize::from(index)).copied())
    }

    /// Adopts `set` if its epoch is not older than the current one. Raises
    /// the epoch and recomputes the computor index of every local entity.
    /// Returns `false` for an older epoch.
    pub fn accept_computor_set(&mut self, set: ComputorSet) -> bool {
        if set.epoch < self.epoch {
            return false;
        }
        self.epoch = set.epoch;
        for record in self.entities.values_mut() {
            record.computor_index = set.index_of(&record.public_key);
        }
        self.computors = Some(set);
        true
    }

    pub fn latest_tick(&self) -> Option<&FinalizedTick> {
        self.latest.as_ref()
    }

    /// Latest finalized tick number, or the configured initial tick, or 0.
    pub fn latest_tick_number(&self) -> u32 {
        self.finality_floor().unwrap_or(0)
    }

    /// `true` once a tick number is known, finalized or configured.
    pub fn has_tick(&self) -> bool {
        self.finality_floor().is_some()
    }

    fn finality_floor(&self) -> Option<u32> {
        self.latest.as_ref().map(|t| t.tick).or(self.initial_tick)
    }

    pub fn stored_tick(&self, tick: u32, computor_index: u16) -> Option<&Tick> {
        self.ticks.get(&tick)?.get(&computor_index)
    }

    /// Number of ticks held for `tick`.
    pub fn stored_tick_count(&self, tick: u32) -> usize {
        self.ticks.get(&tick).map_or(0, HashMap::len)
    }

    /// Stores `tick` (replacing any earlier copy from the same computor) and
    /// finalizes its tick number when a quorum now shares its essence.
    pub fn record_tick(&mut self, tick: Tick) -> Option<FinalizedTick> {
        let floor = self.finality_floor();
        if floor.is_some_and(|floor| tick.tick < floor) {
            return None;
        }
        let number = tick.tick;
        let essence = tick.essence_digest();
        let slot = self.ticks.entry(number).or_default();
        slot.insert(tick.computor_index, tick);

        let agreeing: Vec<&Tick> = slot
            .values()
            .filter(|t| t.essence_digest() == essence)
            .collect();
        if agreeing.len() < QUORUM {
            return None;
        }
        if floor.is_some_and(|floor| number <= floor) {
            return None;
        }

        let computors = self.computors.as_ref();
        let signatures = agreeing
            .iter()
            .map(|t| TickSignature {
                computor_index: t.computor_index,
                public_key: computors
                    .and_then(|set| set.public_keys.get(usize::from(t.computor_index)).copied())
                    .unwrap_or_default(),
                digest: t.digest(),
                signature: t.signature,
            })
            .collect();
        let finalized = FinalizedTick::from_agreeing(agreeing[0], essence, signatures);

        info!(
            tick = number,
            epoch = finalized.epoch,
            signatures = finalized.signatures.len(),
            "tick finalized"
        );
        self.latest = Some(finalized.clone());
        self.ticks = self.ticks.split_off(&number);
        Some(finalized)
    }

    // -----------------------------------------------------------------------
    // Entities
    // -----------------------------------------------------------------------

    pub fn register_entity(&mut self, public_key: PublicKey) -> Result<(), StateError> {
        if self.entities.contains_key(&public_key) {
            return Err(StateError::DuplicateEntity(public_key));
        }
        let computor_index = self
            .computors
            .as_ref()
            .and_then(|set| set.index_of(&public_key));
        self.entities.insert(
            public_key,
            EntityRecord {
                public_key,
                energy: 0,
                computor_index,
            },
        );
        Ok(())
    }

    pub fn unregister_entity(&mut self, public_key: &PublicKey) -> Option<EntityRecord> {
        self.entities.remove(public_key)
    }

    pub fn entity(&self, public_key: &PublicKey) -> Option<&EntityRecord> {
        self.entities.get(public_key)
    }

    pub fn set_entity_energy(&mut self, public_key: &PublicKey, energy: u64) -> Result<(), StateError> {
        if energy > MAX_ENERGY_AMOUNT {
            return Err(StateError::EnergyOutOfRange(energy));
        }
        let record = self
            .entities
            .get_mut(public_key)
            .ok_or(StateError::UnknownEntity(*public_key))?;
        record.energy = energy;
        Ok(())
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NUMBER_OF_COMPUTORS;
    use crate::consensus::computors::tests::signed_set;
    use crate::consensus::tick::tests::sample_tick;
    use crate::crypto::Keypair;

    fn state_at_epoch(epoch: u16) -> ConsensusState {
        let mut state = ConsensusState::new(None);
        let arbitrator = Keypair::generate();
        assert!(state.accept_computor_set(signed_set(epoch, &[], &arbitrator)));
        state
    }

    /// Stores `count` matching ticks for `number`, returning the last result.
    fn store_matching(state: &mut ConsensusState, number: u32, count: usize) -> Option<FinalizedTick> {
        let mut result = None;
        for index in 0..count {
            result = state.record_tick(sample_tick(state.epoch(), number, index as u16));
        }
        result
    }

    #[test]
    fn epoch_only_moves_forward() {
        let arbitrator = Keypair::generate();
        let mut state = ConsensusState::new(None);
        assert!(state.accept_computor_set(signed_set(3, &[], &arbitrator)));
        assert!(!state.accept_computor_set(signed_set(2, &[], &arbitrator)));
        assert_eq!(state.epoch(), 3);
    }

    #[test]
    fn one_short_of_quorum_does_not_finalize() {
        let mut state = state_at_epoch(1);
        assert!(store_matching(&mut state, 10, QUORUM - 1).is_none());
        assert!(state.latest_tick().is_none());
        assert_eq!(state.stored_tick_count(10), QUORUM - 1);
    }

    #[test]
    fn quorum_finalizes_exactly_once() {
        let mut state = state_at_epoch(1);
        let finalized = store_matching(&mut state, 10, QUORUM).expect("quorum");
        assert_eq!(finalized.tick, 10);
        assert_eq!(state.latest_tick(), Some(&finalized));

        // More agreeing ticks do not finalize the same number again.
        assert!(state
            .record_tick(sample_tick(1, 10, QUORUM as u16))
            .is_none());
    }

    #[test]
    fn split_essences_do_not_combine() {
        let mut state = state_at_epoch(1);
        for index in 0..NUMBER_OF_COMPUTORS as u16 {
            let mut tick = sample_tick(1, 10, index);
            if index % 2 == 1 {
                tick.transaction_digest = [0xEE; 32];
            }
            assert!(state.record_tick(tick).is_none());
        }
    }

    #[test]
    fn finality_is_monotonic() {
        let mut state = state_at_epoch(1);
        store_matching(&mut state, 20, QUORUM).expect("quorum");
        assert!(store_matching(&mut state, 15, QUORUM).is_none());
        assert_eq!(state.latest_tick_number(), 20);

        let next = store_matching(&mut state, 21, QUORUM).expect("quorum");
        assert_eq!(next.tick, 21);
    }

    #[test]
    fn finalizing_prunes_older_tick_numbers() {
        let mut state = state_at_epoch(1);
        store_matching(&mut state, 5, 3);
        store_matching(&mut state, 6, QUORUM).expect("quorum");
        assert_eq!(state.stored_tick_count(5), 0);
        assert_eq!(state.stored_tick_count(6), QUORUM);
    }

    #[test]
    fn initial_tick_sets_the_floor() {
        let mut state = ConsensusState::new(Some(100));
        let arbitrator = Keypair::generate();
        state.accept_computor_set(signed_set(1, &[], &arbitrator));
        assert!(state.has_tick());
        assert_eq!(state.latest_tick_number(), 100);
        assert!(store_matching(&mut state, 100, QUORUM).is_none());
        assert!(store_matching(&mut state, 101, QUORUM).is_some());
    }

    #[test]
    fn entity_registry() {
        let arbitrator = Keypair::generate();
        let computor = Keypair::generate();
        let outsider = Keypair::generate();
        let mut state = ConsensusState::new(None);

        state.register_entity(computor.public_key()).unwrap();
        state.register_entity(outsider.public_key()).unwrap();
        assert_eq!(
            state.register_entity(computor.public_key()),
            Err(StateError::DuplicateEntity(computor.public_key()))
        );
        assert_eq!(state.entity(&computor.public_key()).unwrap().computor_index, None);

        state.accept_computor_set(signed_set(1, &[computor], &arbitrator));
        let computor_key = state.computor_public_key(0).unwrap();
        assert_eq!(state.entity(&computor_key).unwrap().computor_index, Some(0));
        assert_eq!(state.entity(&outsider.public_key()).unwrap().computor_index, None);

        assert!(state.unregister_entity(&outsider.public_key()).is_some());
        assert_eq!(state.entity_count(), 1);
    }

    #[test]
    fn energy_is_bounded() {
        let key = Keypair::generate().public_key();
        let mut state = ConsensusState::new(None);
        state.register_entity(key).unwrap();
        state.set_entity_energy(&key, MAX_ENERGY_AMOUNT).unwrap();
        assert_eq!(
            state.set_entity_energy(&key, MAX_ENERGY_AMOUNT + 1),
            Err(StateError::EnergyOutOfRange(MAX_ENERGY_AMOUNT + 1))
        );
        assert_eq!(state.entity(&key).unwrap().energy, MAX_ENERGY_AMOUNT);
    }
}
