//! # Computor-Set Announcements
//!
//! The arbitrator publishes, once per epoch, the ordered list of the
//! [`NUMBER_OF_COMPUTORS`] keys allowed to sign ticks. The announcement is
//! gossiped like anything else, so a node has to decide which copy to
//! believe:
//!
//! 1. The arbitrator signature must verify. A bad one is a hostile peer.
//! 2. An older epoch is harmless: it is passed on but never stored.
//! 3. The same epoch with a different digest is equivocation. Rejected.
//! 4. Otherwise the set goes through the [`AlignmentTester`], which keeps the
//!    latest set seen on every source (gossip channel or upstream link) and
//!    only adopts a set once enough sources agree on it. One compromised
//!    channel cannot move the node to a new epoch on its own.
//!
//! ```text
//! offset 0       epoch        u16 LE
//! offset 2       public keys  676 x 32 bytes
//! offset 21634   signature    64 bytes, over the digest of everything before
//! ```

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::state::ConsensusState;
use crate::codec::{Bytes, Field};
use crate::config::{NUMBER_OF_COMPUTORS, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use crate::crypto::{digest, Digest, Keypair, PublicKey, Signature};

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

const EPOCH: Field<u16> = Field::at(0);
const PUBLIC_KEYS: Bytes = Bytes::after(&EPOCH, NUMBER_OF_COMPUTORS * PUBLIC_KEY_LENGTH);
const SIGNATURE: Bytes = Bytes::after_bytes(&PUBLIC_KEYS, SIGNATURE_LENGTH);

/// Exact length of a computor-set payload.
pub const COMPUTORS_LENGTH: usize = SIGNATURE.end();

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Reasons a computor-set announcement is rejected. Each one closes the
/// channel that delivered it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ComputorsError {
    #[error("computor set has the wrong length ({0} bytes)")]
    InvalidLength(usize),

    #[error("arbitrator signature does not verify")]
    InvalidSignature,

    #[error("conflicting computor set for current epoch {0}")]
    Equivocation(u16),
}

// ---------------------------------------------------------------------------
// ComputorSet
// ---------------------------------------------------------------------------

/// A decoded announcement. `digest` covers the epoch and key list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComputorSet {
    pub epoch: u16,
    pub public_keys: Vec<PublicKey>,
    #[serde(serialize_with = "crate::codec::hex_serde::serialize")]
    pub digest: Digest,
    pub signature: Signature,
}

impl ComputorSet {
    /// Decodes a payload and computes its digest. Does not verify.
    pub fn decode(bytes: &[u8]) -> Result<Self, ComputorsError> {
        if bytes.len() != COMPUTORS_LENGTH {
            return Err(ComputorsError::InvalidLength(bytes.len()));
        }
        let public_keys = PUBLIC_KEYS
            .slice(bytes)
            .chunks_exact(PUBLIC_KEY_LENGTH)
            .filter_map(PublicKey::from_slice)
            .collect();
        Ok(Self {
            epoch: EPOCH.read(bytes),
            public_keys,
            digest: digest(&bytes[..SIGNATURE.offset]),
            signature: Signature::from_bytes(SIGNATURE.read_array(bytes)),
        })
    }

    /// Builds and signs a set. This is the arbitrator's side of the
    /// protocol; nodes only ever need it for tooling and tests.
    pub fn signed(epoch: u16, public_keys: Vec<PublicKey>, arbitrator: &Keypair) -> Self {
        let mut set = Self {
            epoch,
            public_keys,
            digest: [0u8; 32],
            signature: Signature::default(),
        };
        let bytes = set.encode();
        set.digest = digest(&bytes[..SIGNATURE.offset]);
        set.signature = arbitrator.sign(&set.digest);
        set
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; COMPUTORS_LENGTH];
        EPOCH.write(&mut out, self.epoch);
        let keys = PUBLIC_KEYS.slice_mut(&mut out);
        for (chunk, key) in keys
            .chunks_exact_mut(PUBLIC_KEY_LENGTH)
            .zip(&self.public_keys)
        {
            chunk.copy_from_slice(key.as_bytes());
        }
        SIGNATURE.write(&mut out, self.signature.as_bytes());
        out
    }

    pub fn verify(&self, arbitrator: &PublicKey) -> bool {
        arbitrator.verify(&self.digest, &self.signature)
    }

    /// Index of `key` in the set, if it is a computor this epoch.
    pub fn index_of(&self, key: &PublicKey) -> Option<u16> {
        self.public_keys
            .iter()
            .position(|k| k == key)
            .map(|i| i as u16)
    }
}

// ---------------------------------------------------------------------------
// Alignment
// ---------------------------------------------------------------------------

/// What happens to alignment slots that have not been refreshed for a while.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleEntryPolicy {
    /// A slot votes forever, until its source reports something else.
    Retain,
    /// A slot older than this stops voting.
    ExpireAfter(Duration),
}

impl From<Option<Duration>> for StaleEntryPolicy {
    fn from(value: Option<Duration>) -> Self {
        value.map_or(Self::Retain, Self::ExpireAfter)
    }
}

#[derive(Debug, Clone)]
struct AlignmentSlot {
    epoch: u16,
    digest: Digest,
    seen_at: Instant,
}

/// Result of scoring the alignment table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Alignment {
    /// Digest held by the best-agreeing group of sources.
    pub digest: Digest,
    pub epoch: u16,
    /// Size of that group divided by the number of sources.
    pub ratio: f64,
}

/// Per-source memory of the latest computor set seen.
#[derive(Debug)]
pub struct AlignmentTester {
    slots: Vec<Option<AlignmentSlot>>,
    threshold: f64,
    policy: StaleEntryPolicy,
}

impl AlignmentTester {
    pub fn new(sources: usize, threshold: f64, policy: StaleEntryPolicy) -> Self {
        Self {
            slots: vec![None; sources],
            threshold,
            policy,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Records `set` as the latest seen on `source` and scores the table.
    ///
    /// Every live slot scores one for itself plus one for each other live
    /// slot holding the same digest. The first slot with the highest score
    /// wins. Sources out of range are ignored.
    pub fn record(&mut self, source: usize, set: &ComputorSet, now: Instant) -> Option<Alignment> {
        let slot = self.slots.get_mut(source)?;
        *slot = Some(AlignmentSlot {
            epoch: set.epoch,
            digest: set.digest,
            seen_at: now,
        });

        let live: Vec<&AlignmentSlot> = self
            .slots
            .iter()
            .flatten()
            .filter(|slot| self.is_live(slot, now))
            .collect();

        let mut best: Option<(&AlignmentSlot, usize)> = None;
        for candidate in live.iter().copied() {
            let score = live
                .iter()
                .filter(|other| other.digest == candidate.digest)
                .count();
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((candidate, score));
            }
        }

        best.map(|(slot, score)| Alignment {
            digest: slot.digest,
            epoch: slot.epoch,
            ratio: score as f64 / self.slots.len() as f64,
        })
    }

    fn is_live(&self, slot: &AlignmentSlot, now: Instant) -> bool {
        match self.policy {
            StaleEntryPolicy::Retain => true,
            StaleEntryPolicy::ExpireAfter(window) => {
                now.saturating_duration_since(slot.seen_at) <= window
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Processing
// ---------------------------------------------------------------------------

/// Non-rejecting outcomes of a computor-set announcement. All of them are
/// forwarded to peers.
#[derive(Debug, Clone, PartialEq)]
pub enum ComputorsOutcome {
    /// Older epoch than ours. Valid, forwarded, not stored.
    Stale(ComputorSet),
    /// Valid but not yet backed by enough sources.
    Unaligned { set: ComputorSet, ratio: f64 },
    /// Adopted as the current computor set.
    Accepted { set: ComputorSet, ratio: f64 },
}

impl ComputorsOutcome {
    pub fn set(&self) -> &ComputorSet {
        match self {
            Self::Stale(set) | Self::Unaligned { set, .. } | Self::Accepted { set, .. } => set,
        }
    }

    pub fn into_set(self) -> ComputorSet {
        match self {
            Self::Stale(set) | Self::Unaligned { set, .. } | Self::Accepted { set, .. } => set,
        }
    }
}

/// Runs one announcement received on `source` through verification,
/// equivocation detection and alignment.
pub fn process_computors(
    bytes: &[u8],
    source: usize,
    now: Instant,
    arbitrator: &PublicKey,
    state: &mut ConsensusState,
    alignment: &mut AlignmentTester,
) -> Result<ComputorsOutcome, ComputorsError> {
    let set = ComputorSet::decode(bytes)?;
    if !set.verify(arbitrator) {
        warn!(epoch = set.epoch, source, "computor set with invalid arbitrator signature");
        return Err(ComputorsError::InvalidSignature);
    }

    if set.epoch < state.epoch() {
        debug!(epoch = set.epoch, current = state.epoch(), "stale computor set");
        return Ok(ComputorsOutcome::Stale(set));
    }

    if set.epoch == state.epoch() {
        if let Some(current) = state.computors_digest() {
            if current != set.digest {
                warn!(epoch = set.epoch, source, "equivocating computor set");
                return Err(ComputorsError::Equivocation(set.epoch));
            }
        }
    }

    let Some(best) = alignment.record(source, &set, now) else {
        return Ok(ComputorsOutcome::Unaligned { set, ratio: 0.0 });
    };

    if best.digest == set.digest && best.ratio >= alignment.threshold() {
        if state.accept_computor_set(set.clone()) {
            info!(epoch = set.epoch, alignment = best.ratio, "computor set accepted");
        }
        Ok(ComputorsOutcome::Accepted {
            set,
            ratio: best.ratio,
        })
    } else {
        debug!(
            epoch = set.epoch,
            alignment = best.ratio,
            threshold = alignment.threshold(),
            "computor set not aligned yet"
        );
        Ok(ComputorsOutcome::Unaligned {
            set,
            ratio: best.ratio,
        })
    }
}
