//! # Protocol Configuration & Constants
//!
//! Every magic number in ticknet lives here. The wire layouts, the quorum
//! arithmetic and the gossip timers all read from this file, so if a value
//! is hardcoded somewhere else it is a bug waiting to happen.
//!
//! The second half of the file is [`NodeConfig`], the runtime knobs a node
//! operator can turn. Constants are protocol law; `NodeConfig` is local taste.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::crypto::PublicKey;

// ---------------------------------------------------------------------------
// Computors & Quorum
// ---------------------------------------------------------------------------

/// Size of every computor set. Fixed for the lifetime of the protocol.
pub const NUMBER_OF_COMPUTORS: usize = 676;

/// Strict two-thirds supermajority of [`NUMBER_OF_COMPUTORS`].
pub const QUORUM: usize = NUMBER_OF_COMPUTORS * 2 / 3 + 1;

// ---------------------------------------------------------------------------
// Cryptographic Sizes
// ---------------------------------------------------------------------------

/// Ed25519 verifying key length.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Ed25519 signature length. Always 64 bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Digest length (BLAKE3, 256-bit output).
pub const DIGEST_LENGTH: usize = 32;

/// Resource-test nonce length, carried as the whole transaction input.
pub const NONCE_LENGTH: usize = 32;

// ---------------------------------------------------------------------------
// Transactions & Energy
// ---------------------------------------------------------------------------

/// Upper bound on any energy amount, inclusive.
pub const MAX_ENERGY_AMOUNT: u64 = 1_000_000_000_000_000;

/// Largest transaction accepted on the wire, signature included.
pub const MAX_TRANSACTION_SIZE: usize = 1024;

/// Fixed transaction header: source, destination, energy, tick, input type
/// and input size.
pub const TRANSACTION_HEADER_LENGTH: usize = PUBLIC_KEY_LENGTH * 2 + 8 + 4 + 2 + 2;

/// A transaction with an empty input.
pub const MIN_TRANSACTION_SIZE: usize = TRANSACTION_HEADER_LENGTH + SIGNATURE_LENGTH;

/// Largest input payload that still fits in [`MAX_TRANSACTION_SIZE`].
pub const MAX_INPUT_SIZE: usize = MAX_TRANSACTION_SIZE - MIN_TRANSACTION_SIZE;

/// How far ahead of the latest tick a transaction is scheduled when the
/// caller leaves the tick unspecified.
pub const TRANSACTION_PUBLICATION_TICK_OFFSET: u32 = 5;

/// Base delay between rebroadcasts of a locally issued transaction. The n-th
/// rebroadcast waits `n` times this value.
pub const OWN_TRANSACTION_REBROADCAST_TIMEOUT: Duration = Duration::from_millis(1_000);

/// Retry period while waiting for the first tick before issuing a
/// transaction without an explicit tick.
pub const TICK_WAIT_RETRY_INTERVAL: Duration = Duration::from_millis(1_000);

// ---------------------------------------------------------------------------
// Gossip Channels
// ---------------------------------------------------------------------------

/// Default number of parallel overlay channels.
pub const NUMBER_OF_CHANNELS: usize = 4;

/// Floor of the connection attempt window. Each consecutive failure adds
/// one [`CHANNEL_TIMEOUT_MULTIPLIER`].
pub const MIN_CONNECTION_ATTEMPT_DURATION: Duration = Duration::from_millis(6_000);

/// The last channel is torn down and redialed after this long, so at least
/// one link keeps sampling fresh peers.
pub const MAX_ROTATING_CHANNEL_DURATION: Duration = Duration::from_millis(60_000);

/// An open channel with no valid inbound frame for this long is closed.
pub const MAX_PERIOD_OF_CHANNEL_INACTIVITY: Duration = Duration::from_millis(10_000);

/// Backoff unit. Reconnect delay is `failures * CHANNEL_TIMEOUT_MULTIPLIER`.
pub const CHANNEL_TIMEOUT_MULTIPLIER: Duration = Duration::from_millis(100);

/// Largest frame a channel will buffer before giving up on the peer.
pub const MAX_FRAME_SIZE: usize = 1 << 20;

// ---------------------------------------------------------------------------
// Propagation
// ---------------------------------------------------------------------------

/// Minimum spacing between computor-set forwards on the same channel.
pub const MIN_COMPUTORS_PROPAGATION_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Minimum spacing between forwards of the same (computor, tick) pair on the
/// same channel.
pub const MIN_TICK_PROPAGATION_TIMEOUT: Duration = Duration::from_millis(3_000);

/// Probability that an eligible tick is forwarded at all.
pub const TICK_PROPAGATION_PROBABILITY: f64 = 1.0;

/// Number of transactions the seen-filter is sized for.
pub const TRANSACTION_FILTER_CAPACITY: usize = 16_000_000;

/// Target false-positive rate of the seen-filter at full capacity.
pub const TRANSACTION_FILTER_FALSE_POSITIVE_RATE: f64 = 0.01;

/// Extra fan-outs after the first one for a newly seen transaction.
pub const NUMBER_OF_TRANSACTION_REBROADCASTINGS: usize = 5;

/// Spacing between those fan-outs.
pub const TRANSACTION_REBROADCAST_TIMEOUT: Duration = Duration::from_millis(1_000);

// ---------------------------------------------------------------------------
// Resource Test
// ---------------------------------------------------------------------------

/// Length of the target bit tape in 64-bit words.
pub const MINING_DATA_LENGTH: usize = 65_536;

/// Every neuron reads exactly two others.
pub const NUMBER_OF_LINKS_PER_NEURON: usize = 2;

pub const DEFAULT_NUMBER_OF_NEURONS: usize = 1_048_576;

pub const DEFAULT_SOLUTION_THRESHOLD: usize = 23;

/// Network-wide random seed for the target tape.
pub const DEFAULT_RANDOM_SEED: [u8; 32] = [
    146, 17, 33, 72, 117, 17, 77, 81, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0,
];

// ---------------------------------------------------------------------------
// Upstream (full-node) Connections
// ---------------------------------------------------------------------------

pub const DEFAULT_PROTOCOL: u8 = 155;

pub const DEFAULT_UPSTREAM_PORT: u16 = 21841;

/// Backoff unit for upstream reconnects.
pub const UPSTREAM_RECONNECT_UNIT: Duration = Duration::from_millis(1_000);

/// How often the computor set and quorum tick are requested upstream.
pub const UPSTREAM_REQUEST_INTERVAL: Duration = Duration::from_millis(15_000);

/// Delay between the computor request and the quorum tick request.
pub const UPSTREAM_QUORUM_TICK_DELAY: Duration = Duration::from_millis(1_000);

/// IPv4 addresses carried in one peer exchange.
pub const NUMBER_OF_EXCHANGED_PEERS: usize = 4;

// ---------------------------------------------------------------------------
// Node defaults
// ---------------------------------------------------------------------------

/// Fraction of alignment sources that must agree on a new computor set.
pub const DEFAULT_ALIGNMENT_THRESHOLD: f64 = 0.5;

/// Alignment slots older than this stop voting.
pub const DEFAULT_ALIGNMENT_STALE_AFTER: Duration = Duration::from_secs(300);

/// Default HTTP API port of the node binary.
pub const DEFAULT_API_PORT: u16 = 21850;

/// Default Prometheus metrics port.
pub const DEFAULT_METRICS_PORT: u16 = 21851;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while validating a [`NodeConfig`] or its parts.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("number of neurons must be at least 2, got {0}")]
    TooFewNeurons(usize),

    #[error("solution threshold must be nonzero")]
    ZeroSolutionThreshold,

    #[error("solution threshold {threshold} exceeds the target tape length {bits}")]
    ThresholdTooLarge { threshold: usize, bits: usize },

    #[error("number of channels must be between 1 and 255, got {0}")]
    InvalidChannelCount(usize),

    #[error("alignment threshold must be in (0, 1], got {0}")]
    InvalidAlignmentThreshold(f64),

    #[error("tick propagation probability must be in [0, 1], got {0}")]
    InvalidPropagationProbability(f64),

    #[error("arbitrator public key is not configured")]
    MissingArbitrator,

    #[error("transaction filter capacity must be nonzero")]
    ZeroFilterCapacity,

    #[error("invalid hex field `{field}`: {reason}")]
    InvalidHex { field: &'static str, reason: String },
}

// ---------------------------------------------------------------------------
// Resource Test Parameters
// ---------------------------------------------------------------------------

/// Parameters of the resource-test puzzle. All of them are network-wide:
/// two nodes with different parameters score solutions differently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceTestParameters {
    /// Seed of the target bit tape, hex encoded in config files.
    #[serde(with = "hex_seed")]
    pub random_seed: [u8; 32],
    pub number_of_neurons: usize,
    pub solution_threshold: usize,
}

impl Default for ResourceTestParameters {
    fn default() -> Self {
        Self {
            random_seed: DEFAULT_RANDOM_SEED,
            number_of_neurons: DEFAULT_NUMBER_OF_NEURONS,
            solution_threshold: DEFAULT_SOLUTION_THRESHOLD,
        }
    }
}

impl ResourceTestParameters {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.number_of_neurons < NUMBER_OF_LINKS_PER_NEURON {
            return Err(ConfigError::TooFewNeurons(self.number_of_neurons));
        }
        if self.solution_threshold == 0 {
            return Err(ConfigError::ZeroSolutionThreshold);
        }
        let bits = MINING_DATA_LENGTH * 64;
        if self.solution_threshold > bits {
            return Err(ConfigError::ThresholdTooLarge {
                threshold: self.solution_threshold,
                bits,
            });
        }
        Ok(())
    }
}

mod hex_seed {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(seed: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(seed))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("random seed must be 32 bytes"))
    }
}

// ---------------------------------------------------------------------------
// Gossip Configuration
// ---------------------------------------------------------------------------

/// Timers and limits of the gossip transport. Defaults are the protocol
/// constants above; tests shrink them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    pub number_of_channels: usize,
    pub min_connection_attempt_ms: u64,
    pub max_rotating_channel_ms: u64,
    pub max_inactivity_ms: u64,
    pub channel_timeout_multiplier_ms: u64,
    pub min_computors_propagation_ms: u64,
    pub min_tick_propagation_ms: u64,
    pub tick_propagation_probability: f64,
    pub transaction_filter_capacity: usize,
    pub transaction_filter_false_positive_rate: f64,
    pub transaction_rebroadcastings: usize,
    pub transaction_rebroadcast_ms: u64,
    /// Frames queued per channel before new sends are dropped.
    pub outbound_queue: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            number_of_channels: NUMBER_OF_CHANNELS,
            min_connection_attempt_ms: MIN_CONNECTION_ATTEMPT_DURATION.as_millis() as u64,
            max_rotating_channel_ms: MAX_ROTATING_CHANNEL_DURATION.as_millis() as u64,
            max_inactivity_ms: MAX_PERIOD_OF_CHANNEL_INACTIVITY.as_millis() as u64,
            channel_timeout_multiplier_ms: CHANNEL_TIMEOUT_MULTIPLIER.as_millis() as u64,
            min_computors_propagation_ms: MIN_COMPUTORS_PROPAGATION_TIMEOUT.as_millis() as u64,
            min_tick_propagation_ms: MIN_TICK_PROPAGATION_TIMEOUT.as_millis() as u64,
            tick_propagation_probability: TICK_PROPAGATION_PROBABILITY,
            transaction_filter_capacity: TRANSACTION_FILTER_CAPACITY,
            transaction_filter_false_positive_rate: TRANSACTION_FILTER_FALSE_POSITIVE_RATE,
            transaction_rebroadcastings: NUMBER_OF_TRANSACTION_REBROADCASTINGS,
            transaction_rebroadcast_ms: TRANSACTION_REBROADCAST_TIMEOUT.as_millis() as u64,
            outbound_queue: 1_024,
        }
    }
}

impl GossipConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.number_of_channels == 0 || self.number_of_channels > u8::MAX as usize {
            return Err(ConfigError::InvalidChannelCount(self.number_of_channels));
        }
        if !(0.0..=1.0).contains(&self.tick_propagation_probability) {
            return Err(ConfigError::InvalidPropagationProbability(
                self.tick_propagation_probability,
            ));
        }
        if self.transaction_filter_capacity == 0 {
            return Err(ConfigError::ZeroFilterCapacity);
        }
        Ok(())
    }

    pub fn min_connection_attempt(&self) -> Duration {
        Duration::from_millis(self.min_connection_attempt_ms)
    }

    pub fn max_rotating_channel(&self) -> Duration {
        Duration::from_millis(self.max_rotating_channel_ms)
    }

    pub fn max_inactivity(&self) -> Duration {
        Duration::from_millis(self.max_inactivity_ms)
    }

    pub fn channel_timeout_multiplier(&self) -> Duration {
        Duration::from_millis(self.channel_timeout_multiplier_ms)
    }

    pub fn min_computors_propagation(&self) -> Duration {
        Duration::from_millis(self.min_computors_propagation_ms)
    }

    pub fn min_tick_propagation(&self) -> Duration {
        Duration::from_millis(self.min_tick_propagation_ms)
    }

    pub fn transaction_rebroadcast(&self) -> Duration {
        Duration::from_millis(self.transaction_rebroadcast_ms)
    }
}

// ---------------------------------------------------------------------------
// Upstream Configuration
// ---------------------------------------------------------------------------

/// Direct TCP connections to full nodes. Zero connections disables the
/// whole subsystem, which is what a pure overlay node wants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub connections: usize,
    pub peers: Vec<String>,
    pub port: u16,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connections: 0,
            peers: Vec::new(),
            port: DEFAULT_UPSTREAM_PORT,
        }
    }
}

// ---------------------------------------------------------------------------
// Node Configuration
// ---------------------------------------------------------------------------

/// Everything a node needs to start. Loaded from JSON and then overridden
/// field by field from the command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Protocol version byte stamped into and checked on every frame.
    pub protocol: u8,
    /// Signs every computor set. Required; there is no safe default.
    pub arbitrator: Option<PublicKey>,
    pub resource_test: ResourceTestParameters,
    /// Rendezvous endpoints the channel connector dials.
    pub signaling_servers: Vec<String>,
    /// NAT traversal servers, handed through to the connector.
    pub ice_servers: Vec<String>,
    pub gossip: GossipConfig,
    pub upstream: UpstreamConfig,
    /// Cumulative resource-test score a computor needs to count as qualified.
    pub min_score: u64,
    pub alignment_threshold: f64,
    /// Alignment slots older than this stop voting. `None` keeps them forever.
    pub alignment_stale_after_ms: Option<u64>,
    /// Tick number reported before the first finalized tick arrives.
    pub initial_tick: Option<u32>,
    /// Capacity of each event stream.
    pub event_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            protocol: DEFAULT_PROTOCOL,
            arbitrator: None,
            resource_test: ResourceTestParameters::default(),
            signaling_servers: Vec::new(),
            ice_servers: Vec::new(),
            gossip: GossipConfig::default(),
            upstream: UpstreamConfig::default(),
            min_score: 0,
            alignment_threshold: DEFAULT_ALIGNMENT_THRESHOLD,
            alignment_stale_after_ms: Some(DEFAULT_ALIGNMENT_STALE_AFTER.as_millis() as u64),
            initial_tick: None,
            event_capacity: 256,
        }
    }
}

impl NodeConfig {
    /// Checks every field a running node depends on. Called by `Node::new`,
    /// so a node never starts with a half-valid configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.arbitrator.is_none() {
            return Err(ConfigError::MissingArbitrator);
        }
        if !(self.alignment_threshold > 0.0 && self.alignment_threshold <= 1.0) {
            return Err(ConfigError::InvalidAlignmentThreshold(
                self.alignment_threshold,
            ));
        }
        self.resource_test.validate()?;
        self.gossip.validate()
    }

    /// Number of slots in the computor-set alignment table: one per gossip
    /// channel plus one per upstream connection.
    pub fn alignment_sources(&self) -> usize {
        self.gossip.number_of_channels + self.upstream.connections
    }

    pub fn alignment_stale_after(&self) -> Option<Duration> {
        self.alignment_stale_after_ms.map(Duration::from_millis)
    }
}
