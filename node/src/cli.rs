//! # CLI Interface
//!
//! Defines the command-line argument structure for `ticknet-node` using
//! `clap` derive. Three subcommands: `run`, `identity` and `version`.
//!
//! Every `run` flag also reads a `TICKNET_*` environment variable. Flags that
//! are left unset fall through to the JSON config file, then to the library
//! defaults.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use ticknet_protocol::config::{DEFAULT_API_PORT, DEFAULT_METRICS_PORT};
use ticknet_protocol::crypto::PublicKey;
use ticknet_protocol::NodeConfig;

use crate::logging::LogFormat;

/// ticknet overlay node.
///
/// Joins the gossip overlay, validates computor sets, ticks and
/// transactions, and reports finalized ticks over HTTP.
#[derive(Parser, Debug)]
#[command(
    name = "ticknet-node",
    about = "ticknet overlay node",
    version,
    propagate_version = true
)]
pub struct TicknetCli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the ticknet node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join the overlay and serve the status API.
    Run(RunArgs),
    /// Print the identity derived from a seed and index.
    Identity(IdentityArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to a JSON node configuration file.
    #[arg(long, short = 'c', env = "TICKNET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Protocol version byte carried in every frame header.
    #[arg(long, env = "TICKNET_PROTOCOL")]
    pub protocol: Option<u8>,

    /// Hex-encoded arbitrator public key.
    #[arg(long, env = "TICKNET_ARBITRATOR")]
    pub arbitrator: Option<String>,

    /// Signaling servers to dial, comma separated (`host:port`).
    #[arg(long, env = "TICKNET_SIGNALING_SERVERS", value_delimiter = ',')]
    pub signaling_servers: Vec<String>,

    /// ICE servers, comma separated.
    #[arg(long, env = "TICKNET_ICE_SERVERS", value_delimiter = ',')]
    pub ice_servers: Vec<String>,

    /// Number of overlay channels. The last one rotates.
    #[arg(long, env = "TICKNET_CHANNELS")]
    pub channels: Option<usize>,

    /// Full-node addresses to seed the upstream peer book, comma separated.
    #[arg(long, env = "TICKNET_UPSTREAM_PEERS", value_delimiter = ',')]
    pub upstream_peers: Vec<String>,

    /// Number of concurrent upstream connections. Zero disables upstream.
    #[arg(long, env = "TICKNET_UPSTREAM_CONNECTIONS")]
    pub upstream_connections: Option<usize>,

    /// Hex-encoded 32-byte seed of the resource test target tape.
    #[arg(long, env = "TICKNET_RANDOM_SEED")]
    pub random_seed: Option<String>,

    /// Number of neurons in the resource test network.
    #[arg(long, env = "TICKNET_NUMBER_OF_NEURONS")]
    pub number_of_neurons: Option<usize>,

    /// Matching bits needed before a nonce counts as a solution.
    #[arg(long, env = "TICKNET_SOLUTION_THRESHOLD")]
    pub solution_threshold: Option<usize>,

    /// Score an identity needs for its resource test to qualify.
    #[arg(long, env = "TICKNET_MIN_SCORE")]
    pub min_score: Option<u64>,

    /// Treat this tick as already finalized at startup.
    #[arg(long, env = "TICKNET_INITIAL_TICK")]
    pub initial_tick: Option<u32>,

    /// Port for the status API.
    #[arg(long, env = "TICKNET_API_PORT", default_value_t = DEFAULT_API_PORT)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "TICKNET_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Log output format: `pretty` or `json`.
    #[arg(long, env = "TICKNET_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

impl RunArgs {
    pub fn log_format(&self) -> LogFormat {
        LogFormat::from_str_lossy(&self.log_format)
    }

    /// Builds the node configuration: file first, then flags on top.
    pub fn node_config(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("invalid config file {}", path.display()))?
            }
            None => NodeConfig::default(),
        };

        if let Some(protocol) = self.protocol {
            config.protocol = protocol;
        }
        if let Some(arbitrator) = &self.arbitrator {
            config.arbitrator =
                Some(PublicKey::from_hex(arbitrator).context("invalid arbitrator key")?);
        }
        if !self.signaling_servers.is_empty() {
            config.signaling_servers = self.signaling_servers.clone();
        }
        if !self.ice_servers.is_empty() {
            config.ice_servers = self.ice_servers.clone();
        }
        if let Some(channels) = self.channels {
            config.gossip.number_of_channels = channels;
        }
        if !self.upstream_peers.is_empty() {
            config.upstream.peers = self.upstream_peers.clone();
        }
        if let Some(connections) = self.upstream_connections {
            config.upstream.connections = connections;
        }
        if let Some(seed) = &self.random_seed {
            let bytes = hex::decode(seed).context("random seed is not hex")?;
            config.resource_test.random_seed = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("random seed must be 32 bytes"))?;
        }
        if let Some(neurons) = self.number_of_neurons {
            config.resource_test.number_of_neurons = neurons;
        }
        if let Some(threshold) = self.solution_threshold {
            config.resource_test.solution_threshold = threshold;
        }
        if let Some(min_score) = self.min_score {
            config.min_score = min_score;
        }
        if self.initial_tick.is_some() {
            config.initial_tick = self.initial_tick;
        }

        config.validate().context("invalid node configuration")?;
        Ok(config)
    }
}

/// Arguments for the `identity` subcommand.
#[derive(Parser, Debug)]
pub struct IdentityArgs {
    /// Lowercase seed the entity key is derived from.
    #[arg(long, env = "TICKNET_SEED")]
    pub seed: String,

    /// Derivation index.
    #[arg(long, default_value_t = 0)]
    pub index: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn run_args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["ticknet-node", "run"];
        argv.extend_from_slice(extra);
        match TicknetCli::try_parse_from(argv).unwrap().command {
            Commands::Run(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn verify_cli_structure() {
        TicknetCli::command().debug_assert();
    }

    #[test]
    fn flags_override_defaults() {
        let arbitrator = ticknet_protocol::crypto::Keypair::generate().public_key();
        let hex_key = arbitrator.to_hex();
        let args = run_args(&[
            "--arbitrator",
            &hex_key,
            "--channels",
            "2",
            "--upstream-peers",
            "10.0.0.1,10.0.0.2",
            "--upstream-connections",
            "1",
            "--initial-tick",
            "42",
        ]);
        let config = args.node_config().unwrap();
        assert_eq!(config.arbitrator, Some(arbitrator));
        assert_eq!(config.gossip.number_of_channels, 2);
        assert_eq!(config.upstream.peers, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(config.upstream.connections, 1);
        assert_eq!(config.initial_tick, Some(42));
    }

    #[test]
    fn bad_random_seed_is_refused() {
        let args = run_args(&["--random-seed", "abcd"]);
        assert!(args.node_config().is_err());
    }

    #[test]
    fn identity_defaults_to_index_zero() {
        let cli = TicknetCli::try_parse_from(["ticknet-node", "identity", "--seed", "abc"]).unwrap();
        match cli.command {
            Commands::Identity(args) => {
                assert_eq!(args.seed, "abc");
                assert_eq!(args.index, 0);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
