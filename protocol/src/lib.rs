// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # ticknet — Core Library
//!
//! A node for a tick-based ledger overlay. Computors publish signed ticks;
//! an arbitrator publishes who the computors are; the overlay gossips both,
//! together with transactions, and every node works out for itself which
//! ticks a quorum agreed on.
//!
//! Nothing here trusts a peer. Every computor set, tick and transaction is
//! validated before it is forwarded, and a channel that delivers garbage is
//! torn down and redialed.
//!
//! ## Architecture
//!
//! - **codec** — Frame header, stream reassembly, typed field tables.
//! - **crypto** — Ed25519 keys, BLAKE3 digests, SHAKE256 tapes. Wrappers only.
//! - **consensus** — Computor-set alignment, tick validation, quorum finality.
//! - **transaction** — Transaction layout, validation and construction.
//! - **resource_test** — The neuron puzzle gating zero-energy admin transactions.
//! - **network** — Gossip transport, upstream links, the node and its entities.
//! - **config** — Protocol constants and node configuration.
//!
//! ## Design Philosophy
//!
//! 1. Cheap checks before expensive ones. Lengths, then signatures, then state.
//! 2. Finality only moves forward. A finalized tick is never revised.
//! 3. Hostile input costs the sender its connection, never the node its uptime.

pub mod codec;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod network;
pub mod transaction;

pub use config::NodeConfig;
pub use network::{Entity, Node};
