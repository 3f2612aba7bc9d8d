//! # Network Module
//!
//! Everything that moves bytes between ticknet nodes, and the node that sits
//! on top of it.
//!
//! ## Architecture
//!
//! ```text
//! link.rs      — Connector seam: one byte stream per channel attempt
//! channel.rs   — Per-channel lifecycle, failure streak, session generation
//! dejavu.rs    — Propagation throttles and the transaction Bloom filter
//! gossip.rs    — Channel tasks, framing, propagation policy
//! upstream.rs  — Optional TCP links to full nodes
//! node.rs      — Validation pipeline, consensus state, event streams
//! entity.rs    — Local identities and their outgoing transactions
//! ```
//!
//! ## Design Decisions
//!
//! - The transport never interprets payloads. It reports frames upward and
//!   takes verdicts back, tagged with the session generation so a late
//!   verdict cannot close a newer session.
//! - Shared state sits behind `parking_lot::Mutex` and is never held across
//!   an `.await`.
//! - Every timer is a future owned by the task it governs. Cancelling the
//!   task cancels the timer.

pub mod channel;
pub mod dejavu;
pub mod entity;
pub mod gossip;
pub mod link;
pub mod node;
pub mod upstream;

pub use channel::{ChannelSlot, ChannelState, CloseReason};
pub use dejavu::{Dejavu, TransactionFilter};
pub use entity::{Entity, EntityError, EntityTransactionParams, PendingTransaction};
pub use gossip::{GossipTransport, InboundMessage, Origin, TransportEvent, TransportInfo};
pub use link::{BoxedStream, Connector, LinkStream, TcpConnector};
pub use node::{
    BroadcastHandle, ComputorsEvent, Node, NodeError, NodeEvents, NodeStatus,
    ResourceTestOutcome, TransactionEvent,
};
pub use upstream::{exchanged_peers, quorum_tick_request, PeerBook, UpstreamPool};
