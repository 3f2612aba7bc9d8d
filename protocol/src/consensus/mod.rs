//! # Consensus
//!
//! Everything the node believes about the ledger, and the validators that
//! decide what it is allowed to believe.
//!
//! ```text
//! state.rs      — epoch, computor set, tick store, quorum finality, entities
//! computors.rs  — computor-set announcements and source alignment
//! tick.rs       — tick layout, calendar checks, essence, finalization view
//! ```
//!
//! Validators are plain functions over `&mut ConsensusState`. They never
//! touch the network: they return a verdict and the caller decides whether
//! to propagate, drop, or close the channel the bytes came from.

pub mod computors;
pub mod state;
pub mod tick;

pub use computors::{
    process_computors, Alignment, AlignmentTester, ComputorSet, ComputorsError,
    ComputorsOutcome, StaleEntryPolicy, COMPUTORS_LENGTH,
};
pub use state::{ConsensusState, EntityRecord, StateError};
pub use tick::{
    process_tick, FinalizedTick, NotApplicable, Tick, TickError, TickSignature, TickTimestamp,
    TickVerdict, TICK_LENGTH,
};
