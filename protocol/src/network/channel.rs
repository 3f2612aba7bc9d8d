//! Per-channel lifecycle bookkeeping.
//!
//! A [`ChannelSlot`] is the part of a channel that other tasks may look at:
//! its state, its failure streak, the generation of its current session and
//! the queue that feeds its socket. The socket itself lives in the channel's
//! own task (see `gossip.rs`).
//!
//! ```text
//!   begin_attempt          open               close
//! ───────────────▶ Negotiating ─────▶ Open ─────────────▶ Closed
//!                                      │  request_close     ▲
//!                                      └────▶ Closing ──────┘
//! ```

use bytes::Bytes;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Negotiating,
    Open,
    Closing,
    Closed,
}

/// Why a session ended. Decides the reconnect delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// No valid frame for too long. Reconnects at once, not a failure.
    Inactivity,
    /// Scheduled churn of the rotating channel.
    Rotation,
    /// The remote end hung up or the socket errored.
    Remote,
    /// A frame failed size or version checks.
    Framing,
    /// A validator rejected a message from this session.
    Rejected,
    /// The connector did not produce a stream in time. The attempt already
    /// counted as a failure when it started.
    AttemptTimeout,
    /// The connector returned an error.
    ConnectFailed,
    /// The transport is shutting down. No reconnect.
    Shutdown,
}

#[derive(Debug)]
pub struct ChannelSlot {
    state: ChannelState,
    failures: u32,
    generation: u64,
    outbound: Option<mpsc::Sender<Bytes>>,
}

impl Default for ChannelSlot {
    fn default() -> Self {
        Self {
            state: ChannelState::Closed,
            failures: 0,
            generation: 0,
            outbound: None,
        }
    }
}

impl ChannelSlot {
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Consecutive failures since the last successful open.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    /// Open or on its way out; what the peer count reports.
    pub fn is_connected(&self) -> bool {
        matches!(self.state, ChannelState::Open | ChannelState::Closing)
    }

    pub fn sender(&self) -> Option<&mpsc::Sender<Bytes>> {
        self.outbound.as_ref().filter(|_| self.is_open())
    }

    /// Starts a new session. Every attempt counts as a failure until it
    /// opens, so the attempt deadline stretches with the streak.
    ///
    /// Returns the new generation and the attempt deadline.
    pub fn begin_attempt(&mut self, min_attempt: Duration, unit: Duration) -> (u64, Duration) {
        self.generation += 1;
        self.failures += 1;
        self.state = ChannelState::Negotiating;
        self.outbound = None;
        (self.generation, min_attempt + unit * self.failures)
    }

    /// Marks the session `generation` open. Ignored for a stale generation.
    pub fn open(&mut self, generation: u64, outbound: mpsc::Sender<Bytes>) -> bool {
        if generation != self.generation {
            return false;
        }
        self.state = ChannelState::Open;
        self.failures = 0;
        self.outbound = Some(outbound);
        true
    }

    /// A close was requested for `generation`. Returns `false` if that
    /// session is already gone or a close is already pending.
    pub fn request_close(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.state != ChannelState::Open {
            return false;
        }
        self.state = ChannelState::Closing;
        true
    }

    /// Ends the current session. Returns how long to wait before the next
    /// attempt, or `None` when the channel must stay down.
    pub fn close(&mut self, reason: CloseReason, unit: Duration) -> Option<Duration> {
        self.state = ChannelState::Closed;
        self.outbound = None;
        match reason {
            CloseReason::Shutdown => None,
            CloseReason::Inactivity | CloseReason::AttemptTimeout => Some(Duration::ZERO),
            _ => {
                self.failures += 1;
                Some(unit * self.failures)
            }
        }
    }
}
