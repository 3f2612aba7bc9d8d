//! # Frame Header & Reassembly
//!
//! Every message on a channel is one frame:
//!
//! ```text
//! offset 0  size      u24 LE   total frame length, header included
//! offset 3  protocol  u8       protocol version, must match ours
//! offset 4  dejavu    u24      random tag, zero for request/response pairs
//! offset 7  type      u8       message type
//! offset 8  payload
//! ```
//!
//! Gossip frames get a random dejavu so peers that dedup by it do not drop
//! distinct broadcasts. Requests to full nodes carry zero.

use bytes::{Buf, Bytes, BytesMut};
use rand::Rng;
use thiserror::Error;

use super::field::{read_u24, write_u24, Field};
use crate::config::MAX_FRAME_SIZE;

pub const HEADER_LENGTH: usize = 8;

const PROTOCOL: Field<u8> = Field::at(3);
const TYPE: Field<u8> = Field::at(7);

/// Largest size representable by the 24-bit size field.
pub const MAX_ENCODABLE_FRAME: usize = (1 << 24) - 1;

/// Framing failures. Every one of them closes the channel that produced it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame shorter than the 8-byte header ({0} bytes)")]
    Truncated(usize),

    #[error("declared size {declared} does not match received length {actual}")]
    SizeMismatch { declared: usize, actual: usize },

    #[error("protocol version {actual} does not match expected {expected}")]
    VersionMismatch { expected: u8, actual: u8 },

    #[error("declared frame size {0} exceeds the limit")]
    Oversized(usize),
}

// ---------------------------------------------------------------------------
// Message Types
// ---------------------------------------------------------------------------

/// Message types this node understands. Anything else is carried as
/// `Unknown` and passed to listeners but never propagated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    ExchangePublicPeers,
    BroadcastComputors,
    BroadcastTick,
    RequestComputors,
    RequestQuorumTick,
    BroadcastTransaction,
    Unknown(u8),
}

impl MessageType {
    pub fn to_u8(self) -> u8 {
        match self {
            Self::ExchangePublicPeers => 0,
            Self::BroadcastComputors => 2,
            Self::BroadcastTick => 3,
            Self::RequestComputors => 11,
            Self::RequestQuorumTick => 14,
            Self::BroadcastTransaction => 24,
            Self::Unknown(raw) => raw,
        }
    }
}

impl From<u8> for MessageType {
    fn from(raw: u8) -> Self {
        match raw {
            0 => Self::ExchangePublicPeers,
            2 => Self::BroadcastComputors,
            3 => Self::BroadcastTick,
            11 => Self::RequestComputors,
            14 => Self::RequestQuorumTick,
            24 => Self::BroadcastTransaction,
            other => Self::Unknown(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub size: usize,
    pub protocol: u8,
    pub dejavu: u32,
    pub message_type: MessageType,
}

impl Header {
    /// Parses the header without checking it against the buffer length.
    pub fn parse(frame: &[u8]) -> Result<Self, FrameError> {
        if frame.len() < HEADER_LENGTH {
            return Err(FrameError::Truncated(frame.len()));
        }
        Ok(Self {
            size: read_u24(frame) as usize,
            protocol: PROTOCOL.read(frame),
            dejavu: read_u24(&frame[4..]),
            message_type: MessageType::from(TYPE.read(frame)),
        })
    }
}

/// Validates a complete frame: header present, size field equal to the
/// actual length, protocol byte equal to ours.
pub fn check_frame(frame: &[u8], protocol: u8) -> Result<Header, FrameError> {
    let header = Header::parse(frame)?;
    if header.size != frame.len() {
        return Err(FrameError::SizeMismatch {
            declared: header.size,
            actual: frame.len(),
        });
    }
    if header.protocol != protocol {
        return Err(FrameError::VersionMismatch {
            expected: protocol,
            actual: header.protocol,
        });
    }
    Ok(header)
}

/// Wraps `payload` in a header. The dejavu tag is random when
/// `randomize_dejavu` is set, zero otherwise.
pub fn encode_frame(
    payload: &[u8],
    protocol: u8,
    randomize_dejavu: bool,
    message_type: MessageType,
) -> Result<Bytes, FrameError> {
    let size = HEADER_LENGTH + payload.len();
    if size > MAX_ENCODABLE_FRAME {
        return Err(FrameError::Oversized(size));
    }
    let mut frame = vec![0u8; size];
    write_u24(&mut frame, size as u32);
    PROTOCOL.write(&mut frame, protocol);
    if randomize_dejavu {
        // A zero tag means "request", so redraw until it is not.
        let mut dejavu = 0;
        while dejavu == 0 {
            dejavu = rand::thread_rng().gen::<u32>() & 0x00FF_FFFF;
        }
        write_u24(&mut frame[4..], dejavu);
    }
    TYPE.write(&mut frame, message_type.to_u8());
    frame[HEADER_LENGTH..].copy_from_slice(payload);
    Ok(Bytes::from(frame))
}

/// The payload of an already-checked frame.
pub fn payload(frame: &[u8]) -> &[u8] {
    &frame[HEADER_LENGTH.min(frame.len())..]
}

// ---------------------------------------------------------------------------
// Stream Reassembly
// ---------------------------------------------------------------------------

/// Cuts a byte stream into frames using the 24-bit size prefix.
///
/// Reads from a socket arrive split and coalesced arbitrarily; push them in
/// with [`extend`](Self::extend) and pull whole frames out with
/// [`next_frame`](Self::next_frame).
#[derive(Debug)]
pub struct FrameReader {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl FrameReader {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_frame_size,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the next complete frame, `Ok(None)` if more bytes are needed.
    ///
    /// A declared size below the header length or above the limit is an
    /// error: the stream cannot be resynchronized after it.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.buffer.len() < 3 {
            return Ok(None);
        }
        let size = read_u24(&self.buffer) as usize;
        if size < HEADER_LENGTH {
            return Err(FrameError::Truncated(size));
        }
        if size > self.max_frame_size {
            return Err(FrameError::Oversized(size));
        }
        if self.buffer.len() < size {
            return Ok(None);
        }
        Ok(Some(self.buffer.split_to(size).freeze()))
    }

    pub fn clear(&mut self) {
        self.buffer.advance(self.buffer.len());
    }
}
