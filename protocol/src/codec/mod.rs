//! # Wire Codec
//!
//! Framing and fixed-layout field access. Message bodies (computor sets,
//! ticks, transactions) declare their own layouts next to their validators
//! using the [`field`] primitives.

pub mod field;
pub mod frame;

pub use field::{Bytes, Field, Scalar};
pub use frame::{
    check_frame, encode_frame, payload, FrameError, FrameReader, Header, MessageType,
    HEADER_LENGTH,
};

/// Serializes byte arrays (digests, keys) as lowercase hex in JSON output.
pub(crate) mod hex_serde {
    use serde::Serializer;

    pub fn serialize<S: Serializer, T: AsRef<[u8]>>(
        bytes: &T,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }
}
