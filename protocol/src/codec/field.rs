//! # Typed Field Table
//!
//! Every ticknet message is a fixed little-endian layout. Instead of
//! sprinkling `u16::from_le_bytes(buf[2..4].try_into()...)` across the
//! validators, each layout is declared once as a list of [`Field`]
//! constants and read through them.
//!
//! Offsets are computed at compile time by chaining fields with
//! [`Field::after`]/[`Bytes::after`], so inserting a field shifts every
//! later offset automatically and a layout can never overlap itself.
//!
//! Readers assume the caller already checked the total length. Validators
//! always do that first; a short buffer here is a programming error and
//! panics like any out-of-bounds slice.

use std::marker::PhantomData;

/// A little-endian scalar with a fixed width.
pub trait Scalar: Copy {
    const WIDTH: usize;
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, out: &mut [u8]);
}

macro_rules! impl_scalar {
    ($($ty:ty),*) => {$(
        impl Scalar for $ty {
            const WIDTH: usize = std::mem::size_of::<$ty>();

            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(&bytes[..Self::WIDTH]);
                <$ty>::from_le_bytes(raw)
            }

            fn write_le(self, out: &mut [u8]) {
                out[..Self::WIDTH].copy_from_slice(&self.to_le_bytes());
            }
        }
    )*};
}

impl_scalar!(u8, u16, u32, u64);

/// A scalar field at a fixed offset.
pub struct Field<T: Scalar> {
    pub offset: usize,
    _ty: PhantomData<T>,
}

impl<T: Scalar> Field<T> {
    pub const fn at(offset: usize) -> Self {
        Self {
            offset,
            _ty: PhantomData,
        }
    }

    /// The field immediately following `prev`.
    pub const fn after<U: Scalar>(prev: &Field<U>) -> Self {
        Self::at(prev.end())
    }

    /// The field immediately following a byte run.
    pub const fn after_bytes(prev: &Bytes) -> Self {
        Self::at(prev.end())
    }

    pub const fn end(&self) -> usize {
        self.offset + T::WIDTH
    }

    pub fn read(&self, buf: &[u8]) -> T {
        T::read_le(&buf[self.offset..])
    }

    pub fn write(&self, buf: &mut [u8], value: T) {
        value.write_le(&mut buf[self.offset..]);
    }
}

/// A fixed-length run of raw bytes (keys, digests, signatures).
pub struct Bytes {
    pub offset: usize,
    pub len: usize,
}

impl Bytes {
    pub const fn at(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    pub const fn after<U: Scalar>(prev: &Field<U>, len: usize) -> Self {
        Self::at(prev.end(), len)
    }

    pub const fn after_bytes(prev: &Bytes, len: usize) -> Self {
        Self::at(prev.end(), len)
    }

    pub const fn end(&self) -> usize {
        self.offset + self.len
    }

    pub fn slice<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.offset..self.end()]
    }

    pub fn slice_mut<'a>(&self, buf: &'a mut [u8]) -> &'a mut [u8] {
        &mut buf[self.offset..self.end()]
    }

    /// Copies the run into a fixed-size array. `N` must equal `len`.
    pub fn read_array<const N: usize>(&self, buf: &[u8]) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(self.slice(buf));
        out
    }

    pub fn write(&self, buf: &mut [u8], value: &[u8]) {
        self.slice_mut(buf).copy_from_slice(value);
    }
}

/// Reads a 24-bit little-endian integer.
pub fn read_u24(bytes: &[u8]) -> u32 {
    u32::from(bytes[0]) | u32::from(bytes[1]) << 8 | u32::from(bytes[2]) << 16
}

/// Writes the low 24 bits of `value`, little-endian.
pub fn write_u24(out: &mut [u8], value: u32) {
    out[0] = value as u8;
    out[1] = (value >> 8) as u8;
    out[2] = (value >> 16) as u8;
}
