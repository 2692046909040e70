//! Coding related traits and the bounded writer used to build datagrams.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Error indicating that the provided buffer was too small
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
#[error("unexpected end of buffer")]
pub struct UnexpectedEnd;

/// Coding result type
pub type Result<T> = ::std::result::Result<T, UnexpectedEnd>;

/// Infallible encoding and decoding of fixed-width wire primitives
pub trait Codec: Sized {
    /// Decode a `Self` from the provided buffer, if the buffer is large enough
    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;
    /// Append the encoding of `self` to the provided buffer
    fn encode<B: BufMut>(&self, buf: &mut B);
}

impl Codec for u8 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 1 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u8())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(*self);
    }
}

impl Codec for u16 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u16())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(*self);
    }
}

impl Codec for u32 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u32())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(*self);
    }
}

/// Extension trait for reading from buffers
pub trait BufExt {
    /// Read and decode a value from the buffer
    fn get<T: Codec>(&mut self) -> Result<T>;
    /// Split off exactly `len` bytes
    fn take_bytes(&mut self, len: usize) -> Result<Bytes>;
}

impl<T: Buf> BufExt for T {
    fn get<U: Codec>(&mut self) -> Result<U> {
        U::decode(self)
    }

    fn take_bytes(&mut self, len: usize) -> Result<Bytes> {
        if self.remaining() < len {
            return Err(UnexpectedEnd);
        }
        Ok(self.copy_to_bytes(len))
    }
}

/// A write would have exceeded the capacity of a [`BoundedBuf`]
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
#[error("message exceeds {limit} bytes")]
pub struct Overflow {
    /// Capacity of the writer that rejected the write
    pub limit: usize,
}

/// Growable byte buffer with a hard capacity
///
/// Every write is checked against the limit and is rejected as a whole rather than clipped. The
/// single exception is [`BoundedBuf::put_status`], which is meant for human-readable text where a
/// shortened line is acceptable.
#[derive(Debug, Clone)]
pub struct BoundedBuf {
    buf: BytesMut,
    limit: usize,
}

impl BoundedBuf {
    /// Create an empty writer that accepts at most `limit` bytes
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(limit.min(2048)),
            limit,
        }
    }

    /// Number of bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written yet
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes that may still be written
    pub fn remaining(&self) -> usize {
        self.limit - self.buf.len()
    }

    fn reserve(&self, len: usize) -> ::std::result::Result<(), Overflow> {
        if len > self.remaining() {
            return Err(Overflow { limit: self.limit });
        }
        Ok(())
    }

    /// Append a single byte
    pub fn put_u8(&mut self, value: u8) -> ::std::result::Result<(), Overflow> {
        self.reserve(1)?;
        value.encode(&mut self.buf);
        Ok(())
    }

    /// Append a big-endian `u16`
    pub fn put_u16(&mut self, value: u16) -> ::std::result::Result<(), Overflow> {
        self.reserve(2)?;
        value.encode(&mut self.buf);
        Ok(())
    }

    /// Append `data` in full, or nothing at all
    pub fn put_slice(&mut self, data: &[u8]) -> ::std::result::Result<(), Overflow> {
        self.reserve(data.len())?;
        self.buf.put_slice(data);
        Ok(())
    }

    /// Append as much of `text` as fits, cut at a character boundary
    ///
    /// Returns the number of bytes written.
    pub fn put_status(&mut self, text: &str) -> usize {
        let mut end = text.len().min(self.remaining());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        self.buf.put_slice(&text.as_bytes()[..end]);
        end
    }

    /// View the written bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Convert into an immutable buffer
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

impl fmt::Write for BoundedBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.put_slice(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

/// Shortest big-endian encoding of an unsigned option value; zero encodes as no bytes
pub(crate) fn uint_bytes(value: u32) -> Bytes {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    Bytes::copy_from_slice(&bytes[skip..])
}

/// Inverse of [`uint_bytes`]; `None` if the value is wider than 32 bits
pub(crate) fn uint_value(bytes: &[u8]) -> Option<u32> {
    if bytes.len() > 4 {
        return None;
    }
    Some(bytes.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b)))
}
