//! Primitive readers and writers for the wire format: base-128 varints,
//! zig-zag signed varints, and length-prefixed byte strings.
//!
//! Writers append to a `Vec<u8>` and cannot fail; readers operate on a
//! [`Reader`] cursor over a byte slice and fail with [`CodecError::Truncated`]
//! whenever fewer bytes remain than a field declares.

use crate::error::CodecError;

pub mod value;

/// Appends `v` as an unsigned base-128 varint: LSB-first 7-bit groups, the top
/// bit of each byte signalling that more bytes follow.
pub fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Appends `v` as a zig-zag-mapped varint, so small negative values stay small
/// on the wire.
pub fn put_varint(buf: &mut Vec<u8>, v: i64) {
    put_uvarint(buf, ((v << 1) ^ (v >> 63)) as u64);
}

/// Appends a uvarint length prefix followed by the raw bytes.
pub fn put_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    put_uvarint(buf, b.len() as u64);
    buf.extend_from_slice(b);
}

/// Appends a uvarint length prefix followed by the string's UTF-8 bytes.
pub fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_bytes(buf, s.as_bytes());
}

/// Appends `v` in big-endian byte order.
pub fn put_u16_be(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// A cursor over a byte slice that the primitive readers consume from.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    /// The number of unconsumed bytes.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Consumes and returns the next byte.
    pub fn byte(&mut self) -> Result<u8, CodecError> {
        let b = *self.buf.get(self.pos).ok_or(CodecError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    /// Consumes and returns the next `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Consumes and returns every unread byte.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    /// Consumes a big-endian `u16`.
    pub fn u16_be(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Consumes an unsigned base-128 varint.
    pub fn uvarint(&mut self) -> Result<u64, CodecError> {
        let mut v: u64 = 0;
        let mut shift = 0u32;
        loop {
            let b = self.byte()?;
            if shift == 63 && b > 1 {
                return Err(CodecError::Overlong);
            }
            v |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return Ok(v);
            }
            shift += 7;
            if shift > 63 {
                return Err(CodecError::Overlong);
            }
        }
    }

    /// Consumes a zig-zag-mapped signed varint.
    pub fn varint(&mut self) -> Result<i64, CodecError> {
        let u = self.uvarint()?;
        Ok(((u >> 1) as i64) ^ -((u & 1) as i64))
    }

    /// Consumes a uvarint length prefix and that many raw bytes.
    pub fn bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.uvarint()?;
        if len > self.remaining() as u64 {
            return Err(CodecError::Truncated);
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    /// Consumes a uvarint length prefix and that many bytes of UTF-8.
    pub fn string(&mut self) -> Result<String, CodecError> {
        let b = self.bytes()?;
        String::from_utf8(b).map_err(|_| CodecError::InvalidUtf8)
    }
}
