// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Bounds-checked little-endian field access for HGFS packets
//!
//! Every read goes through [`WireReader`], which refuses to move its cursor
//! past the end of the buffer. Unpackers therefore never need raw offset
//! arithmetic, and a malformed length field can only produce an error,
//! never an out-of-bounds slice.

use thiserror::Error;

/// Wire-level decode error
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("length field {len} exceeds remaining payload {remaining}")]
    BadLength { len: usize, remaining: usize },
    #[error("field contains invalid utf-8")]
    BadUtf8,
}

pub type WireResult<T> = Result<T, WireError>;

/// Checks that a request buffer can hold a header plus the fixed and
/// variable parts of an operation. Saturating on purpose: an attacker
/// controlled size pair must not be able to wrap the comparison.
pub fn validate_request_size(
    buffer_len: usize,
    header_size: usize,
    op_args_size: usize,
    op_data_size: usize,
) -> bool {
    buffer_len
        .checked_sub(header_size)
        .and_then(|r| r.checked_sub(op_args_size))
        .map(|r| r >= op_data_size)
        .unwrap_or(false)
}

/// Forward-only cursor over a request payload.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> WireResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                need: n,
                have: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> WireResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> WireResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> WireResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn skip(&mut self, n: usize) -> WireResult<()> {
        self.take(n).map(|_| ())
    }

    /// Reads `len` raw bytes after verifying the length against the
    /// remaining payload. The check is phrased as a comparison rather than
    /// a subtraction so an oversized `len` cannot wrap.
    pub fn bytes(&mut self, len: usize) -> WireResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(WireError::BadLength {
                len,
                remaining: self.remaining(),
            });
        }
        self.take(len)
    }

    /// Reads a `{length: u32, bytes}` counted field.
    pub fn counted_bytes(&mut self) -> WireResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.bytes(len)
    }

    /// Reads a counted field and requires valid UTF-8.
    pub fn counted_str(&mut self) -> WireResult<&'a str> {
        let raw = self.counted_bytes()?;
        std::str::from_utf8(raw).map_err(|_| WireError::BadUtf8)
    }
}

/// Append-only writer for reply bodies.
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(256),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub fn put_counted(&mut self, v: &[u8]) {
        self.put_u32(v.len() as u32);
        self.put_bytes(v);
    }

    /// Overwrites a previously written u32 in place.
    pub fn patch_u32(&mut self, offset: usize, v: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn pad_to(&mut self, align: usize) {
        while self.buf.len() % align != 0 {
            self.buf.push(0);
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for WireWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_request_size_never_underflows() {
        assert!(validate_request_size(100, 48, 20, 32));
        assert!(!validate_request_size(100, 48, 20, 33));
        // header alone larger than the buffer must not wrap around
        assert!(!validate_request_size(10, 48, 0, 0));
        assert!(!validate_request_size(0, usize::MAX, usize::MAX, 0));
    }

    #[test]
    fn reader_rejects_truncated_fixed_fields() {
        let mut r = WireReader::new(&[1, 2, 3]);
        assert!(matches!(r.u32(), Err(WireError::Truncated { .. })));
        // cursor did not move, the three bytes are still readable
        assert_eq!(r.remaining(), 3);
    }

    #[test]
    fn reader_rejects_oversized_counted_field() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&100u32.to_le_bytes());
        buf.extend_from_slice(b"short");
        let mut r = WireReader::new(&buf);
        assert_eq!(
            r.counted_bytes(),
            Err(WireError::BadLength {
                len: 100,
                remaining: 5
            })
        );
    }

    #[test]
    fn reader_accepts_exact_counted_field() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&5u32.to_le_bytes());
        buf.extend_from_slice(b"hello");
        let mut r = WireReader::new(&buf);
        assert_eq!(r.counted_str().unwrap(), "hello");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn writer_patches_in_place() {
        let mut w = WireWriter::new();
        w.put_u32(0);
        w.put_u64(7);
        w.patch_u32(0, 42);
        let v = w.into_vec();
        assert_eq!(u32::from_le_bytes(v[0..4].try_into().unwrap()), 42);
    }
}
