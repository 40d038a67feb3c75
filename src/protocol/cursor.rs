//! Bounds-checked cursor over wire buffers.
//!
//! Every typed read checks `pos + size_of::<T>()` against the slice it was built on, so
//! a corrupt count can only produce a `Truncated` error, never an out-of-bounds read.

use bytemuck::Pod;

use super::error::ProtocolError;

#[derive(Clone, Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn ensure(&self, what: &'static str, need: usize) -> Result<(), ProtocolError> {
        if need > self.remaining() {
            return Err(ProtocolError::Truncated {
                what,
                offset: self.pos,
                need,
                have: self.remaining(),
            });
        }
        Ok(())
    }

    /// Copies a `T` out of the buffer; the source needs no particular alignment.
    pub fn read_pod<T: Pod>(&mut self, what: &'static str) -> Result<T, ProtocolError> {
        let size = size_of::<T>();
        self.ensure(what, size)?;
        let value = bytemuck::pod_read_unaligned(&self.buf[self.pos..self.pos + size]);
        self.pos += size;
        Ok(value)
    }

    /// Reads without advancing.
    pub fn peek_pod<T: Pod>(&self, what: &'static str) -> Result<T, ProtocolError> {
        self.clone().read_pod(what)
    }

    pub fn read_bytes(&mut self, what: &'static str, len: usize) -> Result<&'a [u8], ProtocolError> {
        self.ensure(what, len)?;
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Reads `count` records of `T`, checking `count * stride` up front.
    pub fn read_array<T: Pod>(
        &mut self,
        what: &'static str,
        count: usize,
    ) -> Result<Vec<T>, ProtocolError> {
        let need = count
            .checked_mul(size_of::<T>())
            .ok_or(ProtocolError::TooMany {
                what,
                count,
                max: self.remaining() / size_of::<T>().max(1),
            })?;
        self.ensure(what, need)?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.read_pod(what)?);
        }
        Ok(out)
    }

    /// Splits off the next `len` bytes as an independent reader.
    pub fn take(&mut self, what: &'static str, len: usize) -> Result<WireReader<'a>, ProtocolError> {
        Ok(WireReader::new(self.read_bytes(what, len)?))
    }

    pub fn skip(&mut self, what: &'static str, len: usize) -> Result<(), ProtocolError> {
        self.read_bytes(what, len).map(|_| ())
    }
}

#[derive(Clone, Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_pod<T: Pod>(&mut self, value: &T) {
        self.buf.extend_from_slice(bytemuck::bytes_of(value));
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Overwrites a record previously written at `offset`, used to backfill lengths.
    pub fn patch_pod<T: Pod>(&mut self, offset: usize, value: &T) {
        let bytes = bytemuck::bytes_of(value);
        self.buf[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}
