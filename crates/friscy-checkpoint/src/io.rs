use std::io::Write;

use crate::error::{CheckpointError, Result};

pub trait WriteLeExt: Write {
    fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_all(&[v])?;
        Ok(())
    }

    fn write_u32_le(&mut self, v: u32) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_i32_le(&mut self, v: i32) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u64_le(&mut self, v: u64) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_all(bytes)?;
        Ok(())
    }

    fn write_count_u32(&mut self, len: usize) -> Result<()> {
        let len: u32 = len
            .try_into()
            .map_err(|_| CheckpointError::Corrupt("count does not fit in u32"))?;
        self.write_u32_le(len)
    }
}

impl<T: Write + ?Sized> WriteLeExt for T {}

/// Cursor over an in-memory checkpoint blob.
///
/// Every read names the field being read so a short blob reports where it ran out. Payload reads
/// borrow from the blob instead of copying.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_bytes(&mut self, len: usize, what: &'static str) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(CheckpointError::Truncated(what));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn read_array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N, what)?);
        Ok(out)
    }

    pub fn read_u8(&mut self, what: &'static str) -> Result<u8> {
        Ok(self.read_array::<1>(what)?[0])
    }

    pub fn read_u32_le(&mut self, what: &'static str) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array(what)?))
    }

    pub fn read_i32_le(&mut self, what: &'static str) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array(what)?))
    }

    pub fn read_u64_le(&mut self, what: &'static str) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array(what)?))
    }

    pub fn skip(&mut self, len: usize, what: &'static str) -> Result<()> {
        self.read_bytes(len, what).map(|_| ())
    }

    /// Read a `u32` element count and check that at least `count * min_elem_len` bytes remain.
    ///
    /// This rejects absurd counts before any allocation is sized from them.
    pub fn read_count_u32(&mut self, min_elem_len: usize, what: &'static str) -> Result<usize> {
        let count = self.read_u32_le(what)? as usize;
        self.check_count(count, min_elem_len, what)
    }

    pub fn read_count_u64(&mut self, min_elem_len: usize, what: &'static str) -> Result<usize> {
        let count = self.read_u64_le(what)?;
        let count = usize::try_from(count).map_err(|_| CheckpointError::Truncated(what))?;
        self.check_count(count, min_elem_len, what)
    }

    fn check_count(&self, count: usize, min_elem_len: usize, what: &'static str) -> Result<usize> {
        match count.checked_mul(min_elem_len) {
            Some(need) if need <= self.remaining() => Ok(count),
            _ => Err(CheckpointError::Truncated(what)),
        }
    }
}
