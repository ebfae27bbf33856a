use crate::error::*;
use crate::leb128::*;

/// Cursor over a module binary. Offsets are absolute so errors can point into the file.
#[derive(Clone, Copy)]
pub struct ByteIter<'a> {
    pub bytes: &'a [u8],
    pub idx: usize,
    end: usize,
}

impl<'a> ByteIter<'a> {
    #[inline]
    pub fn new(bytes: &'a [u8], idx: usize) -> Self { Self { bytes, idx, end: bytes.len() } }
    /// A cursor restricted to `range` of `bytes`.
    #[inline]
    pub fn bounded(bytes: &'a [u8], range: std::ops::Range<usize>) -> Self {
        Self { bytes, idx: range.start, end: range.end.min(bytes.len()) }
    }
    #[inline]
    pub fn empty(&self) -> bool { self.idx >= self.end }
    #[inline]
    pub fn has_n_left(&self, n: usize) -> bool { self.idx.saturating_add(n) <= self.end }
    #[inline]
    pub fn cur(&self) -> usize { self.idx }
    #[inline]
    pub fn end(&self) -> usize { self.end }
    #[inline]
    pub fn advance(&mut self, n: usize) { self.idx += n; }
    #[inline]
    pub fn read_u8(&mut self) -> Result<u8, Error> {
        if self.idx >= self.end { return malformed(UNEXPECTED_END); }
        let b = self.bytes[self.idx];
        self.idx += 1;
        Ok(b)
    }
    #[inline]
    pub fn peek_u8(&self) -> Result<u8, Error> {
        if self.idx >= self.end { return malformed(UNEXPECTED_END); }
        Ok(self.bytes[self.idx])
    }
    #[inline]
    pub fn read_u32(&mut self) -> Result<u32, Error> {
        safe_read_leb128(self.limited(), &mut self.idx, 32)
    }
    #[inline]
    pub fn read_i32(&mut self) -> Result<i32, Error> {
        safe_read_sleb128(self.limited(), &mut self.idx, 32)
    }
    #[inline]
    pub fn read_i33(&mut self) -> Result<i64, Error> {
        safe_read_sleb128(self.limited(), &mut self.idx, 33)
    }
    #[inline]
    pub fn read_i64(&mut self) -> Result<i64, Error> {
        safe_read_sleb128(self.limited(), &mut self.idx, 64)
    }
    #[inline]
    pub fn read_u64(&mut self) -> Result<u64, Error> {
        safe_read_leb128(self.limited(), &mut self.idx, 64)
    }
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if !self.has_n_left(len) { return malformed(UNEXPECTED_END_SHORT); }
        let slice = &self.bytes[self.idx..self.idx + len];
        self.idx += len;
        Ok(slice)
    }
    pub fn read_f32_bits(&mut self) -> Result<u32, Error> {
        let raw = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }
    pub fn read_f64_bits(&mut self) -> Result<u64, Error> {
        let raw = self.read_bytes(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(u64::from_le_bytes(buf))
    }
    pub fn read_name(&mut self) -> Result<String, Error> {
        let len = self.read_u32()? as usize;
        let raw = self.read_bytes(len)?;
        std::str::from_utf8(raw).map(str::to_owned).or(malformed(INVALID_UTF8))
    }

    #[inline]
    fn limited(&self) -> &'a [u8] { &self.bytes[..self.end] }
}
