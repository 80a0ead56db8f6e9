//! Byte Codec primitives
//!
//! Field-by-field little-endian encode/decode over raw byte slices. No
//! structure here relies on the host's native layout; every on-disk record
//! implements [`Record`] with an explicit field order and a fixed size.

use alloc::vec::Vec;

use crate::error::{LoadError, Result};

/// A fixed-size, 1-byte-packed on-disk record.
pub trait Record: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Decode from the start of `bytes`. Trailing bytes are ignored.
    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(LoadError::truncated(Self::SIZE, bytes.len()));
        }
        let mut reader = ByteReader::new(&bytes[..Self::SIZE]);
        Self::read(&mut reader)
    }

    /// Append the encoded record to `out`.
    fn encode(&self, out: &mut Vec<u8>) {
        let mut writer = ByteWriter::new(out);
        self.write(&mut writer);
    }

    /// Encode into a fresh buffer.
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        self.encode(&mut out);
        out
    }

    /// Read the fields in on-disk order.
    fn read(reader: &mut ByteReader<'_>) -> Result<Self>;

    /// Write the fields in on-disk order.
    fn write(&self, writer: &mut ByteWriter<'_>);
}

/// Decode `count` consecutive records starting at `offset`.
pub fn decode_table<T: Record>(bytes: &[u8], offset: u64, count: u32) -> Result<Vec<T>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let len = (count as usize)
        .checked_mul(T::SIZE)
        .ok_or(LoadError::OutOfBounds { what: "table" })?;
    let table = slice_at(bytes, offset, len as u64)?;
    table.chunks_exact(T::SIZE).map(T::decode).collect()
}

/// Borrow `len` bytes at `offset`, checking the range with overflow care.
pub fn slice_at(bytes: &[u8], offset: u64, len: u64) -> Result<&[u8]> {
    let end = offset
        .checked_add(len)
        .ok_or(LoadError::OutOfBounds { what: "range" })?;
    if end > bytes.len() as u64 {
        return Err(LoadError::truncated(end as usize, bytes.len()));
    }
    Ok(&bytes[offset as usize..end as usize])
}

/// Sequential little-endian reader.
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Current offset from the start of the slice.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.pos + N;
        if end > self.bytes.len() {
            return Err(LoadError::truncated(end, self.bytes.len()));
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.pos..end]);
        self.pos = end;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    pub fn rva(&mut self) -> Result<Rva> {
        Ok(Rva {
            off: self.u64()?,
            size: self.u64()?,
        })
    }
}

/// Sequential little-endian writer appending to a buffer.
pub struct ByteWriter<'a> {
    out: &'a mut Vec<u8>,
}

impl<'a> ByteWriter<'a> {
    pub fn new(out: &'a mut Vec<u8>) -> Self {
        Self { out }
    }

    pub fn bytes(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    pub fn u8(&mut self, v: u8) {
        self.out.push(v);
    }

    pub fn u16(&mut self, v: u16) {
        self.bytes(&v.to_le_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }

    pub fn i64(&mut self, v: i64) {
        self.bytes(&v.to_le_bytes());
    }

    pub fn rva(&mut self, rva: Rva) {
        self.u64(rva.off);
        self.u64(rva.size);
    }
}

/// Offset + size pair relative to the start of the (sub-)container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rva {
    pub off: u64,
    pub size: u64,
}

impl Rva {
    pub const EMPTY: Rva = Rva { off: 0, size: 0 };

    pub const fn new(off: u64, size: u64) -> Self {
        Self { off, size }
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// End offset, `None` on overflow.
    pub fn end(&self) -> Option<u64> {
        self.off.checked_add(self.size)
    }

    /// Borrow the bytes this pair designates.
    pub fn slice<'a>(&self, container: &'a [u8], what: &'static str) -> Result<&'a [u8]> {
        match self.end() {
            Some(end) if end <= container.len() as u64 => {
                Ok(&container[self.off as usize..end as usize])
            }
            _ => Err(LoadError::OutOfBounds { what }),
        }
    }
}

impl Record for Rva {
    const SIZE: usize = 16;

    fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        reader.rva()
    }

    fn write(&self, writer: &mut ByteWriter<'_>) {
        writer.rva(*self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_little_endian() {
        let bytes = [0x4D, 0x41, 0x4C, 0x50, 0x02, 0x00];
        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.u32().unwrap(), 0x504C_414D);
        assert_eq!(r.u16().unwrap(), 2);
        assert_eq!(r.position(), 6);
        assert!(matches!(r.u8(), Err(LoadError::TruncatedInput { .. })));
    }

    #[test]
    fn test_rva_slice_bounds() {
        let data = [0u8; 32];
        assert_eq!(Rva::new(16, 16).slice(&data, "t").unwrap().len(), 16);
        assert_eq!(
            Rva::new(17, 16).slice(&data, "t"),
            Err(LoadError::OutOfBounds { what: "t" })
        );
        assert!(Rva::new(u64::MAX, 2).slice(&data, "t").is_err());
    }

    #[test]
    fn test_decode_table_truncated() {
        let data = [0u8; 40];
        let table: Vec<Rva> = decode_table(&data, 8, 2).unwrap();
        assert_eq!(table.len(), 2);
        assert!(decode_table::<Rva>(&data, 16, 2).is_err());
    }
}
