//! Byte-order-parameterized field access over raw buffers.
//!
//! Everything downstream of header identification is generic over the
//! target's byte order; the pair `(ElfClass, Endianness)` is fixed once per
//! operation and threaded through as a value. Reads and writes past the
//! buffer end are hard errors, never truncated.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    fn span<'a>(self, buf: &'a [u8], off: usize, n: usize) -> Result<&'a [u8]> {
        if off.checked_add(n).map_or(true, |end| end > buf.len()) {
            return Err(Error::OutOfBounds);
        }
        Ok(&buf[off..off + n])
    }

    fn span_mut<'a>(self, buf: &'a mut [u8], off: usize, n: usize) -> Result<&'a mut [u8]> {
        if off.checked_add(n).map_or(true, |end| end > buf.len()) {
            return Err(Error::OutOfBounds);
        }
        Ok(&mut buf[off..off + n])
    }

    pub fn get16(self, buf: &[u8], off: usize) -> Result<u16> {
        let s = self.span(buf, off, 2)?;
        Ok(match self {
            Endianness::Little => LittleEndian::read_u16(s),
            Endianness::Big => BigEndian::read_u16(s),
        })
    }

    pub fn get32(self, buf: &[u8], off: usize) -> Result<u32> {
        let s = self.span(buf, off, 4)?;
        Ok(match self {
            Endianness::Little => LittleEndian::read_u32(s),
            Endianness::Big => BigEndian::read_u32(s),
        })
    }

    pub fn get64(self, buf: &[u8], off: usize) -> Result<u64> {
        let s = self.span(buf, off, 8)?;
        Ok(match self {
            Endianness::Little => LittleEndian::read_u64(s),
            Endianness::Big => BigEndian::read_u64(s),
        })
    }

    pub fn set16(self, buf: &mut [u8], off: usize, v: u16) -> Result<()> {
        let s = self.span_mut(buf, off, 2)?;
        match self {
            Endianness::Little => LittleEndian::write_u16(s, v),
            Endianness::Big => BigEndian::write_u16(s, v),
        }
        Ok(())
    }

    pub fn set32(self, buf: &mut [u8], off: usize, v: u32) -> Result<()> {
        let s = self.span_mut(buf, off, 4)?;
        match self {
            Endianness::Little => LittleEndian::write_u32(s, v),
            Endianness::Big => BigEndian::write_u32(s, v),
        }
        Ok(())
    }

    pub fn set64(self, buf: &mut [u8], off: usize, v: u64) -> Result<()> {
        let s = self.span_mut(buf, off, 8)?;
        match self {
            Endianness::Little => LittleEndian::write_u64(s, v),
            Endianness::Big => BigEndian::write_u64(s, v),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_respect_byte_order() {
        let buf = [0x12u8, 0x34, 0x56, 0x78];
        assert_eq!(Endianness::Little.get32(&buf, 0).unwrap(), 0x7856_3412);
        assert_eq!(Endianness::Big.get32(&buf, 0).unwrap(), 0x1234_5678);
        assert_eq!(Endianness::Little.get16(&buf, 2).unwrap(), 0x7856);
    }

    #[test]
    fn out_of_bounds_is_an_error_not_a_truncation() {
        let buf = [0u8; 4];
        assert_eq!(Endianness::Little.get32(&buf, 1), Err(Error::OutOfBounds));
        assert_eq!(Endianness::Big.get64(&buf, 0), Err(Error::OutOfBounds));
        assert_eq!(Endianness::Little.get16(&buf, usize::MAX), Err(Error::OutOfBounds));
        let mut buf = [0u8; 4];
        assert_eq!(Endianness::Big.set32(&mut buf, 2, 1), Err(Error::OutOfBounds));
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut buf = [0u8; 8];
        Endianness::Big.set64(&mut buf, 0, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(buf[0], 0x01);
        assert_eq!(Endianness::Big.get64(&buf, 0).unwrap(), 0x0102_0304_0506_0708);
    }
}
