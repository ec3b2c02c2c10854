//! Persisted pack metadata: the 12-byte `l_info`/`p_info`/`b_info` records
//! in the header block and the 32-byte `PackHeader` at end of file, which the
//! unpacker reads first and which doubles as the already-packed signature.
//!
//! Multi-byte fields are target-endian; the magic value is always stored as
//! the literal bytes `SQZ!` (a fixed little-endian encoding).

use crate::endian::Endianness;
use crate::error::{Error, Result};

pub const MAGIC_BYTES: [u8; 4] = *b"SQZ!";
/// `MAGIC_BYTES` read as a little-endian u32.
pub const MAGIC: u32 = u32::from_le_bytes(MAGIC_BYTES);
pub const VERSION: u8 = 1;

pub const FMT_EXEC: u8 = 1;
pub const FMT_SHLIB: u8 = 2;

pub const L_INFO_SIZE: usize = 12;
pub const P_INFO_SIZE: usize = 12;
pub const B_INFO_SIZE: usize = 12;
pub const PACK_HEADER_SIZE: usize = 32;

// ---------------- adler32 ----------------

const ADLER_MOD: u32 = 65521;

/// Incrementally accumulated RFC 1950 checksum.
#[derive(Clone, Copy)]
pub struct Adler32 {
    a: u32,
    b: u32,
}

impl Adler32 {
    pub fn new() -> Adler32 {
        Adler32 { a: 1, b: 0 }
    }
    pub fn update(&mut self, data: &[u8]) {
        for chunk in data.chunks(4096) {
            for &byte in chunk {
                self.a += byte as u32;
                self.b += self.a;
            }
            self.a %= ADLER_MOD;
            self.b %= ADLER_MOD;
        }
    }
    pub fn finish(&self) -> u32 {
        (self.b << 16) | self.a
    }
}

impl Default for Adler32 {
    fn default() -> Self {
        Adler32::new()
    }
}

pub fn adler32(data: &[u8]) -> u32 {
    let mut a = Adler32::new();
    a.update(data);
    a.finish()
}

// ---------------- b_info ----------------

/// Per-block compression record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BInfo {
    pub u_len: u32,
    pub c_len: u32,
    pub method: u8,
    pub filter: u8,
    pub filter_param: u8,
}

impl BInfo {
    pub fn encode(&self, e: Endianness) -> [u8; B_INFO_SIZE] {
        let mut out = [0u8; B_INFO_SIZE];
        e.set32(&mut out, 0, self.u_len).unwrap();
        e.set32(&mut out, 4, self.c_len).unwrap();
        out[8] = self.method;
        out[9] = self.filter;
        out[10] = self.filter_param;
        out
    }

    pub fn decode(e: Endianness, buf: &[u8], off: usize) -> Result<BInfo> {
        if off + B_INFO_SIZE > buf.len() {
            return Err(Error::CompressedDataViolation("truncated block record"));
        }
        Ok(BInfo {
            u_len: e.get32(buf, off)?,
            c_len: e.get32(buf, off + 4)?,
            method: buf[off + 8],
            filter: buf[off + 9],
            filter_param: buf[off + 10],
        })
    }

    /// End of stream: zero uncompressed size and the magic in the
    /// compressed-size field, stored little-endian regardless of target.
    pub fn terminator() -> [u8; B_INFO_SIZE] {
        let mut out = [0u8; B_INFO_SIZE];
        out[4..8].copy_from_slice(&MAGIC_BYTES);
        out
    }

    pub fn is_terminator(buf: &[u8], off: usize) -> bool {
        buf.len() >= off + B_INFO_SIZE
            && buf[off..off + 4] == [0; 4]
            && buf[off + 4..off + 8] == MAGIC_BYTES
    }

    /// The literal-or-shrunk invariant every stored block must satisfy.
    pub fn is_plausible(&self) -> bool {
        if self.u_len == 0 || !crate::compress::is_known(self.method) {
            return false;
        }
        if self.method == crate::compress::M_STORE {
            self.c_len == self.u_len
        } else {
            self.c_len < self.u_len && self.c_len != 0
        }
    }
}

// ---------------- l_info ----------------

/// Loader/link record: checksum and size of the embedded stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LInfo {
    pub checksum: u32,
    pub loader_size: u16,
    pub version: u8,
    pub format: u8,
}

impl LInfo {
    pub fn encode(&self, e: Endianness) -> [u8; L_INFO_SIZE] {
        let mut out = [0u8; L_INFO_SIZE];
        e.set32(&mut out, 0, self.checksum).unwrap();
        out[4..8].copy_from_slice(&MAGIC_BYTES);
        e.set16(&mut out, 8, self.loader_size).unwrap();
        out[10] = self.version;
        out[11] = self.format;
        out
    }

    pub fn decode(e: Endianness, buf: &[u8], off: usize) -> Result<LInfo> {
        if off + L_INFO_SIZE > buf.len() || buf[off + 4..off + 8] != MAGIC_BYTES {
            return Err(Error::CompressedDataViolation("missing l_info magic"));
        }
        Ok(LInfo {
            checksum: e.get32(buf, off)?,
            loader_size: e.get16(buf, off + 8)?,
            version: buf[off + 10],
            format: buf[off + 11],
        })
    }
}

// ---------------- p_info ----------------

/// Whole-file packing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PInfo {
    pub program_id: u32,
    pub orig_file_size: u32,
    pub block_size: u32,
}

impl PInfo {
    pub fn encode(&self, e: Endianness) -> [u8; P_INFO_SIZE] {
        let mut out = [0u8; P_INFO_SIZE];
        e.set32(&mut out, 0, self.program_id).unwrap();
        e.set32(&mut out, 4, self.orig_file_size).unwrap();
        e.set32(&mut out, 8, self.block_size).unwrap();
        out
    }

    pub fn decode(e: Endianness, buf: &[u8], off: usize) -> Result<PInfo> {
        if off + P_INFO_SIZE > buf.len() {
            return Err(Error::CompressedDataViolation("truncated p_info"));
        }
        Ok(PInfo {
            program_id: e.get32(buf, off)?,
            orig_file_size: e.get32(buf, off + 4)?,
            block_size: e.get32(buf, off + 8)?,
        })
    }
}

// ---------------- PackHeader ----------------

/// End-of-file trailer carrying the running checksums and the layout deltas
/// the unpacker needs before it can locate anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackHeader {
    pub version: u8,
    pub format: u8,
    pub method: u8,
    pub filter: u8,
    pub filter_param: u8,
    pub u_adler: u32,
    pub c_adler: u32,
    pub u_file_size: u32,
    pub xct_off: u32,
    pub so_slide: i32,
    /// Auxiliary-page count; the address delta is `asl_pages * page_size`.
    pub asl_pages: u8,
}

impl PackHeader {
    pub fn encode(&self, e: Endianness) -> [u8; PACK_HEADER_SIZE] {
        let mut out = [0u8; PACK_HEADER_SIZE];
        out[0..4].copy_from_slice(&MAGIC_BYTES);
        out[4] = self.version;
        out[5] = self.format;
        out[6] = self.method;
        out[7] = self.filter;
        e.set32(&mut out, 8, self.u_adler).unwrap();
        e.set32(&mut out, 12, self.c_adler).unwrap();
        e.set32(&mut out, 16, self.u_file_size).unwrap();
        e.set32(&mut out, 20, self.xct_off).unwrap();
        e.set32(&mut out, 24, self.so_slide as u32).unwrap();
        out[28] = self.filter_param;
        out[29] = self.asl_pages;
        out[30] = out[..30].iter().fold(0u8, |acc, &b| acc ^ b);
        out
    }

    pub fn decode(e: Endianness, buf: &[u8]) -> Result<PackHeader> {
        if buf.len() < PACK_HEADER_SIZE {
            return Err(Error::InvalidFormat("no pack trailer"));
        }
        let off = buf.len() - PACK_HEADER_SIZE;
        let t = &buf[off..];
        if t[0..4] != MAGIC_BYTES {
            return Err(Error::InvalidFormat("no pack trailer"));
        }
        let chk = t[..30].iter().fold(0u8, |acc, &b| acc ^ b);
        if chk != t[30] {
            return Err(Error::CompressedDataViolation("pack trailer checksum"));
        }
        if t[4] != VERSION {
            return Err(Error::CompressedDataViolation("unsupported pack version"));
        }
        Ok(PackHeader {
            version: t[4],
            format: t[5],
            method: t[6],
            filter: t[7],
            u_adler: e.get32(t, 8)?,
            c_adler: e.get32(t, 12)?,
            u_file_size: e.get32(t, 16)?,
            xct_off: e.get32(t, 20)?,
            so_slide: e.get32(t, 24)? as i32,
            filter_param: t[28],
            asl_pages: t[29],
        })
    }

    /// Signature probe used by `can_pack` for the idempotent-rejection rule.
    pub fn present(buf: &[u8]) -> bool {
        buf.len() >= PACK_HEADER_SIZE && buf[buf.len() - PACK_HEADER_SIZE..][..4] == MAGIC_BYTES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adler32_matches_known_vector() {
        // adler32("Wikipedia") from RFC 1950 arithmetic.
        assert_eq!(adler32(b"Wikipedia"), 0x11e6_0398);
        let mut inc = Adler32::new();
        inc.update(b"Wiki");
        inc.update(b"pedia");
        assert_eq!(inc.finish(), 0x11e6_0398);
    }

    #[test]
    fn records_round_trip_in_both_endiannesses() {
        for e in [Endianness::Little, Endianness::Big] {
            let b = BInfo { u_len: 0x1234, c_len: 0x99, method: 2, filter: 1, filter_param: 1 };
            assert_eq!(BInfo::decode(e, &b.encode(e), 0).unwrap(), b);

            let l = LInfo { checksum: 5, loader_size: 0x180, version: VERSION, format: FMT_EXEC };
            assert_eq!(LInfo::decode(e, &l.encode(e), 0).unwrap(), l);

            let p = PInfo { program_id: 62, orig_file_size: 0x2000, block_size: 0x2000 };
            assert_eq!(PInfo::decode(e, &p.encode(e), 0).unwrap(), p);

            let h = PackHeader {
                version: VERSION,
                format: FMT_SHLIB,
                method: 3,
                filter: 0,
                filter_param: 0,
                u_adler: 0xdead_beef,
                c_adler: 0xfeed_face,
                u_file_size: 0x4000,
                xct_off: 0x1000,
                so_slide: -0x2000,
                asl_pages: 1,
            };
            assert_eq!(PackHeader::decode(e, &h.encode(e)).unwrap(), h);
        }
    }

    #[test]
    fn terminator_magic_is_little_endian_on_any_target() {
        let t = BInfo::terminator();
        assert!(BInfo::is_terminator(&t, 0));
        assert_eq!(&t[4..8], b"SQZ!");
        let decoded = BInfo::decode(Endianness::Big, &t, 0).unwrap();
        assert_eq!(decoded.u_len, 0);
    }

    #[test]
    fn corrupt_trailer_is_detected() {
        let h = PackHeader {
            version: VERSION,
            format: FMT_EXEC,
            method: 2,
            filter: 0,
            filter_param: 0,
            u_adler: 1,
            c_adler: 2,
            u_file_size: 3,
            xct_off: 0,
            so_slide: 0,
            asl_pages: 0,
        };
        let mut buf = h.encode(Endianness::Little).to_vec();
        buf[8] ^= 0xff;
        assert!(matches!(
            PackHeader::decode(Endianness::Little, &buf),
            Err(Error::CompressedDataViolation(_))
        ));
    }

    #[test]
    fn plausibility_invariant() {
        let ok = BInfo { u_len: 100, c_len: 60, method: 2, filter: 0, filter_param: 0 };
        assert!(ok.is_plausible());
        let literal = BInfo { u_len: 100, c_len: 100, method: 0, filter: 0, filter_param: 0 };
        assert!(literal.is_plausible());
        let grown = BInfo { u_len: 100, c_len: 100, method: 2, filter: 0, filter_param: 0 };
        assert!(!grown.is_plausible());
        let unknown = BInfo { u_len: 100, c_len: 50, method: 9, filter: 0, filter_param: 0 };
        assert!(!unknown.is_plausible());
    }
}
