//! Typed, bounds-checked views over a raw ELF image.
//!
//! The 32- and 64-bit record layouts differ in field order and width (the
//! 64-bit Phdr puts p_flags before p_offset), so every accessor dispatches on
//! an `Abi` value fixed once when the identification bytes are parsed. All
//! reads and writes go through `Endianness`, which bounds-checks them.

use crate::elf::consts::*;
use crate::endian::Endianness;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfClass {
    Elf32,
    Elf64,
}

impl ElfClass {
    pub fn ehdr_size(self) -> usize {
        match self {
            ElfClass::Elf32 => 52,
            ElfClass::Elf64 => 64,
        }
    }
    pub fn phdr_size(self) -> usize {
        match self {
            ElfClass::Elf32 => 32,
            ElfClass::Elf64 => 56,
        }
    }
    pub fn shdr_size(self) -> usize {
        match self {
            ElfClass::Elf32 => 40,
            ElfClass::Elf64 => 64,
        }
    }
    pub fn dyn_size(self) -> usize {
        match self {
            ElfClass::Elf32 => 8,
            ElfClass::Elf64 => 16,
        }
    }
    pub fn sym_size(self) -> usize {
        match self {
            ElfClass::Elf32 => 16,
            ElfClass::Elf64 => 24,
        }
    }
    pub fn rel_size(self) -> usize {
        match self {
            ElfClass::Elf32 => 8,
            ElfClass::Elf64 => 16,
        }
    }
    pub fn rela_size(self) -> usize {
        match self {
            ElfClass::Elf32 => 12,
            ElfClass::Elf64 => 24,
        }
    }
    pub fn addr_size(self) -> usize {
        match self {
            ElfClass::Elf32 => 4,
            ElfClass::Elf64 => 8,
        }
    }
    pub fn bits(self) -> u32 {
        match self {
            ElfClass::Elf32 => 32,
            ElfClass::Elf64 => 64,
        }
    }
}

/// The `(width, endianness)` pair every other component is generic over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abi {
    pub class: ElfClass,
    pub endian: Endianness,
}

impl Abi {
    /// Read a class-width address/offset field.
    pub fn addr(&self, buf: &[u8], off: usize) -> Result<u64> {
        match self.class {
            ElfClass::Elf32 => Ok(self.endian.get32(buf, off)? as u64),
            ElfClass::Elf64 => self.endian.get64(buf, off),
        }
    }

    /// Write a class-width field; a value that does not fit the target word
    /// width is a `CantPack`, never a silent truncation.
    pub fn set_addr(&self, buf: &mut [u8], off: usize, v: u64) -> Result<()> {
        match self.class {
            ElfClass::Elf32 => {
                if v > u32::MAX as u64 {
                    return Err(Error::cant_pack("value does not fit 32-bit field"));
                }
                self.endian.set32(buf, off, v as u32)
            }
            ElfClass::Elf64 => self.endian.set64(buf, off, v),
        }
    }

    /// Read a class-width signed field (d_tag).
    pub fn sword(&self, buf: &[u8], off: usize) -> Result<i64> {
        match self.class {
            ElfClass::Elf32 => Ok(self.endian.get32(buf, off)? as i32 as i64),
            ElfClass::Elf64 => Ok(self.endian.get64(buf, off)? as i64),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub abi: Abi,
    pub osabi: u8,
    pub e_type: u16,
    pub machine: u16,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

/// Parse and validate `e_ident` plus the rest of the file header. This is
/// the single format check of the pipeline: once it passes, class and
/// endianness are fixed for the remainder of the operation.
pub fn parse_file_header(buf: &[u8]) -> Result<FileHeader> {
    if buf.len() < EI_NIDENT {
        return Err(Error::InvalidFormat("shorter than e_ident"));
    }
    if buf[..4] != ELFMAG {
        return Err(Error::InvalidFormat("bad magic"));
    }
    let class = match buf[EI_CLASS] {
        ELFCLASS32 => ElfClass::Elf32,
        ELFCLASS64 => ElfClass::Elf64,
        _ => return Err(Error::InvalidFormat("unrecognized EI_CLASS")),
    };
    let endian = match buf[EI_DATA] {
        ELFDATA2LSB => Endianness::Little,
        ELFDATA2MSB => Endianness::Big,
        _ => return Err(Error::InvalidFormat("unrecognized EI_DATA")),
    };
    if buf[EI_VERSION] != EV_CURRENT {
        return Err(Error::InvalidFormat("unrecognized EI_VERSION"));
    }
    let abi = Abi { class, endian };
    if buf.len() < class.ehdr_size() {
        return Err(Error::InvalidFormat("truncated file header"));
    }
    let e = endian;
    let (entry, phoff, shoff, flags_off) = match class {
        ElfClass::Elf32 => (
            e.get32(buf, 24)? as u64,
            e.get32(buf, 28)? as u64,
            e.get32(buf, 32)? as u64,
            36usize,
        ),
        ElfClass::Elf64 => (e.get64(buf, 24)?, e.get64(buf, 32)?, e.get64(buf, 40)?, 48usize),
    };
    let hdr = FileHeader {
        abi,
        osabi: buf[EI_OSABI],
        e_type: e.get16(buf, 16)?,
        machine: e.get16(buf, 18)?,
        entry,
        phoff,
        shoff,
        flags: e.get32(buf, flags_off)?,
        ehsize: e.get16(buf, flags_off + 4)?,
        phentsize: e.get16(buf, flags_off + 6)?,
        phnum: e.get16(buf, flags_off + 8)?,
        shentsize: e.get16(buf, flags_off + 10)?,
        shnum: e.get16(buf, flags_off + 12)?,
        shstrndx: e.get16(buf, flags_off + 14)?,
    };
    if e.get32(buf, 20)? != EV_CURRENT as u32 {
        return Err(Error::InvalidFormat("unrecognized e_version"));
    }
    if hdr.ehsize as usize != class.ehdr_size() {
        return Err(Error::InvalidFormat("e_ehsize does not match class"));
    }
    if hdr.phnum > 0 && hdr.phentsize as usize != class.phdr_size() {
        return Err(Error::InvalidFormat("e_phentsize does not match class"));
    }
    if hdr.shnum > 0 && hdr.shentsize as usize != class.shdr_size() {
        return Err(Error::InvalidFormat("e_shentsize does not match class"));
    }
    Ok(hdr)
}

/// Serialize a file header at offset 0 of `buf`, including `e_ident`.
pub fn write_file_header(buf: &mut [u8], h: &FileHeader) -> Result<()> {
    if buf.len() < h.abi.class.ehdr_size() {
        return Err(Error::OutOfBounds);
    }
    buf[..4].copy_from_slice(&ELFMAG);
    buf[EI_CLASS] = match h.abi.class {
        ElfClass::Elf32 => ELFCLASS32,
        ElfClass::Elf64 => ELFCLASS64,
    };
    buf[EI_DATA] = match h.abi.endian {
        Endianness::Little => ELFDATA2LSB,
        Endianness::Big => ELFDATA2MSB,
    };
    buf[EI_VERSION] = EV_CURRENT;
    buf[EI_OSABI] = h.osabi;
    for b in &mut buf[EI_OSABI + 1..EI_NIDENT] {
        *b = 0;
    }
    let e = h.abi.endian;
    e.set16(buf, 16, h.e_type)?;
    e.set16(buf, 18, h.machine)?;
    e.set32(buf, 20, EV_CURRENT as u32)?;
    let flags_off = match h.abi.class {
        ElfClass::Elf32 => {
            h.abi.set_addr(buf, 24, h.entry)?;
            h.abi.set_addr(buf, 28, h.phoff)?;
            h.abi.set_addr(buf, 32, h.shoff)?;
            36
        }
        ElfClass::Elf64 => {
            e.set64(buf, 24, h.entry)?;
            e.set64(buf, 32, h.phoff)?;
            e.set64(buf, 40, h.shoff)?;
            48
        }
    };
    e.set32(buf, flags_off, h.flags)?;
    e.set16(buf, flags_off + 4, h.ehsize)?;
    e.set16(buf, flags_off + 6, h.phentsize)?;
    e.set16(buf, flags_off + 8, h.phnum)?;
    e.set16(buf, flags_off + 10, h.shentsize)?;
    e.set16(buf, flags_off + 12, h.shnum)?;
    e.set16(buf, flags_off + 14, h.shstrndx)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phdr {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

pub fn read_phdr(abi: Abi, buf: &[u8], off: usize) -> Result<Phdr> {
    let e = abi.endian;
    match abi.class {
        ElfClass::Elf32 => Ok(Phdr {
            p_type: e.get32(buf, off)?,
            offset: e.get32(buf, off + 4)? as u64,
            vaddr: e.get32(buf, off + 8)? as u64,
            paddr: e.get32(buf, off + 12)? as u64,
            filesz: e.get32(buf, off + 16)? as u64,
            memsz: e.get32(buf, off + 20)? as u64,
            flags: e.get32(buf, off + 24)?,
            align: e.get32(buf, off + 28)? as u64,
        }),
        ElfClass::Elf64 => Ok(Phdr {
            p_type: e.get32(buf, off)?,
            flags: e.get32(buf, off + 4)?,
            offset: e.get64(buf, off + 8)?,
            vaddr: e.get64(buf, off + 16)?,
            paddr: e.get64(buf, off + 24)?,
            filesz: e.get64(buf, off + 32)?,
            memsz: e.get64(buf, off + 40)?,
            align: e.get64(buf, off + 48)?,
        }),
    }
}

pub fn write_phdr(abi: Abi, buf: &mut [u8], off: usize, p: &Phdr) -> Result<()> {
    let e = abi.endian;
    e.set32(buf, off, p.p_type)?;
    match abi.class {
        ElfClass::Elf32 => {
            abi.set_addr(buf, off + 4, p.offset)?;
            abi.set_addr(buf, off + 8, p.vaddr)?;
            abi.set_addr(buf, off + 12, p.paddr)?;
            abi.set_addr(buf, off + 16, p.filesz)?;
            abi.set_addr(buf, off + 20, p.memsz)?;
            e.set32(buf, off + 24, p.flags)?;
            abi.set_addr(buf, off + 28, p.align)?;
        }
        ElfClass::Elf64 => {
            e.set32(buf, off + 4, p.flags)?;
            e.set64(buf, off + 8, p.offset)?;
            e.set64(buf, off + 16, p.vaddr)?;
            e.set64(buf, off + 24, p.paddr)?;
            e.set64(buf, off + 32, p.filesz)?;
            e.set64(buf, off + 40, p.memsz)?;
            e.set64(buf, off + 48, p.align)?;
        }
    }
    Ok(())
}

impl Phdr {
    pub fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }
    pub fn is_writable(&self) -> bool {
        self.flags & PF_W != 0
    }
    pub fn file_end(&self) -> u64 {
        self.offset.saturating_add(self.filesz)
    }
    /// File offset of a virtual address inside this segment's file image.
    pub fn offset_of_vaddr(&self, va: u64) -> Option<u64> {
        if va >= self.vaddr && va < self.vaddr.saturating_add(self.filesz) {
            Some(self.offset + (va - self.vaddr))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Shdr {
    pub name: u32,
    pub sh_type: u32,
    pub flags: u64,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
    pub info: u32,
    pub addralign: u64,
    pub entsize: u64,
}

pub fn read_shdr(abi: Abi, buf: &[u8], off: usize) -> Result<Shdr> {
    let e = abi.endian;
    match abi.class {
        ElfClass::Elf32 => Ok(Shdr {
            name: e.get32(buf, off)?,
            sh_type: e.get32(buf, off + 4)?,
            flags: e.get32(buf, off + 8)? as u64,
            addr: e.get32(buf, off + 12)? as u64,
            offset: e.get32(buf, off + 16)? as u64,
            size: e.get32(buf, off + 20)? as u64,
            link: e.get32(buf, off + 24)?,
            info: e.get32(buf, off + 28)?,
            addralign: e.get32(buf, off + 32)? as u64,
            entsize: e.get32(buf, off + 36)? as u64,
        }),
        ElfClass::Elf64 => Ok(Shdr {
            name: e.get32(buf, off)?,
            sh_type: e.get32(buf, off + 4)?,
            flags: e.get64(buf, off + 8)?,
            addr: e.get64(buf, off + 16)?,
            offset: e.get64(buf, off + 24)?,
            size: e.get64(buf, off + 32)?,
            link: e.get32(buf, off + 40)?,
            info: e.get32(buf, off + 44)?,
            addralign: e.get64(buf, off + 48)?,
            entsize: e.get64(buf, off + 56)?,
        }),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Sym {
    pub name: u32,
    pub value: u64,
    pub size: u64,
    pub info: u8,
    pub other: u8,
    pub shndx: u16,
}

pub fn read_sym(abi: Abi, buf: &[u8], off: usize) -> Result<Sym> {
    let e = abi.endian;
    match abi.class {
        ElfClass::Elf32 => Ok(Sym {
            name: e.get32(buf, off)?,
            value: e.get32(buf, off + 4)? as u64,
            size: e.get32(buf, off + 8)? as u64,
            info: *buf.get(off + 12).ok_or(Error::OutOfBounds)?,
            other: *buf.get(off + 13).ok_or(Error::OutOfBounds)?,
            shndx: e.get16(buf, off + 14)?,
        }),
        ElfClass::Elf64 => Ok(Sym {
            name: e.get32(buf, off)?,
            info: *buf.get(off + 4).ok_or(Error::OutOfBounds)?,
            other: *buf.get(off + 5).ok_or(Error::OutOfBounds)?,
            shndx: e.get16(buf, off + 6)?,
            value: e.get64(buf, off + 8)?,
            size: e.get64(buf, off + 16)?,
        }),
    }
}

/// Offset of `st_value` within a symbol record; the decompression-time stash
/// for the hijacked init address lives in symbol 0's value field.
pub fn sym_value_field(class: ElfClass) -> usize {
    match class {
        ElfClass::Elf32 => 4,
        ElfClass::Elf64 => 8,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Reloc {
    pub offset: u64,
    pub sym: u32,
    pub r_type: u32,
    /// None for Rel-format entries.
    pub addend: Option<i64>,
}

pub fn read_reloc(abi: Abi, buf: &[u8], off: usize, with_addend: bool) -> Result<Reloc> {
    let e = abi.endian;
    let (offset, info) = match abi.class {
        ElfClass::Elf32 => (e.get32(buf, off)? as u64, e.get32(buf, off + 4)? as u64),
        ElfClass::Elf64 => (e.get64(buf, off)?, e.get64(buf, off + 8)?),
    };
    let (sym, r_type) = match abi.class {
        ElfClass::Elf32 => ((info >> 8) as u32, (info & 0xff) as u32),
        ElfClass::Elf64 => ((info >> 32) as u32, info as u32),
    };
    let addend = if with_addend {
        Some(match abi.class {
            ElfClass::Elf32 => e.get32(buf, off + 8)? as i32 as i64,
            ElfClass::Elf64 => e.get64(buf, off + 16)? as i64,
        })
    } else {
        None
    };
    Ok(Reloc { offset, sym, r_type, addend })
}

/// Read the whole program header table.
pub fn read_phdrs(buf: &[u8], h: &FileHeader) -> Result<Vec<Phdr>> {
    let mut out = Vec::with_capacity(h.phnum as usize);
    for i in 0..h.phnum as usize {
        out.push(read_phdr(h.abi, buf, h.phoff as usize + i * h.abi.class.phdr_size())?);
    }
    Ok(out)
}

/// Read the section header table; images stripped of one come back empty.
pub fn read_shdrs(buf: &[u8], h: &FileHeader) -> Result<Vec<Shdr>> {
    if h.shoff == 0 || h.shnum == 0 {
        return Ok(Vec::new());
    }
    let mut out = Vec::with_capacity(h.shnum as usize);
    for i in 0..h.shnum as usize {
        out.push(read_shdr(h.abi, buf, h.shoff as usize + i * h.abi.class.shdr_size())?);
    }
    Ok(out)
}

/// Read one dynamic entry as a `(tag, value)` pair.
pub fn read_dyn(abi: Abi, buf: &[u8], off: usize) -> Result<(i64, u64)> {
    let tag = abi.sword(buf, off)?;
    let val = abi.addr(buf, off + abi.class.addr_size())?;
    Ok((tag, val))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident64le() -> [u8; 64] {
        let mut b = [0u8; 64];
        b[..4].copy_from_slice(&ELFMAG);
        b[EI_CLASS] = ELFCLASS64;
        b[EI_DATA] = ELFDATA2LSB;
        b[EI_VERSION] = EV_CURRENT;
        b
    }

    #[test]
    fn rejects_bad_magic_and_class() {
        assert_eq!(
            parse_file_header(&[0u8; 64]),
            Err(Error::InvalidFormat("bad magic")),
        );
        let mut b = ident64le();
        b[EI_CLASS] = 9;
        assert!(matches!(parse_file_header(&b), Err(Error::InvalidFormat(_))));
    }

    #[test]
    fn header_round_trips_both_classes() {
        for (class, endian) in [
            (ElfClass::Elf64, Endianness::Little),
            (ElfClass::Elf32, Endianness::Big),
        ] {
            let abi = Abi { class, endian };
            let h = FileHeader {
                abi,
                osabi: 0,
                e_type: ET_EXEC,
                machine: if class == ElfClass::Elf64 { EM_X86_64 } else { EM_PPC },
                entry: 0x40_1000,
                phoff: class.ehdr_size() as u64,
                shoff: 0,
                flags: 0,
                ehsize: class.ehdr_size() as u16,
                phentsize: class.phdr_size() as u16,
                phnum: 2,
                shentsize: 0,
                shnum: 0,
                shstrndx: 0,
            };
            let mut buf = vec![0u8; 64];
            write_file_header(&mut buf, &h).unwrap();
            let back = parse_file_header(&buf).unwrap();
            assert_eq!(back.abi, abi);
            assert_eq!(back.entry, 0x40_1000);
            assert_eq!(back.phnum, 2);
        }
    }

    #[test]
    fn phdr_round_trips_and_respects_64bit_field_order() {
        let abi = Abi { class: ElfClass::Elf64, endian: Endianness::Little };
        let p = Phdr {
            p_type: PT_LOAD,
            flags: PF_R | PF_X,
            offset: 0,
            vaddr: 0x40_0000,
            paddr: 0x40_0000,
            filesz: 0x2000,
            memsz: 0x2000,
            align: 0x1000,
        };
        let mut buf = vec![0u8; 56];
        write_phdr(abi, &mut buf, 0, &p).unwrap();
        // p_flags sits at +4 in the 64-bit layout.
        assert_eq!(abi.endian.get32(&buf, 4).unwrap(), PF_R | PF_X);
        assert_eq!(read_phdr(abi, &buf, 0).unwrap(), p);
    }

    #[test]
    fn truncated_records_error_out() {
        let abi = Abi { class: ElfClass::Elf64, endian: Endianness::Little };
        let buf = vec![0u8; 30];
        assert_eq!(read_phdr(abi, &buf, 0), Err(Error::OutOfBounds));
        assert!(read_sym(abi, &buf, 16).is_err());
    }
}
