//! PT_DYNAMIC indexing and table-bounds inference.
//!
//! The dynamic section names several tables (symbols, strings, both hash
//! forms) without recording their lengths. The format leaves them unbounded;
//! the indexer makes them safe to parse by collecting the file offsets of
//! every table on a fixed watch list, sorting them, appending the file size
//! as a sentinel, and bounding each table by the distance to the next start.
//! Hash-table validation is deliberately exhaustive: a crafted input that
//! fails any check is rejected outright, never partially trusted.

use std::collections::BTreeMap;

use crate::elf::consts::*;
use crate::elf::model::{read_dyn, read_sym, Abi, FileHeader, Phdr, Sym};
use crate::error::{Error, Result};

/// Tags whose values start a table that must be bounded by inference.
const WATCH_TAGS: &[i64] = &[
    DT_SYMTAB,
    DT_VERSYM,
    DT_VERNEED,
    DT_HASH,
    DT_GNU_HASH,
    DT_STRTAB,
    DT_VERDEF,
    DT_REL,
    DT_RELA,
    DT_JMPREL,
    DT_FINI_ARRAY,
    DT_INIT_ARRAY,
    DT_PREINIT_ARRAY,
];

#[derive(Debug, Clone, Copy)]
pub struct RelocTable {
    pub off: u64,
    pub size: u64,
    pub entsize: usize,
    pub with_addend: bool,
}

#[derive(Debug, Clone)]
pub struct DynIndex {
    /// File offset of the dynamic segment itself.
    pub dyn_off: u64,
    /// Entries up to and including the terminating DT_NULL.
    pub entry_count: usize,
    /// Dyn record capacity declared by p_filesz (may exceed entry_count).
    pub slot_capacity: usize,
    pub dt: BTreeMap<i64, u64>,
    pub needed: Vec<u64>,
    /// Sorted watch-list table-start file offsets, file size appended.
    pub bounds: Vec<u64>,
    pub symtab_off: Option<u64>,
    pub sym_count: usize,
    pub strtab_off: Option<u64>,
    pub strtab_end: u64,
}

pub fn vaddr_to_off(phdrs: &[Phdr], va: u64) -> Option<u64> {
    phdrs
        .iter()
        .filter(|p| p.is_load())
        .find_map(|p| p.offset_of_vaddr(va))
}

impl DynIndex {
    /// Walk the single PT_DYNAMIC segment and build the index. Returns
    /// `Ok(None)` when the image has no dynamic segment at all.
    pub fn build(buf: &[u8], hdr: &FileHeader, phdrs: &[Phdr]) -> Result<Option<DynIndex>> {
        let abi = hdr.abi;
        let mut it = phdrs.iter().filter(|p| p.p_type == PT_DYNAMIC);
        let dynamic = match it.next() {
            Some(p) => *p,
            None => return Ok(None),
        };
        if it.next().is_some() {
            return Err(Error::MalformedDynamic("more than one PT_DYNAMIC"));
        }
        let entsize = abi.class.dyn_size();
        let dyn_off = dynamic.offset;
        let capacity = (dynamic.filesz as usize) / entsize;

        let mut dt = BTreeMap::new();
        let mut needed = Vec::new();
        let mut entry_count = 0usize;
        let mut saw_null = false;
        for i in 0..capacity {
            let off = dyn_off as usize + i * entsize;
            let (tag, val) = read_dyn(abi, buf, off)?;
            entry_count = i + 1;
            if tag == DT_NULL {
                saw_null = true;
                break;
            }
            if tag == DT_NEEDED {
                needed.push(val);
                continue;
            }
            match dt.get(&tag) {
                Some(&prev) if prev != val => {
                    return Err(Error::MalformedDynamic("conflicting duplicate tag"));
                }
                _ => {
                    dt.insert(tag, val);
                }
            }
        }
        if !saw_null {
            return Err(Error::MalformedDynamic("DT_NULL not found in segment"));
        }

        // Bounds inference: collect present watch-list table starts.
        let mut bounds: Vec<u64> = WATCH_TAGS
            .iter()
            .filter_map(|tag| dt.get(tag))
            .filter_map(|&va| vaddr_to_off(phdrs, va))
            .collect();
        bounds.push(buf.len() as u64);
        bounds.sort_unstable();
        bounds.dedup();

        let table_end = |off: u64| -> u64 {
            bounds
                .iter()
                .copied()
                .find(|&b| b > off)
                .unwrap_or(buf.len() as u64)
        };

        let symtab_off = dt
            .get(&DT_SYMTAB)
            .map(|&va| vaddr_to_off(phdrs, va).ok_or(Error::MalformedDynamic("DT_SYMTAB outside any PT_LOAD")))
            .transpose()?;
        let mut sym_count = 0usize;
        if let Some(off) = symtab_off {
            sym_count = ((table_end(off) - off) as usize) / abi.class.sym_size();
        }

        let strtab_off = dt
            .get(&DT_STRTAB)
            .map(|&va| vaddr_to_off(phdrs, va).ok_or(Error::MalformedDynamic("DT_STRTAB outside any PT_LOAD")))
            .transpose()?;
        let mut strtab_end = 0u64;
        if let Some(off) = strtab_off {
            strtab_end = table_end(off);
            if let Some(&sz) = dt.get(&DT_STRSZ) {
                strtab_end = strtab_end.min(off.saturating_add(sz));
            }
        }

        let index = DynIndex {
            dyn_off,
            entry_count,
            slot_capacity: capacity,
            dt,
            needed,
            bounds,
            symtab_off,
            sym_count,
            strtab_off,
            strtab_end,
        };

        if let Some(&va) = index.dt.get(&DT_HASH) {
            let off = vaddr_to_off(phdrs, va)
                .ok_or(Error::CorruptHashTable("DT_HASH outside any PT_LOAD"))?;
            validate_sysv_hash(buf, abi, off, index.table_end(off), index.sym_count)?;
        }
        if let Some(&va) = index.dt.get(&DT_GNU_HASH) {
            let off = vaddr_to_off(phdrs, va)
                .ok_or(Error::CorruptHashTable("DT_GNU_HASH outside any PT_LOAD"))?;
            validate_gnu_hash(buf, abi, off, index.table_end(off), index.sym_count)?;
        }
        Ok(Some(index))
    }

    /// Distance-to-next-start bound for a table beginning at `off`.
    pub fn table_end(&self, off: u64) -> u64 {
        self.bounds
            .iter()
            .copied()
            .find(|&b| b > off)
            .unwrap_or(*self.bounds.last().unwrap_or(&off))
    }

    /// File offset of the value field of the first entry carrying `tag`.
    pub fn value_slot(&self, abi: Abi, buf: &[u8], tag: i64) -> Result<Option<u64>> {
        let entsize = abi.class.dyn_size();
        for i in 0..self.entry_count {
            let off = self.dyn_off as usize + i * entsize;
            let (t, _) = read_dyn(abi, buf, off)?;
            if t == tag {
                return Ok(Some((off + abi.class.addr_size()) as u64));
            }
        }
        Ok(None)
    }

    /// File offset of the value field of a trailing unused DT_NULL slot, if
    /// the segment declares more capacity than it uses.
    pub fn spare_null_slot(&self, abi: Abi) -> Option<u64> {
        if self.entry_count < self.slot_capacity {
            let entsize = abi.class.dyn_size();
            let off = self.dyn_off as usize + self.entry_count * entsize;
            Some((off + abi.class.addr_size()) as u64)
        } else {
            None
        }
    }

    /// Relocation tables reachable from the dynamic section, with their
    /// explicitly-tagged sizes.
    pub fn reloc_tables(&self, abi: Abi, phdrs: &[Phdr]) -> Result<Vec<RelocTable>> {
        let mut out = Vec::new();
        let mut push = |va_tag: i64, sz_tag: i64, with_addend: bool| -> Result<()> {
            if let (Some(&va), Some(&size)) = (self.dt.get(&va_tag), self.dt.get(&sz_tag)) {
                let off = vaddr_to_off(phdrs, va)
                    .ok_or(Error::MalformedDynamic("relocation table outside any PT_LOAD"))?;
                let entsize = if with_addend {
                    abi.class.rela_size()
                } else {
                    abi.class.rel_size()
                };
                out.push(RelocTable { off, size, entsize, with_addend });
            }
            Ok(())
        };
        push(DT_REL, DT_RELSZ, false)?;
        push(DT_RELA, DT_RELASZ, true)?;
        if let Some(&va) = self.dt.get(&DT_JMPREL) {
            let with_addend = self.dt.get(&DT_PLTREL).copied() == Some(DT_RELA as u64);
            if let Some(&size) = self.dt.get(&DT_PLTRELSZ) {
                let off = vaddr_to_off(phdrs, va)
                    .ok_or(Error::MalformedDynamic("DT_JMPREL outside any PT_LOAD"))?;
                let entsize = if with_addend {
                    abi.class.rela_size()
                } else {
                    abi.class.rel_size()
                };
                out.push(RelocTable { off, size, entsize, with_addend });
            }
        }
        Ok(out)
    }

    pub fn sym(&self, abi: Abi, buf: &[u8], idx: usize) -> Result<Sym> {
        let off = self
            .symtab_off
            .ok_or(Error::MalformedDynamic("no DT_SYMTAB"))?;
        if idx >= self.sym_count {
            return Err(Error::OutOfBounds);
        }
        read_sym(abi, buf, off as usize + idx * abi.class.sym_size())
    }

    /// NUL-terminated name of a symbol, bounded by the inferred string-table
    /// end; absent or unterminated names come back as None.
    pub fn sym_name<'a>(&self, abi: Abi, buf: &'a [u8], idx: usize) -> Result<Option<&'a [u8]>> {
        let sym = self.sym(abi, buf, idx)?;
        let strtab = match self.strtab_off {
            Some(s) => s,
            None => return Ok(None),
        };
        let start = strtab.saturating_add(sym.name as u64);
        if start >= self.strtab_end || self.strtab_end as usize > buf.len() {
            return Ok(None);
        }
        let region = &buf[start as usize..self.strtab_end as usize];
        Ok(region.iter().position(|&b| b == 0).map(|n| &region[..n]))
    }
}

/// SysV hash: header fits, nchain does not exceed the inferred symbol count,
/// buckets stay inside the chain array, every chain terminates.
fn validate_sysv_hash(buf: &[u8], abi: Abi, off: u64, end: u64, sym_count: usize) -> Result<()> {
    let e = abi.endian;
    let off = off as usize;
    let nbucket = e.get32(buf, off).map_err(|_| Error::CorruptHashTable("truncated header"))? as usize;
    let nchain = e.get32(buf, off + 4).map_err(|_| Error::CorruptHashTable("truncated header"))? as usize;
    let need = 8u64
        .checked_add(4 * (nbucket as u64 + nchain as u64))
        .ok_or(Error::CorruptHashTable("size overflow"))?;
    if (off as u64).checked_add(need).map_or(true, |e2| e2 > end) {
        return Err(Error::CorruptHashTable("table exceeds inferred bound"));
    }
    if nchain > sym_count {
        return Err(Error::CorruptHashTable("nchain exceeds symbol table"));
    }
    let buckets = off + 8;
    let chains = buckets + 4 * nbucket;
    for b in 0..nbucket {
        let mut idx = e.get32(buf, buckets + 4 * b)? as usize;
        let mut steps = 0usize;
        while idx != 0 {
            if idx >= nchain {
                return Err(Error::CorruptHashTable("bucket outside chain array"));
            }
            steps += 1;
            if steps > nchain {
                return Err(Error::CorruptHashTable("chain does not terminate"));
            }
            idx = e.get32(buf, chains + 4 * idx)? as usize;
        }
    }
    Ok(())
}

/// GNU hash: bloom word count is a nonzero power of two, the shift is inside
/// the word width, buckets land inside the inferred symbol range minus the
/// symbol bias, and every chain ends before the table bound.
fn validate_gnu_hash(buf: &[u8], abi: Abi, off: u64, end: u64, sym_count: usize) -> Result<()> {
    let e = abi.endian;
    let o = off as usize;
    let err = |why| Err(Error::CorruptHashTable(why));
    let nbuckets = e.get32(buf, o).map_err(|_| Error::CorruptHashTable("truncated header"))? as usize;
    let symbias = e.get32(buf, o + 4)? as usize;
    let bloom_size = e.get32(buf, o + 8)? as usize;
    let bloom_shift = e.get32(buf, o + 12)?;
    if nbuckets == 0 {
        return err("zero buckets");
    }
    if bloom_size == 0 || !bloom_size.is_power_of_two() {
        return err("bloom word count not a power of two");
    }
    if bloom_shift >= abi.class.bits() {
        return err("bloom shift exceeds word width");
    }
    if symbias > sym_count {
        return err("symbol bias exceeds symbol table");
    }
    let hashed = sym_count - symbias;
    let buckets_at = o + 16 + bloom_size * abi.class.addr_size();
    let hashval_at = buckets_at + 4 * nbuckets;
    let need = hashval_at as u64 + 4 * hashed as u64;
    if need > end {
        return err("table exceeds inferred bound");
    }
    for b in 0..nbuckets {
        let idx = e.get32(buf, buckets_at + 4 * b)? as usize;
        if idx == 0 {
            continue;
        }
        if idx < symbias || idx >= sym_count {
            return err("bucket outside symbol range");
        }
        let mut h = idx - symbias;
        loop {
            if h >= hashed {
                return err("chain runs past table bound");
            }
            let v = e.get32(buf, hashval_at + 4 * h)?;
            if v & 1 != 0 {
                break;
            }
            h += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::model::{Abi, ElfClass, FileHeader};
    use crate::endian::Endianness;

    const ABI: Abi = Abi { class: ElfClass::Elf64, endian: Endianness::Little };

    fn fake_hdr() -> FileHeader {
        FileHeader {
            abi: ABI,
            osabi: 0,
            e_type: ET_DYN,
            machine: EM_X86_64,
            entry: 0,
            phoff: 0,
            shoff: 0,
            flags: 0,
            ehsize: 64,
            phentsize: 56,
            phnum: 2,
            shentsize: 0,
            shnum: 0,
            shstrndx: 0,
        }
    }

    // One identity-mapped LOAD plus a dynamic segment at `dyn_off`.
    fn fake_phdrs(file_len: u64, dyn_off: u64, dyn_sz: u64) -> Vec<Phdr> {
        vec![
            Phdr {
                p_type: PT_LOAD,
                flags: PF_R | PF_X,
                offset: 0,
                vaddr: 0,
                paddr: 0,
                filesz: file_len,
                memsz: file_len,
                align: 0x1000,
            },
            Phdr {
                p_type: PT_DYNAMIC,
                flags: PF_R | PF_W,
                offset: dyn_off,
                vaddr: dyn_off,
                paddr: dyn_off,
                filesz: dyn_sz,
                memsz: dyn_sz,
                align: 8,
            },
        ]
    }

    fn put_dyn(buf: &mut [u8], at: usize, tag: i64, val: u64) {
        ABI.endian.set64(buf, at, tag as u64).unwrap();
        ABI.endian.set64(buf, at + 8, val).unwrap();
    }

    #[test]
    fn bounds_are_distances_between_sorted_table_starts() {
        let mut buf = vec![0u8; 0x400];
        let dyn_off = 0x40;
        put_dyn(&mut buf, 0x40, DT_SYMTAB, 0x100);
        put_dyn(&mut buf, 0x50, DT_STRTAB, 0x280);
        put_dyn(&mut buf, 0x60, DT_GNU_HASH, 0x300);
        put_dyn(&mut buf, 0x70, DT_NULL, 0);
        // Keep the GNU hash itself valid: one bucket, no bias, bloom of 1.
        ABI.endian.set32(&mut buf, 0x300, 1).unwrap(); // nbuckets
        ABI.endian.set32(&mut buf, 0x304, 16).unwrap(); // symbias == sym_count
        ABI.endian.set32(&mut buf, 0x308, 1).unwrap(); // bloom_size
        ABI.endian.set32(&mut buf, 0x30c, 6).unwrap(); // bloom_shift

        let phdrs = fake_phdrs(0x400, dyn_off, 0x40);
        let idx = DynIndex::build(&buf, &fake_hdr(), &phdrs).unwrap().unwrap();
        // symtab is bounded by the strtab start: (0x280 - 0x100) / 24.
        assert_eq!(idx.symtab_off, Some(0x100));
        assert_eq!(idx.sym_count, 16);
        // strtab is bounded by the gnu hash start.
        assert_eq!(idx.strtab_end, 0x300);
        // the last table is bounded by the file-size sentinel.
        assert_eq!(idx.table_end(0x300), 0x400);
    }

    #[test]
    fn missing_dt_null_is_malformed() {
        let mut buf = vec![0u8; 0x100];
        put_dyn(&mut buf, 0x40, DT_STRTAB, 0x80);
        // Segment claims one entry and it is not DT_NULL.
        let phdrs = fake_phdrs(0x100, 0x40, 16);
        assert_eq!(
            DynIndex::build(&buf, &fake_hdr(), &phdrs).unwrap_err(),
            Error::MalformedDynamic("DT_NULL not found in segment"),
        );
    }

    #[test]
    fn conflicting_duplicate_tags_are_rejected_but_dt_needed_may_repeat() {
        let mut buf = vec![0u8; 0x200];
        put_dyn(&mut buf, 0x40, DT_NEEDED, 1);
        put_dyn(&mut buf, 0x50, DT_NEEDED, 9);
        put_dyn(&mut buf, 0x60, DT_STRTAB, 0x100);
        put_dyn(&mut buf, 0x70, DT_NULL, 0);
        let phdrs = fake_phdrs(0x200, 0x40, 0x40);
        let idx = DynIndex::build(&buf, &fake_hdr(), &phdrs).unwrap().unwrap();
        assert_eq!(idx.needed, vec![1, 9]);

        put_dyn(&mut buf, 0x50, DT_STRTAB, 0x180);
        assert_eq!(
            DynIndex::build(&buf, &fake_hdr(), &phdrs).unwrap_err(),
            Error::MalformedDynamic("conflicting duplicate tag"),
        );
    }

    #[test]
    fn sysv_hash_chain_and_bucket_checks() {
        let mut buf = vec![0u8; 0x400];
        put_dyn(&mut buf, 0x40, DT_SYMTAB, 0x100);
        put_dyn(&mut buf, 0x50, DT_HASH, 0x200);
        put_dyn(&mut buf, 0x60, DT_NULL, 0);
        let phdrs = fake_phdrs(0x400, 0x40, 0x40);
        // nbucket=1 nchain=2, bucket[0]=1, chain[1]=0: valid.
        ABI.endian.set32(&mut buf, 0x200, 1).unwrap();
        ABI.endian.set32(&mut buf, 0x204, 2).unwrap();
        ABI.endian.set32(&mut buf, 0x208, 1).unwrap();
        ABI.endian.set32(&mut buf, 0x210, 0).unwrap();
        assert!(DynIndex::build(&buf, &fake_hdr(), &phdrs).is_ok());

        // Bucket pointing outside the chain array.
        ABI.endian.set32(&mut buf, 0x208, 7).unwrap();
        assert!(matches!(
            DynIndex::build(&buf, &fake_hdr(), &phdrs),
            Err(Error::CorruptHashTable(_)),
        ));

        // Self-looping chain never terminates.
        ABI.endian.set32(&mut buf, 0x208, 1).unwrap();
        ABI.endian.set32(&mut buf, 0x210, 1).unwrap();
        assert_eq!(
            DynIndex::build(&buf, &fake_hdr(), &phdrs).unwrap_err(),
            Error::CorruptHashTable("chain does not terminate"),
        );
    }

    #[test]
    fn gnu_hash_rejects_bad_bloom_geometry() {
        let mut buf = vec![0u8; 0x400];
        put_dyn(&mut buf, 0x40, DT_SYMTAB, 0x100);
        put_dyn(&mut buf, 0x50, DT_GNU_HASH, 0x300);
        put_dyn(&mut buf, 0x60, DT_NULL, 0);
        let phdrs = fake_phdrs(0x400, 0x40, 0x40);
        ABI.endian.set32(&mut buf, 0x300, 1).unwrap(); // nbuckets
        ABI.endian.set32(&mut buf, 0x304, 0).unwrap(); // symbias
        ABI.endian.set32(&mut buf, 0x308, 3).unwrap(); // bloom_size: not a power of two
        ABI.endian.set32(&mut buf, 0x30c, 6).unwrap();
        assert_eq!(
            DynIndex::build(&buf, &fake_hdr(), &phdrs).unwrap_err(),
            Error::CorruptHashTable("bloom word count not a power of two"),
        );

        ABI.endian.set32(&mut buf, 0x308, 4).unwrap();
        ABI.endian.set32(&mut buf, 0x30c, 64).unwrap(); // shift == word width
        assert_eq!(
            DynIndex::build(&buf, &fake_hdr(), &phdrs).unwrap_err(),
            Error::CorruptHashTable("bloom shift exceeds word width"),
        );
    }

    #[test]
    fn truncated_dynamic_reads_stay_in_bounds() {
        // Dynamic segment whose declared size runs past the buffer: the walk
        // must fail with OutOfBounds before reading anything outside.
        let buf = vec![0u8; 0x50];
        let phdrs = fake_phdrs(0x50, 0x48, 0x100);
        assert_eq!(
            DynIndex::build(&buf, &fake_hdr(), &phdrs).unwrap_err(),
            Error::OutOfBounds,
        );
    }
}
