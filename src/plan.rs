//! Input classification and extent planning.
//!
//! The planner decides which byte ranges are compressed and which must stay
//! literal, and emits an ordered extent list that tiles `[0, file_size)`
//! exactly once. The plan is computed once, is immutable afterwards, and is
//! the value every later pipeline stage reads instead of shared object state.

use crate::arch::ArchInfo;
use crate::elf::consts::*;
use crate::elf::dynamic::DynIndex;
use crate::elf::model::{read_reloc, Abi, FileHeader, Phdr, Shdr};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Exec,
    /// Position-independent main program; compressed like an executable.
    PieExec,
    SharedLib,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentKind {
    /// Ehdr + Phdr array of an executable; stored as a literal block.
    HeaderLiteral,
    /// `[0, xct_off)` of a shared library; compressed into the block stream
    /// for reconstruction, and additionally kept literal at the front of the
    /// packed file for the dynamic linker.
    Prefix,
    Compress,
    /// Writable segment of a shared library; the dynamic linker mutates it
    /// before the stub runs, so it stays literal at its (slid) file offset.
    InPlace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub off: u64,
    pub len: u64,
    pub kind: ExtentKind,
}

impl Extent {
    pub fn end(&self) -> u64 {
        self.off + self.len
    }
    /// Whether this extent's bytes travel through the block stream.
    pub fn in_stream(&self) -> bool {
        self.kind != ExtentKind::InPlace
    }
}

#[derive(Debug, Clone)]
pub struct PackPlan {
    pub classification: Classification,
    pub extents: Vec<Extent>,
    /// Code boundary for shared libraries; 0 for executables.
    pub xct_off: u64,
    /// Index of the LOAD covering xct_off (shared libraries only).
    pub cover_load: Option<usize>,
    /// Extent index the byte filter may be applied to.
    pub filter_extent: Option<usize>,
    pub base_va: u64,
    pub brk_va: u64,
    pub file_size: u64,
}

/// Circular search for the LOAD with the smallest file offset strictly above
/// `off`; program headers are not guaranteed sorted.
pub fn next_load_after(phdrs: &[Phdr], off: u64) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, p) in phdrs.iter().enumerate() {
        if !p.is_load() || p.filesz == 0 {
            continue;
        }
        if p.offset > off && best.map_or(true, |b| p.offset < phdrs[b].offset) {
            best = Some(i);
        }
    }
    best
}

fn first_load(phdrs: &[Phdr]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, p) in phdrs.iter().enumerate() {
        if !p.is_load() || p.filesz == 0 {
            continue;
        }
        if best.map_or(true, |b| p.offset < phdrs[b].offset) {
            best = Some(i);
        }
    }
    best
}

/// ET_DYN disambiguation: a relocation against the C-runtime entry symbol
/// marks a PIE main program rather than a library.
fn has_start_main_reloc(
    buf: &[u8],
    abi: Abi,
    phdrs: &[Phdr],
    di: &DynIndex,
) -> Result<bool> {
    const ENTRY_SYMS: [&[u8]; 3] = [b"__libc_start_main", b"__uClibc_main", b"__libc_init"];
    for table in di.reloc_tables(abi, phdrs)? {
        let count = (table.size as usize) / table.entsize;
        for i in 0..count {
            let off = table.off as usize + i * table.entsize;
            let r = read_reloc(abi, buf, off, table.with_addend)?;
            if r.sym == 0 || (r.sym as usize) >= di.sym_count {
                continue;
            }
            if let Some(name) = di.sym_name(abi, buf, r.sym as usize)? {
                if ENTRY_SYMS.contains(&name) {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

pub fn classify(
    buf: &[u8],
    hdr: &FileHeader,
    phdrs: &[Phdr],
    di: Option<&DynIndex>,
) -> Result<Classification> {
    match hdr.e_type {
        ET_EXEC => Ok(Classification::Exec),
        ET_DYN => {
            let di = di.ok_or_else(|| Error::cant_pack("ET_DYN without PT_DYNAMIC"))?;
            if di.dt.get(&DT_FLAGS_1).map_or(false, |&f| f & DF_1_PIE != 0) {
                return Ok(Classification::PieExec);
            }
            if has_start_main_reloc(buf, hdr.abi, phdrs, di)? {
                return Ok(Classification::PieExec);
            }
            if di.dt.contains_key(&DT_INIT) || di.dt.contains_key(&DT_INIT_ARRAY) {
                Ok(Classification::SharedLib)
            } else {
                Err(Error::cant_pack("shared library without DT_INIT or DT_INIT_ARRAY"))
            }
        }
        _ => Err(Error::cant_pack("only ET_EXEC and ET_DYN are packable")),
    }
}

/// Code boundary of a shared library: the lowest file offset of any
/// executable allocated section.
pub fn compute_xct_off(shdrs: &[Shdr]) -> Result<u64> {
    shdrs
        .iter()
        .filter(|s| s.flags & SHF_EXECINSTR != 0 && s.flags & SHF_ALLOC != 0 && s.sh_type != SHT_NOBITS)
        .map(|s| s.offset)
        .min()
        .ok_or_else(|| Error::cant_pack("no executable section to locate code boundary"))
}

fn va_span(phdrs: &[Phdr]) -> (u64, u64) {
    let mut base = u64::MAX;
    let mut brk = 0u64;
    for p in phdrs.iter().filter(|p| p.is_load()) {
        base = base.min(p.vaddr);
        brk = brk.max(p.vaddr.saturating_add(p.memsz));
    }
    if base == u64::MAX {
        base = 0;
    }
    (base, brk)
}

/// Build the extent plan. `xct_override` carries a known boundary when the
/// plan is being re-derived during unpacking (section headers may be gone).
pub fn build_plan(
    hdr: &FileHeader,
    phdrs: &[Phdr],
    shdrs: &[Shdr],
    classification: Classification,
    file_size: u64,
    xct_override: Option<u64>,
) -> Result<PackPlan> {
    let (base_va, brk_va) = va_span(phdrs);
    let mut plan = match classification {
        Classification::Exec | Classification::PieExec => {
            plan_exec(hdr, phdrs, classification, file_size, base_va, brk_va)?
        }
        Classification::SharedLib => {
            let xct = match xct_override {
                Some(x) => x,
                None => compute_xct_off(shdrs)?,
            };
            plan_shlib(phdrs, xct, file_size, base_va, brk_va)?
        }
    };
    check_coverage(&plan.extents, file_size)?;
    plan.filter_extent = pick_filter_extent(&plan, phdrs);
    Ok(plan)
}

fn plan_exec(
    hdr: &FileHeader,
    phdrs: &[Phdr],
    classification: Classification,
    file_size: u64,
    base_va: u64,
    brk_va: u64,
) -> Result<PackPlan> {
    let hdr_end = hdr.phoff + (hdr.phnum as u64) * (hdr.phentsize as u64);
    if hdr_end > file_size {
        return Err(Error::OutOfBounds);
    }
    let mut extents = vec![Extent { off: 0, len: hdr_end, kind: ExtentKind::HeaderLiteral }];
    let mut pos = hdr_end;

    let mut cursor = match first_load(phdrs) {
        Some(i) => Some(i),
        None => return Err(Error::cant_pack("no PT_LOAD segment")),
    };
    while let Some(i) = cursor {
        let load = &phdrs[i];
        let end = load.file_end().min(file_size);
        if end > pos {
            if load.offset > pos {
                // Gap between loadable segments: its own compressible extent,
                // which recovers debug info and other non-loaded data.
                extents.push(Extent { off: pos, len: load.offset - pos, kind: ExtentKind::Compress });
                pos = load.offset;
            }
            extents.push(Extent { off: pos, len: end - pos, kind: ExtentKind::Compress });
            pos = end;
        }
        cursor = next_load_after(phdrs, load.offset);
    }
    if pos < file_size {
        extents.push(Extent { off: pos, len: file_size - pos, kind: ExtentKind::Compress });
    }
    Ok(PackPlan {
        classification,
        extents,
        xct_off: 0,
        cover_load: None,
        filter_extent: None,
        base_va,
        brk_va,
        file_size,
    })
}

fn plan_shlib(
    phdrs: &[Phdr],
    xct_off: u64,
    file_size: u64,
    base_va: u64,
    brk_va: u64,
) -> Result<PackPlan> {
    if xct_off == 0 || xct_off >= file_size {
        return Err(Error::cant_pack("implausible code boundary"));
    }
    let cover = phdrs
        .iter()
        .position(|p| p.is_load() && p.offset < xct_off && p.file_end() > xct_off)
        .ok_or_else(|| Error::cant_pack("no PT_LOAD covers the code boundary"))?;
    if phdrs[cover].is_writable() {
        // The dynamic linker may mutate a writable segment before the stub
        // runs; there is nothing left to compress.
        return Err(Error::cant_pack("segment covering code is writable"));
    }
    for (i, p) in phdrs.iter().enumerate() {
        if !p.is_load() || p.filesz == 0 || i == cover {
            continue;
        }
        if p.is_writable() {
            if p.offset < xct_off {
                return Err(Error::cant_pack("writable segment below code boundary"));
            }
        } else if p.file_end() > xct_off {
            return Err(Error::cant_pack("unsupported layout: non-writable segment above code boundary"));
        }
    }

    let mut extents = vec![Extent { off: 0, len: xct_off, kind: ExtentKind::Prefix }];
    let cover_end = phdrs[cover].file_end().min(file_size);
    extents.push(Extent { off: xct_off, len: cover_end - xct_off, kind: ExtentKind::Compress });
    let mut pos = cover_end;

    let mut cursor = next_load_after(phdrs, phdrs[cover].offset);
    while let Some(i) = cursor {
        let load = &phdrs[i];
        let end = load.file_end().min(file_size);
        if end > pos {
            if load.offset > pos {
                extents.push(Extent { off: pos, len: load.offset - pos, kind: ExtentKind::Compress });
                pos = load.offset;
            }
            extents.push(Extent { off: pos, len: end - pos, kind: ExtentKind::InPlace });
            pos = end;
        }
        cursor = next_load_after(phdrs, load.offset);
    }
    if pos < file_size {
        extents.push(Extent { off: pos, len: file_size - pos, kind: ExtentKind::Compress });
    }
    Ok(PackPlan {
        classification: Classification::SharedLib,
        extents,
        xct_off,
        cover_load: Some(cover),
        filter_extent: None,
        base_va,
        brk_va,
        file_size,
    })
}

/// The extents must be pairwise non-overlapping and tile `[0, file_size)`.
fn check_coverage(extents: &[Extent], file_size: u64) -> Result<()> {
    let mut pos = 0u64;
    for ex in extents {
        if ex.off != pos || ex.len == 0 {
            return Err(Error::cant_pack("extent plan does not tile the file"));
        }
        pos = ex.end();
    }
    if pos != file_size {
        return Err(Error::cant_pack("extent plan does not tile the file"));
    }
    Ok(())
}

/// The single largest compressible extent intersecting an executable LOAD is
/// the filter candidate.
fn pick_filter_extent(plan: &PackPlan, phdrs: &[Phdr]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, ex) in plan.extents.iter().enumerate() {
        if ex.kind != ExtentKind::Compress {
            continue;
        }
        let in_exec = phdrs.iter().any(|p| {
            p.is_load()
                && p.flags & PF_X != 0
                && ex.off < p.file_end()
                && p.offset < ex.end()
        });
        if in_exec && best.map_or(true, |b| ex.len > plan.extents[b].len) {
            best = Some(i);
        }
    }
    best
}

/// Candidate filter ids for the plan on the given architecture.
pub fn candidate_filters(plan: &PackPlan, arch: &ArchInfo, abi: Abi) -> Vec<u8> {
    use crate::elf::model::ElfClass;
    use crate::endian::Endianness;
    if plan.filter_extent.is_none()
        || abi.class != ElfClass::Elf64
        || abi.endian != Endianness::Little
    {
        return vec![0];
    }
    arch.filters.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::model::ElfClass;
    use crate::endian::Endianness;

    const ABI: Abi = Abi { class: ElfClass::Elf64, endian: Endianness::Little };

    fn hdr(e_type: u16, phnum: u16) -> FileHeader {
        FileHeader {
            abi: ABI,
            osabi: 0,
            e_type,
            machine: EM_X86_64,
            entry: 0x40_1000,
            phoff: 64,
            shoff: 0,
            flags: 0,
            ehsize: 64,
            phentsize: 56,
            phnum,
            shentsize: 0,
            shnum: 0,
            shstrndx: 0,
        }
    }

    fn load(off: u64, sz: u64, va: u64, flags: u32) -> Phdr {
        Phdr {
            p_type: PT_LOAD,
            flags,
            offset: off,
            vaddr: va,
            paddr: va,
            filesz: sz,
            memsz: sz,
            align: 0x1000,
        }
    }

    #[test]
    fn exec_extents_tile_the_file_with_gap_recovery() {
        // Two loads with a hole between them and trailing non-loaded data;
        // deliberately listed out of file-offset order.
        let phdrs = vec![
            load(0x3000, 0x800, 0x40_3000, PF_R | PF_W),
            load(0, 0x2000, 0x40_0000, PF_R | PF_X),
        ];
        let plan =
            build_plan(&hdr(ET_EXEC, 2), &phdrs, &[], Classification::Exec, 0x4000, None).unwrap();
        let tiles: Vec<(u64, u64)> = plan.extents.iter().map(|e| (e.off, e.len)).collect();
        assert_eq!(
            tiles,
            vec![
                (0, 64 + 2 * 56),       // Ehdr + Phdr array, literal
                (176, 0x2000 - 176),    // rest of the text load
                (0x2000, 0x1000),       // gap between loads
                (0x3000, 0x800),        // data load
                (0x3800, 0x800),        // trailing debug-ish bytes
            ]
        );
        assert_eq!(plan.extents[0].kind, ExtentKind::HeaderLiteral);
        assert!(plan.extents[1..].iter().all(|e| e.kind == ExtentKind::Compress));
        // The filter candidate is the big extent inside the executable load.
        assert_eq!(plan.filter_extent, Some(1));
    }

    #[test]
    fn shlib_extents_split_at_code_boundary_and_writable_segments() {
        let phdrs = vec![
            load(0, 0x3000, 0, PF_R | PF_X),
            load(0x3000, 0x500, 0x4000, PF_R | PF_W),
        ];
        let plan = build_plan(
            &hdr(ET_DYN, 2),
            &phdrs,
            &[],
            Classification::SharedLib,
            0x4000,
            Some(0x1000),
        )
        .unwrap();
        let kinds: Vec<ExtentKind> = plan.extents.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ExtentKind::Prefix,
                ExtentKind::Compress,
                ExtentKind::InPlace,
                ExtentKind::Compress,
            ]
        );
        assert_eq!(plan.extents[0].len, 0x1000);
        assert_eq!(plan.extents[2].off, 0x3000);
        assert_eq!(plan.cover_load, Some(0));
    }

    #[test]
    fn writable_text_segment_is_rejected() {
        let phdrs = vec![load(0, 0x2000, 0, PF_R | PF_W | PF_X)];
        let err = build_plan(
            &hdr(ET_DYN, 1),
            &phdrs,
            &[],
            Classification::SharedLib,
            0x2000,
            Some(0x800),
        )
        .unwrap_err();
        assert!(matches!(err, Error::CantPack(_)));
    }

    #[test]
    fn circular_next_load_search_ignores_order() {
        let phdrs = vec![
            load(0x5000, 0x100, 0x5000, PF_R),
            load(0x1000, 0x100, 0x1000, PF_R),
            load(0x3000, 0x100, 0x3000, PF_R),
        ];
        assert_eq!(next_load_after(&phdrs, 0), Some(1));
        assert_eq!(next_load_after(&phdrs, 0x1000), Some(2));
        assert_eq!(next_load_after(&phdrs, 0x3000), Some(0));
        assert_eq!(next_load_after(&phdrs, 0x5000), None);
    }
}
