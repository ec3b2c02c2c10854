//! Output layout synthesis and slide bookkeeping.
//!
//! Executables get a fresh Ehdr/Phdr set: `C_BASE` reserves the whole
//! original address range before anything else maps, `C_TEXT` maps the
//! packed file, and PT_NOTE/PT_GNU_STACK ride along verbatim.
//!
//! Shared libraries keep their first `xct_off` bytes literal, so every
//! address-bearing structure the dynamic linker reads must stay consistent
//! after later segments slide down (`so_slide`, file offsets) and, in
//! aux-page mode, after everything above the splice shifts (`asl_delta`,
//! addresses). All of those rewrites are expressed as an enumerated list of
//! patch sites with a direction-independent value transform; the packer and
//! the unpacker run the same enumeration, which is what makes the transform
//! exactly reversible.

use crate::arch::{reloc_targets_address, ArchInfo};
use crate::elf::consts::*;
use crate::elf::dynamic::{vaddr_to_off, DynIndex};
use crate::elf::model::{
    read_dyn, read_reloc, read_shdr, read_sym, sym_value_field, write_file_header, write_phdr,
    Abi, ElfClass, FileHeader, Phdr,
};
use crate::error::{Error, Result};
use crate::plan::{ExtentKind, PackPlan};

// ---------------- slide context ----------------

#[derive(Debug, Clone, Copy)]
pub struct SlideCtx {
    /// File-offset delta applied to everything at or above `slide_boundary`.
    pub so_slide: i64,
    /// Address delta applied to everything at or above `xct_va` (aux-page
    /// mode only; zero otherwise).
    pub asl_delta: u64,
    pub xct_va: u64,
    /// Original file offset from which content slides: the end of the LOAD
    /// covering the code boundary.
    pub slide_boundary: u64,
}

impl SlideCtx {
    pub fn new(plan: &PackPlan, phdrs: &[Phdr], so_slide: i64, asl_delta: u64) -> Result<SlideCtx> {
        let cover = &phdrs[plan
            .cover_load
            .ok_or_else(|| Error::cant_pack("slide context without covering segment"))?];
        Ok(SlideCtx {
            so_slide,
            asl_delta,
            xct_va: cover.vaddr + (plan.xct_off - cover.offset),
            slide_boundary: cover.file_end(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteKind {
    /// A file-offset field (Phdr p_offset).
    FileOffset,
    /// An address-bearing field or word.
    Address,
    /// A Rela addend; address-like values shift, small offsets stay.
    Addend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchSite {
    /// Offset of the field in the original file image.
    pub off: u64,
    pub kind: SiteKind,
}

pub fn forward_value(kind: SiteKind, v: u64, ctx: &SlideCtx) -> u64 {
    match kind {
        SiteKind::FileOffset => {
            if v >= ctx.slide_boundary {
                (v as i64).wrapping_add(ctx.so_slide) as u64
            } else {
                v
            }
        }
        SiteKind::Address => {
            if v >= ctx.xct_va {
                v.wrapping_add(ctx.asl_delta)
            } else {
                v
            }
        }
        SiteKind::Addend => {
            let s = v as i64;
            if s >= ctx.xct_va as i64 {
                s.wrapping_add(ctx.asl_delta as i64) as u64
            } else {
                v
            }
        }
    }
}

pub fn undo_value(kind: SiteKind, v: u64, ctx: &SlideCtx) -> u64 {
    match kind {
        SiteKind::FileOffset => {
            let moved = (ctx.slide_boundary as i64).wrapping_add(ctx.so_slide) as u64;
            if v >= moved {
                (v as i64).wrapping_sub(ctx.so_slide) as u64
            } else {
                v
            }
        }
        SiteKind::Address => {
            if v >= ctx.xct_va.wrapping_add(ctx.asl_delta) {
                v.wrapping_sub(ctx.asl_delta)
            } else {
                v
            }
        }
        SiteKind::Addend => {
            let s = v as i64;
            if s >= (ctx.xct_va.wrapping_add(ctx.asl_delta)) as i64 {
                s.wrapping_sub(ctx.asl_delta as i64) as u64
            } else {
                v
            }
        }
    }
}

// ---------------- patch-site enumeration ----------------

/// Dynamic tags whose value is a virtual address.
const ADDRESS_TAGS: &[i64] = &[
    DT_PLTGOT,
    DT_HASH,
    DT_GNU_HASH,
    DT_STRTAB,
    DT_SYMTAB,
    DT_RELA,
    DT_REL,
    DT_JMPREL,
    DT_FINI,
    DT_INIT_ARRAY,
    DT_FINI_ARRAY,
    DT_PREINIT_ARRAY,
    DT_VERDEF,
    DT_VERNEED,
    DT_VERSYM,
];

/// Well-known absolute symbols that denote relative positions in disguise
/// and therefore do move with the image.
const ABS_ALLOW_LIST: [&[u8]; 3] = [b"_end", b"_edata", b"__bss_start"];

/// Enumerate every field of the original image that the slide must track.
/// The enumeration only reads original structures, so running it during
/// packing and during unpacking yields the identical site list.
pub fn enumerate_patch_sites(
    buf: &[u8],
    hdr: &FileHeader,
    phdrs: &[Phdr],
    di: &DynIndex,
    arch: &ArchInfo,
) -> Result<Vec<PatchSite>> {
    let abi = hdr.abi;
    let class = abi.class;
    let mut sites = Vec::new();

    // Program headers: p_offset slides, p_vaddr/p_paddr shift.
    let (off_field, vaddr_field, paddr_field) = match class {
        ElfClass::Elf32 => (4usize, 8usize, 12usize),
        ElfClass::Elf64 => (8usize, 16usize, 24usize),
    };
    for i in 0..hdr.phnum as usize {
        let rec = hdr.phoff + (i * class.phdr_size()) as u64;
        sites.push(PatchSite { off: rec + off_field as u64, kind: SiteKind::FileOffset });
        sites.push(PatchSite { off: rec + vaddr_field as u64, kind: SiteKind::Address });
        sites.push(PatchSite { off: rec + paddr_field as u64, kind: SiteKind::Address });
    }

    // Address-valued dynamic entries. DT_INIT is handled by the hijack.
    let entsize = class.dyn_size();
    for i in 0..di.entry_count {
        let rec = di.dyn_off as usize + i * entsize;
        let (tag, _) = read_dyn(abi, buf, rec)?;
        if ADDRESS_TAGS.contains(&tag) {
            sites.push(PatchSite {
                off: (rec + class.addr_size()) as u64,
                kind: SiteKind::Address,
            });
        }
    }

    // Relocations: the target offset always, the addend for Rela, and the
    // pointed-to word for Rel-format entries. Any type outside the tracked
    // set could leave a stored address unadjusted, so it refuses the file.
    for table in di.reloc_tables(abi, phdrs)? {
        let count = (table.size as usize) / table.entsize;
        for i in 0..count {
            let rec = table.off as usize + i * table.entsize;
            let r = read_reloc(abi, buf, rec, table.with_addend)?;
            if !reloc_targets_address(arch, r.r_type) {
                return Err(Error::cant_pack(format!(
                    "unrecognized relocation type {} for {}",
                    r.r_type, arch.name
                )));
            }
            sites.push(PatchSite { off: rec as u64, kind: SiteKind::Address });
            if table.with_addend {
                sites.push(PatchSite {
                    off: (rec + 2 * class.addr_size()) as u64,
                    kind: SiteKind::Addend,
                });
            } else if let Some(word) = vaddr_to_off(phdrs, r.offset) {
                sites.push(PatchSite { off: word, kind: SiteKind::Address });
            }
        }
    }

    // Symbol values, except undefined and (most) absolute symbols.
    if let Some(symtab) = di.symtab_off {
        for i in 0..di.sym_count {
            let rec = symtab as usize + i * class.sym_size();
            let sym = read_sym(abi, buf, rec)?;
            if sym.shndx == SHN_UNDEF {
                continue;
            }
            if sym.shndx == SHN_ABS {
                let name = di.sym_name(abi, buf, i)?;
                if !name.map_or(false, |n| ABS_ALLOW_LIST.contains(&n)) {
                    continue;
                }
            }
            sites.push(PatchSite {
                off: (rec + sym_value_field(class)) as u64,
                kind: SiteKind::Address,
            });
        }
    }

    sites.sort_by_key(|s| s.off);
    sites.dedup();
    Ok(sites)
}

// ---------------- dynamic-init hijack ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitSlot {
    /// Value field of the DT_INIT entry.
    DtInit { slot: u64 },
    /// First word of DT_INIT_ARRAY.
    InitArray { slot: u64 },
    /// A trailing unused DT_NULL entry, rewritten into a DT_INIT.
    SpareNull { tag_slot: u64, slot: u64 },
}

impl InitSlot {
    pub fn value_off(&self) -> u64 {
        match *self {
            InitSlot::DtInit { slot } => slot,
            InitSlot::InitArray { slot } => slot,
            InitSlot::SpareNull { slot, .. } => slot,
        }
    }
}

/// Pick the slot whose value will be redirected into the stub, and read the
/// original target so it can be preserved for the unpacker.
pub fn resolve_init_slot(
    buf: &[u8],
    abi: Abi,
    phdrs: &[Phdr],
    di: &DynIndex,
) -> Result<(InitSlot, u64)> {
    if let Some(slot) = di.value_slot(abi, buf, DT_INIT)? {
        let orig = abi.addr(buf, slot as usize)?;
        return Ok((InitSlot::DtInit { slot }, orig));
    }
    if let Some(&array_va) = di.dt.get(&DT_INIT_ARRAY) {
        let sz = di.dt.get(&DT_INIT_ARRAYSZ).copied().unwrap_or(0);
        if sz >= abi.class.addr_size() as u64 {
            let slot = vaddr_to_off(phdrs, array_va)
                .ok_or(Error::MalformedDynamic("DT_INIT_ARRAY outside any PT_LOAD"))?;
            let orig = abi.addr(buf, slot as usize)?;
            return Ok((InitSlot::InitArray { slot }, orig));
        }
    }
    if let Some(slot) = di.spare_null_slot(abi) {
        let tag_slot = slot - abi.class.addr_size() as u64;
        return Ok((InitSlot::SpareNull { tag_slot, slot }, 0));
    }
    Err(Error::cant_pack("no dynamic-init slot to hijack"))
}

// ---------------- literal image construction ----------------

/// Everything needed to rewrite the literal bytes of a packed shared
/// library: the patch sites, the init hijack, and the stash location.
pub struct ShlibModel {
    pub ctx: SlideCtx,
    pub sites: Vec<PatchSite>,
    pub init: InitSlot,
    pub orig_init: u64,
    /// dynsym[0].st_value; historically the stash for the original init.
    pub stash_off: u64,
    pub stub_init_va: u64,
    /// Grown p_filesz/p_memsz of the covering LOAD (maps the stub region).
    pub cover_grown: u64,
}

pub fn shlib_model(
    buf: &[u8],
    hdr: &FileHeader,
    phdrs: &[Phdr],
    di: &DynIndex,
    arch: &ArchInfo,
    plan: &PackPlan,
    ctx: SlideCtx,
    stream_end: u64,
    stub_init_va: u64,
) -> Result<ShlibModel> {
    let abi = hdr.abi;
    let cover = &phdrs[plan.cover_load.unwrap()];
    let symtab = di
        .symtab_off
        .ok_or_else(|| Error::cant_pack("shared library without DT_SYMTAB"))?;
    if di.sym_count == 0 {
        return Err(Error::cant_pack("empty dynamic symbol table"));
    }
    let stash_off = symtab + sym_value_field(abi.class) as u64;
    if abi.addr(buf, stash_off as usize)? != 0 {
        return Err(Error::cant_pack("dynamic symbol 0 has a nonzero value"));
    }
    let (init, orig_init) = resolve_init_slot(buf, abi, phdrs, di)?;
    let mut sites = enumerate_patch_sites(buf, hdr, phdrs, di, arch)?;
    // The hijacked word must not also be slid as a generic site.
    let hijack_off = init.value_off();
    sites.retain(|s| s.off != hijack_off);
    Ok(ShlibModel {
        ctx,
        sites,
        init,
        orig_init,
        stash_off,
        stub_init_va,
        cover_grown: stream_end - cover.offset,
    })
}

/// Map an original file offset to its location in the packed file, or None
/// when the byte only exists inside the compressed stream.
pub fn packed_offset(plan: &PackPlan, ctx: &SlideCtx, off: u64) -> Option<u64> {
    if off < plan.xct_off {
        return Some(off);
    }
    for ex in &plan.extents {
        if ex.kind == ExtentKind::InPlace && off >= ex.off && off < ex.end() {
            return Some((off as i64 + ctx.so_slide) as u64);
        }
    }
    None
}

/// Produce the literal parts of a packed shared library from the original
/// image: the patched prefix and each in-place segment at its slid offset.
/// Both the packer (to emit) and the unpacker (to verify) run this; a single
/// code path keeps the two directions exactly symmetric.
pub fn build_literal_image(
    orig: &[u8],
    hdr: &FileHeader,
    plan: &PackPlan,
    model: &ShlibModel,
    aux_shnum: Option<u16>,
) -> Result<(Vec<u8>, Vec<(u64, Vec<u8>)>)> {
    let abi = hdr.abi;
    let xct = plan.xct_off as usize;
    let mut prefix = orig[..xct].to_vec();

    // Ehdr: section headers are gone, unless the aux page carries a copy.
    let mut out_hdr = hdr.clone();
    match aux_shnum {
        Some(n) => {
            out_hdr.shoff = plan.xct_off + hdr.ehsize as u64;
            out_hdr.shnum = n;
            if out_hdr.shstrndx >= n {
                out_hdr.shstrndx = 0;
            }
        }
        None => {
            out_hdr.shoff = 0;
            out_hdr.shnum = 0;
            out_hdr.shstrndx = 0;
        }
    }
    write_file_header(&mut prefix, &out_hdr)?;

    // Covering LOAD grows to map the stream and stub.
    let cover_idx = plan.cover_load.unwrap();
    let (filesz_field, memsz_field) = match abi.class {
        ElfClass::Elf32 => (16usize, 20usize),
        ElfClass::Elf64 => (32usize, 40usize),
    };
    let cover_rec = (hdr.phoff as usize) + cover_idx * abi.class.phdr_size();
    abi.set_addr(&mut prefix, cover_rec + filesz_field, model.cover_grown)?;
    abi.set_addr(
        &mut prefix,
        cover_rec + memsz_field,
        model.cover_grown + model.ctx.asl_delta,
    )?;

    // Stash the original init target in dynsym[0].st_value.
    abi.set_addr(&mut prefix, model.stash_off as usize, model.orig_init)?;

    // In-place segments, copied to their slid offsets.
    let mut inplace: Vec<(u64, Vec<u8>)> = plan
        .extents
        .iter()
        .filter(|e| e.kind == ExtentKind::InPlace)
        .map(|e| {
            (
                (e.off as i64 + model.ctx.so_slide) as u64,
                orig[e.off as usize..e.end() as usize].to_vec(),
            )
        })
        .collect();

    // One writer over both regions, addressed by original offset.
    let mut write_at = |orig_off: u64, f: &mut dyn FnMut(&mut [u8], usize) -> Result<()>| -> Result<bool> {
        if (orig_off as usize) < xct {
            f(&mut prefix, orig_off as usize)?;
            return Ok(true);
        }
        for ex in plan.extents.iter().filter(|e| e.kind == ExtentKind::InPlace) {
            if orig_off >= ex.off && orig_off < ex.end() {
                let packed = (ex.off as i64 + model.ctx.so_slide) as u64;
                let seg = inplace
                    .iter_mut()
                    .find(|(p, _)| *p == packed)
                    .expect("in-place segment exists");
                f(&mut seg.1, (orig_off - ex.off) as usize)?;
                return Ok(true);
            }
        }
        Ok(false)
    };

    // Generic slide/shift sites.
    for site in &model.sites {
        let kind = site.kind;
        let ctx = model.ctx;
        let mut patch = |buf: &mut [u8], at: usize| -> Result<()> {
            let v = abi.addr(buf, at)?;
            abi.set_addr(buf, at, forward_value(kind, v, &ctx))
        };
        write_at(site.off, &mut patch)?;
    }

    // Dynamic-init hijack.
    let stub_va = model.stub_init_va;
    let mut set_val = |buf: &mut [u8], at: usize| abi.set_addr(buf, at, stub_va);
    if !write_at(model.init.value_off(), &mut set_val)? {
        return Err(Error::cant_pack("init slot lives in a compressed region"));
    }
    if let InitSlot::SpareNull { tag_slot, .. } = model.init {
        let mut set_tag = |buf: &mut [u8], at: usize| match abi.class {
            ElfClass::Elf32 => abi.endian.set32(buf, at, DT_INIT as u32),
            ElfClass::Elf64 => abi.endian.set64(buf, at, DT_INIT as u64),
        };
        if !write_at(tag_slot, &mut set_tag)? {
            return Err(Error::cant_pack("init slot lives in a compressed region"));
        }
    }

    Ok((prefix, inplace))
}

// ---------------- aux header page ----------------

/// Auxiliary page spliced at the code boundary in aux-page mode: a copy of
/// the original Ehdr plus as many section headers as fit, with their
/// addresses and offsets tracking the slide. Some platforms insist on
/// section headers even in stripped libraries; this keeps a readable copy.
pub fn build_aux_page(
    orig: &[u8],
    hdr: &FileHeader,
    ctx: &SlideCtx,
    page_size: u64,
) -> Result<(Vec<u8>, u16)> {
    let abi = hdr.abi;
    let class = abi.class;
    let mut page = vec![0u8; page_size as usize];
    let mut copy_hdr = hdr.clone();
    let room = (page_size as usize - class.ehdr_size()) / class.shdr_size();
    let shnum = (hdr.shnum as usize).min(room);

    copy_hdr.shoff = class.ehdr_size() as u64; // relative to the page copy
    copy_hdr.shnum = shnum as u16;
    if copy_hdr.shstrndx as usize >= shnum {
        copy_hdr.shstrndx = 0;
    }
    write_file_header(&mut page, &copy_hdr)?;

    for i in 0..shnum {
        let src = hdr.shoff as usize + i * class.shdr_size();
        let dst = class.ehdr_size() + i * class.shdr_size();
        let sh = read_shdr(abi, orig, src)?;
        let end = src + class.shdr_size();
        page[dst..dst + class.shdr_size()].copy_from_slice(&orig[src..end]);
        // Track the shift for address/offset fields.
        let (addr_f, off_f) = match class {
            ElfClass::Elf32 => (12usize, 16usize),
            ElfClass::Elf64 => (16usize, 24usize),
        };
        abi.set_addr(&mut page, dst + addr_f, forward_value(SiteKind::Address, sh.addr, ctx))?;
        abi.set_addr(
            &mut page,
            dst + off_f,
            forward_value(SiteKind::FileOffset, sh.offset, ctx),
        )?;
    }
    Ok((page, shnum as u16))
}

// ---------------- executable header synthesis ----------------

pub struct ExecHeaders {
    pub bytes: Vec<u8>,
    pub phnum: u16,
}

/// How many output program headers an executable layout needs, and which
/// input headers ride along.
pub fn exec_carried<'a>(phdrs: &'a [Phdr]) -> (Option<&'a Phdr>, Option<&'a Phdr>) {
    let note = phdrs.iter().find(|p| p.p_type == PT_NOTE);
    let gstk = phdrs.iter().find(|p| p.p_type == PT_GNU_STACK);
    (note, gstk)
}

/// Synthesize the Ehdr and Phdr array of a packed executable. `C_BASE`
/// comes first so the loader reserves the full original address range
/// before any other segment maps.
pub fn emit_exec_headers(
    hdr: &FileHeader,
    plan: &PackPlan,
    arch: &ArchInfo,
    note: Option<&Phdr>,
    gstk: Option<&Phdr>,
    total_size: u64,
    entry_va: u64,
) -> Result<ExecHeaders> {
    let abi = hdr.abi;
    let class = abi.class;
    let phnum = 2 + note.is_some() as u16 + gstk.is_some() as u16;
    let len = class.ehdr_size() + phnum as usize * class.phdr_size();
    let mut bytes = vec![0u8; len];

    let mut out_hdr = hdr.clone();
    out_hdr.entry = entry_va;
    out_hdr.phoff = class.ehdr_size() as u64;
    out_hdr.phnum = phnum;
    out_hdr.phentsize = class.phdr_size() as u16;
    out_hdr.shoff = 0;
    out_hdr.shnum = 0;
    out_hdr.shstrndx = 0;
    write_file_header(&mut bytes, &out_hdr)?;

    let page = arch.page_size;
    let base = plan.base_va;
    let span = plan.brk_va.saturating_sub(base).max(page);
    let c_base = Phdr {
        p_type: PT_LOAD,
        flags: PF_R | PF_W,
        offset: 0,
        vaddr: base,
        paddr: base,
        // Zero p_filesz trips a SIGSEGV on some kernels; force one page.
        filesz: page.min(total_size),
        memsz: span,
        align: page,
    };
    let c_text = Phdr {
        p_type: PT_LOAD,
        flags: PF_R | PF_X,
        offset: 0,
        vaddr: base,
        paddr: base,
        filesz: total_size,
        memsz: total_size,
        align: page,
    };
    let mut at = class.ehdr_size();
    for p in [Some(&c_base), Some(&c_text), note, gstk].into_iter().flatten() {
        write_phdr(abi, &mut bytes, at, p)?;
        at += class.phdr_size();
    }
    Ok(ExecHeaders { bytes, phnum })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SlideCtx {
        SlideCtx { so_slide: -0x2000, asl_delta: 0x1000, xct_va: 0x1000, slide_boundary: 0x3000 }
    }

    #[test]
    fn forward_then_undo_is_identity() {
        let c = ctx();
        for kind in [SiteKind::FileOffset, SiteKind::Address, SiteKind::Addend] {
            for v in [0u64, 0xfff, 0x1000, 0x2fff, 0x3000, 0x9000, u32::MAX as u64] {
                let f = forward_value(kind, v, &c);
                assert_eq!(undo_value(kind, f, &c), v, "{:?} {:#x}", kind, v);
            }
        }
    }

    #[test]
    fn values_below_the_boundary_never_move() {
        let c = ctx();
        assert_eq!(forward_value(SiteKind::Address, 0xfff, &c), 0xfff);
        assert_eq!(forward_value(SiteKind::Address, 0x1000, &c), 0x2000);
        assert_eq!(forward_value(SiteKind::FileOffset, 0x2fff, &c), 0x2fff);
        assert_eq!(forward_value(SiteKind::FileOffset, 0x3000, &c), 0x1000);
    }

    #[test]
    fn negative_addends_stay_put() {
        let c = ctx();
        let v = (-8i64) as u64;
        assert_eq!(forward_value(SiteKind::Addend, v, &c), v);
        // But an Address-kind word would wrap; Addend treats it as signed.
        assert_eq!(forward_value(SiteKind::Addend, 0x1000, &c), 0x2000);
    }
}
