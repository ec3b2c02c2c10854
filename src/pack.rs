//! The packer pipeline.
//!
//! Packing runs as a fixed sequence of stages, each consuming the
//! immutable outputs of the previous one. Nothing is written until every
//! decision is made, so a failure at any stage leaves no partial output.

use crate::arch::{self, ArchInfo};
use crate::compress;
use crate::elf::dynamic::DynIndex;
use crate::elf::model::{
    parse_file_header, read_phdrs, read_shdrs, FileHeader, Phdr, Shdr,
};
use crate::error::{Error, Result};
use crate::layout;
use crate::plan::{self, Classification, ExtentKind, PackPlan};
use crate::select::{self, BlockSpec, Selection};
use crate::stub;
use crate::trailer::{
    adler32, Adler32, BInfo, LInfo, PInfo, PackHeader, FMT_EXEC, FMT_SHLIB,
    L_INFO_SIZE, PACK_HEADER_SIZE, P_INFO_SIZE, VERSION,
};

/// Blocks larger than this are split; each piece gets its own record and its
/// own literal fallback.
pub const DEFAULT_BLOCK_SIZE: u32 = 0x0008_0000;

#[derive(Debug, Clone)]
pub struct PackOptions {
    pub methods: Vec<u8>,
    pub allow_filter: bool,
    /// Shared libraries only: splice an auxiliary header page at the code
    /// boundary and shift everything above it by one page.
    pub aux_page: bool,
    pub block_size: u32,
}

impl Default for PackOptions {
    fn default() -> Self {
        PackOptions {
            methods: compress::DEFAULT_METHODS.to_vec(),
            allow_filter: true,
            aux_page: false,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

// ---------------- analysis stages ----------------

struct Analysis {
    hdr: FileHeader,
    phdrs: Vec<Phdr>,
    arch: &'static ArchInfo,
    di: Option<DynIndex>,
    classification: Classification,
    plan: PackPlan,
}

fn analyze(input: &[u8]) -> Result<Analysis> {
    // Validate: idempotent rejection first, then the format checks.
    if PackHeader::present(input) {
        return Err(Error::AlreadyPacked);
    }
    if input.len() > u32::MAX as usize {
        return Err(Error::cant_pack("file exceeds the 32-bit size records"));
    }
    let hdr = parse_file_header(input)?;
    // The header extent and the stub entry math both assume the program
    // header table sits directly after the Ehdr.
    if hdr.phnum == 0 || hdr.phoff != hdr.abi.class.ehdr_size() as u64 {
        return Err(Error::cant_pack("program headers do not follow the file header"));
    }
    let arch = arch::lookup(hdr.machine, hdr.abi.class)?;
    let phdrs = read_phdrs(input, &hdr)?;
    let shdrs: Vec<Shdr> = read_shdrs(input, &hdr)?;

    // Index.
    let di = DynIndex::build(input, &hdr, &phdrs)?;

    // Plan.
    let classification = plan::classify(input, &hdr, &phdrs, di.as_ref())?;
    let pplan = plan::build_plan(
        &hdr,
        &phdrs,
        &shdrs,
        classification,
        input.len() as u64,
        None,
    )?;

    if classification == Classification::SharedLib {
        let cover = &phdrs[pplan.cover_load.unwrap()];
        if cover.filesz != cover.memsz {
            return Err(Error::cant_pack("code segment has trailing bss"));
        }
        let pht_end = hdr.phoff + (hdr.phnum as u64) * (hdr.phentsize as u64);
        if pht_end > pplan.xct_off {
            return Err(Error::cant_pack("program headers extend past the code boundary"));
        }
    }
    Ok(Analysis { hdr, phdrs, arch, di, classification, plan: pplan })
}

/// Cheap feasibility probe: everything up to and including planning and the
/// shared-library preconditions, with no output.
pub fn can_pack(input: &[u8]) -> Result<Classification> {
    let a = analyze(input)?;
    if a.classification == Classification::SharedLib {
        let di = a.di.as_ref().unwrap();
        // Exercises both the hijack-slot fallback chain and the stash rule.
        layout::resolve_init_slot(input, a.hdr.abi, &a.phdrs, di)?;
        let stash = di.symtab_off.ok_or_else(|| Error::cant_pack("no DT_SYMTAB"))?
            + crate::elf::model::sym_value_field(a.hdr.abi.class) as u64;
        if a.hdr.abi.addr(input, stash as usize)? != 0 {
            return Err(Error::cant_pack("dynamic symbol 0 has a nonzero value"));
        }
    }
    Ok(a.classification)
}

fn off_to_vaddr(phdrs: &[Phdr], off: u64) -> u64 {
    phdrs
        .iter()
        .filter(|p| p.is_load())
        .find(|p| off >= p.offset && off < p.file_end())
        .map(|p| p.vaddr + (off - p.offset))
        .unwrap_or(0)
}

/// Blocks in extent order. The first in-stream extent (header literal or
/// prefix) always travels as a single block so the unpacker can bootstrap
/// the original structures from block zero alone.
fn build_blocks(
    input: &[u8],
    phdrs: &[Phdr],
    pplan: &PackPlan,
    block_size: u32,
    allow_filter: bool,
) -> Vec<(BlockSpec, bool)> {
    let mut out = Vec::new();
    for (i, ex) in pplan.extents.iter().enumerate() {
        if !ex.in_stream() {
            continue;
        }
        let force_store = ex.kind == ExtentKind::HeaderLiteral;
        let whole = matches!(ex.kind, ExtentKind::HeaderLiteral | ExtentKind::Prefix);
        let filterable = allow_filter && pplan.filter_extent == Some(i);
        let mut pos = ex.off;
        while pos < ex.end() {
            let len = if whole {
                ex.end() - pos
            } else {
                (ex.end() - pos).min(block_size as u64)
            };
            out.push((
                BlockSpec {
                    data: input[pos as usize..(pos + len) as usize].to_vec(),
                    filterable,
                    extent_va: off_to_vaddr(phdrs, pos),
                    image_base: pplan.base_va,
                },
                force_store,
            ));
            pos += len;
        }
    }
    out
}

struct EncodedStream {
    /// b_info records and payloads, concatenated, terminator included.
    bytes: Vec<u8>,
    c_adler: u32,
    selection: Selection,
}

fn encode_stream(
    blocks: &[(BlockSpec, bool)],
    sel: Selection,
    e: crate::endian::Endianness,
) -> Result<EncodedStream> {
    let mut bytes = Vec::new();
    let mut c_adler = Adler32::new();
    for (block, force_store) in blocks {
        let block_sel = if *force_store {
            Selection { method: compress::M_STORE, filter: 0, filter_param: 0 }
        } else {
            sel
        };
        let (info, payload) = select::encode_block(block, block_sel)?;
        debug_assert!(info.is_plausible());
        bytes.extend_from_slice(&info.encode(e));
        c_adler.update(&payload);
        bytes.extend_from_slice(&payload);
    }
    bytes.extend_from_slice(&BInfo::terminator());
    Ok(EncodedStream { bytes, c_adler: c_adler.finish(), selection: sel })
}

// ---------------- emission ----------------

pub fn pack(input: &[u8], opts: &PackOptions) -> Result<Vec<u8>> {
    let a = analyze(input)?;

    // Select: trial-compress every candidate combination.
    let filters = if opts.allow_filter {
        plan::candidate_filters(&a.plan, a.arch, a.hdr.abi)
    } else {
        vec![0]
    };
    let blocks = build_blocks(input, &a.phdrs, &a.plan, opts.block_size, opts.allow_filter);
    let trial: Vec<BlockSpec> = blocks
        .iter()
        .map(|(b, _)| BlockSpec {
            data: b.data.clone(),
            filterable: b.filterable,
            extent_va: b.extent_va,
            image_base: b.image_base,
        })
        .collect();
    let sel = select::choose(&trial, &opts.methods, &filters)?;

    let e = a.hdr.abi.endian;
    let stream = encode_stream(&blocks, sel, e)?;
    let u_adler = adler32(input);

    match a.classification {
        Classification::Exec | Classification::PieExec => {
            emit_exec(input, &a, &stream, u_adler, opts)
        }
        Classification::SharedLib => emit_shlib(input, &a, &stream, u_adler, opts),
    }
}

fn pack_header(
    stream: &EncodedStream,
    u_adler: u32,
    format: u8,
    input_len: usize,
    xct_off: u32,
    so_slide: i64,
    asl_pages: u8,
) -> Result<PackHeader> {
    if so_slide > i32::MAX as i64 || so_slide < i32::MIN as i64 {
        return Err(Error::cant_pack("slide exceeds the 32-bit trailer field"));
    }
    Ok(PackHeader {
        version: VERSION,
        format,
        method: stream.selection.method,
        filter: stream.selection.filter,
        filter_param: stream.selection.filter_param,
        u_adler,
        c_adler: stream.c_adler,
        u_file_size: input_len as u32,
        xct_off,
        so_slide: so_slide as i32,
        asl_pages,
    })
}

fn emit_exec(
    input: &[u8],
    a: &Analysis,
    stream: &EncodedStream,
    u_adler: u32,
    opts: &PackOptions,
) -> Result<Vec<u8>> {
    let e = a.hdr.abi.endian;
    let (note, gstk) = layout::exec_carried(&a.phdrs);
    let phnum = 2 + note.is_some() as usize + gstk.is_some() as usize;
    let header_len = a.hdr.abi.class.ehdr_size() + phnum * a.hdr.abi.class.phdr_size();

    let mut stub = stub::get_stub(
        a.arch.stub_name,
        FMT_EXEC,
        compress::family(stream.selection.method),
    )?;
    let meta_len = L_INFO_SIZE + P_INFO_SIZE;
    let stub_off = header_len + meta_len + stream.bytes.len();
    let total = (stub_off + stub.len() + PACK_HEADER_SIZE) as u64;
    let entry_va = a.plan.base_va + stub_off as u64;

    stub::patch_stub(
        &mut stub,
        e,
        a.hdr.entry,
        a.arch.page_size as u32,
        stream.selection.method,
        stream.selection.filter,
        FMT_EXEC,
    )?;

    let headers = layout::emit_exec_headers(&a.hdr, &a.plan, a.arch, note, gstk, total, entry_va)?;
    let l_info = LInfo {
        checksum: adler32(&stub),
        loader_size: stub.len() as u16,
        version: VERSION,
        format: FMT_EXEC,
    };
    let p_info = PInfo {
        program_id: a.hdr.machine as u32,
        orig_file_size: input.len() as u32,
        block_size: opts.block_size,
    };

    let mut out = Vec::with_capacity(total as usize);
    out.extend_from_slice(&headers.bytes);
    out.extend_from_slice(&l_info.encode(e));
    out.extend_from_slice(&p_info.encode(e));
    out.extend_from_slice(&stream.bytes);
    out.extend_from_slice(&stub);
    let ph = pack_header(stream, u_adler, FMT_EXEC, input.len(), 0, 0, 0)?;
    out.extend_from_slice(&ph.encode(e));
    debug_assert_eq!(out.len() as u64, total);
    Ok(out)
}

fn emit_shlib(
    input: &[u8],
    a: &Analysis,
    stream: &EncodedStream,
    u_adler: u32,
    opts: &PackOptions,
) -> Result<Vec<u8>> {
    let e = a.hdr.abi.endian;
    let di = a.di.as_ref().expect("shared library has a dynamic index");
    let cover = &a.phdrs[a.plan.cover_load.unwrap()];
    let page = a.arch.page_size;
    let asl_delta = if opts.aux_page { page } else { 0 };

    let mut stub = stub::get_stub(
        a.arch.stub_name,
        FMT_SHLIB,
        compress::family(stream.selection.method),
    )?;
    let meta_len = (L_INFO_SIZE + P_INFO_SIZE) as u64;
    let stream_start = a.plan.xct_off + asl_delta;
    let stub_off = stream_start + meta_len + stream.bytes.len() as u64;
    let stream_end = stub_off + stub.len() as u64;

    // File-offset slide for the writable segments: the smallest alignment-
    // preserving multiple that clears the stream.
    let slide_unit = a
        .phdrs
        .iter()
        .filter(|p| p.is_load() && p.filesz != 0 && p.offset >= cover.file_end())
        .map(|p| p.align)
        .max()
        .unwrap_or(page)
        .max(page);
    let first_inplace = a
        .plan
        .extents
        .iter()
        .find(|x| x.kind == ExtentKind::InPlace)
        .map(|x| x.off);
    let so_slide = match first_inplace {
        Some(off) => {
            let need = stream_end as i64 - off as i64;
            let unit = slide_unit as i64;
            need.div_euclid(unit) * unit + if need.rem_euclid(unit) > 0 { unit } else { 0 }
        }
        None => 0,
    };

    let ctx = layout::SlideCtx::new(&a.plan, &a.phdrs, so_slide, asl_delta)?;
    let stub_init_va = cover.vaddr + (stub_off - cover.offset);
    let model = layout::shlib_model(
        input, &a.hdr, &a.phdrs, di, a.arch, &a.plan, ctx, stream_end, stub_init_va,
    )?;

    let aux = if opts.aux_page {
        Some(layout::build_aux_page(input, &a.hdr, &ctx, page)?)
    } else {
        None
    };
    let aux_shnum = aux.as_ref().map(|(_, n)| *n);
    let (prefix, inplace) = layout::build_literal_image(input, &a.hdr, &a.plan, &model, aux_shnum)?;

    stub::patch_stub(
        &mut stub,
        e,
        model.orig_init,
        page as u32,
        stream.selection.method,
        stream.selection.filter,
        FMT_SHLIB,
    )?;

    let l_info = LInfo {
        checksum: adler32(&stub),
        loader_size: stub.len() as u16,
        version: VERSION,
        format: FMT_SHLIB,
    };
    let p_info = PInfo {
        program_id: a.hdr.machine as u32,
        orig_file_size: input.len() as u32,
        block_size: opts.block_size,
    };

    let data_end = inplace
        .iter()
        .map(|(off, bytes)| off + bytes.len() as u64)
        .max()
        .unwrap_or(stream_end)
        .max(stream_end);
    let mut out = vec![0u8; data_end as usize];
    out[..prefix.len()].copy_from_slice(&prefix);
    if let Some((page_bytes, _)) = &aux {
        out[a.plan.xct_off as usize..(a.plan.xct_off + asl_delta) as usize]
            .copy_from_slice(page_bytes);
    }
    let mut at = stream_start as usize;
    out[at..at + L_INFO_SIZE].copy_from_slice(&l_info.encode(e));
    at += L_INFO_SIZE;
    out[at..at + P_INFO_SIZE].copy_from_slice(&p_info.encode(e));
    at += P_INFO_SIZE;
    out[at..at + stream.bytes.len()].copy_from_slice(&stream.bytes);
    out[stub_off as usize..stream_end as usize].copy_from_slice(&stub);
    for (off, bytes) in &inplace {
        out[*off as usize..*off as usize + bytes.len()].copy_from_slice(bytes);
    }

    let ph = pack_header(
        stream,
        u_adler,
        FMT_SHLIB,
        input.len(),
        a.plan.xct_off as u32,
        so_slide,
        if opts.aux_page { 1 } else { 0 },
    )?;
    out.extend_from_slice(&ph.encode(e));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_carry_the_standard_candidates() {
        let o = PackOptions::default();
        assert_eq!(o.methods, vec![compress::M_LZMA, compress::M_XZ]);
        assert!(o.allow_filter);
        assert!(!o.aux_page);
    }

    #[test]
    fn packing_garbage_is_an_invalid_format_error() {
        assert!(matches!(
            pack(&[0u8; 128], &PackOptions::default()),
            Err(Error::InvalidFormat(_))
        ));
    }
}
