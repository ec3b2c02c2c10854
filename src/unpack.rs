//! The unpacker pipeline.
//!
//! Decompression trusts nothing: the trailer checksum gates the version, the
//! compressed-stream checksum is verified before any block is expanded, every
//! block record must satisfy the literal-or-shrunk invariant, and the
//! reconstructed file must hash to the recorded value before it is returned.
//!
//! Block zero always holds the original file's leading bytes (header literal
//! or prefix), so the original program headers can be parsed from it and the
//! extent plan re-derived without any side table.

use crate::arch;
use crate::compress;
use crate::elf::consts::DT_NULL;
use crate::elf::dynamic::DynIndex;
use crate::elf::model::{parse_file_header, read_phdrs, ElfClass, FileHeader, Phdr};
use crate::endian::Endianness;
use crate::error::{Error, Result};
use crate::filter;
use crate::layout::{self, InitSlot, SlideCtx};
use crate::plan::{self, Classification, ExtentKind, PackPlan};
use crate::trailer::{
    adler32, Adler32, BInfo, LInfo, PInfo, PackHeader, FMT_EXEC, FMT_SHLIB, B_INFO_SIZE,
    L_INFO_SIZE, P_INFO_SIZE, VERSION,
};

/// Whether the block stream parsed at face value or needed the bounded
/// forward scan to resynchronize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpackOutcome {
    Clean,
    Recovered,
}

pub struct Unpacked {
    pub data: Vec<u8>,
    pub outcome: UnpackOutcome,
}

/// Forward-scan limit when a block record is implausible.
const RECOVERY_SCAN_LIMIT: usize = 512;
const RECOVERY_SCAN_STEP: usize = 4;

fn slice(buf: &[u8], off: usize, len: usize) -> Result<&[u8]> {
    buf.get(off..off.checked_add(len).ok_or(Error::OutOfBounds)?)
        .ok_or(Error::OutOfBounds)
}

// ---------------- stream walk ----------------

struct Block<'a> {
    info: BInfo,
    payload: &'a [u8],
}

/// Walk the block stream from `start` to its terminator, resynchronizing
/// through the bounded scan when a record is implausible. Payload bytes are
/// collected without being expanded.
fn walk_stream<'a>(
    buf: &'a [u8],
    start: usize,
    e: Endianness,
    expected_method: u8,
) -> Result<(Vec<Block<'a>>, UnpackOutcome)> {
    let mut blocks = Vec::new();
    let mut pos = start;
    let mut outcome = UnpackOutcome::Clean;
    loop {
        if BInfo::is_terminator(buf, pos) {
            return Ok((blocks, outcome));
        }
        let mut info = BInfo::decode(e, buf, pos)?;
        if !info.is_plausible() {
            // A damaged or shifted stream: look ahead in small steps for the
            // next record carrying the method this file was packed with.
            let mut found = None;
            let mut probe = pos + RECOVERY_SCAN_STEP;
            while probe <= pos + RECOVERY_SCAN_LIMIT {
                if BInfo::is_terminator(buf, probe) {
                    found = Some((probe, None));
                    break;
                }
                if let Ok(cand) = BInfo::decode(e, buf, probe) {
                    if cand.is_plausible()
                        && (cand.method == expected_method || cand.method == compress::M_STORE)
                    {
                        found = Some((probe, Some(cand)));
                        break;
                    }
                }
                probe += RECOVERY_SCAN_STEP;
            }
            match found {
                Some((_, None)) => return Ok((blocks, UnpackOutcome::Recovered)),
                Some((at, Some(cand))) => {
                    pos = at;
                    info = cand;
                    outcome = UnpackOutcome::Recovered;
                }
                None => {
                    return Err(Error::CompressedDataViolation(
                        "implausible block record and no resync point",
                    ));
                }
            }
        }
        let payload = slice(buf, pos + B_INFO_SIZE, info.c_len as usize)?;
        blocks.push(Block { info, payload });
        pos += B_INFO_SIZE + info.c_len as usize;
    }
}

// ---------------- reconstruction ----------------

fn decompress_block(b: &Block<'_>) -> Result<Vec<u8>> {
    compress::decompress(b.payload, b.info.method, b.info.u_len as usize)
}

fn off_to_vaddr(phdrs: &[Phdr], off: u64) -> u64 {
    phdrs
        .iter()
        .filter(|p| p.is_load())
        .find(|p| off >= p.offset && off < p.file_end())
        .map(|p| p.vaddr + (off - p.offset))
        .unwrap_or(0)
}

/// Expand the in-stream extents of `pplan` from `blocks` into `out`,
/// inverting per-block filters. Block boundaries must tile the extents.
fn fill_stream_extents(
    out: &mut [u8],
    blocks: &[Block<'_>],
    pplan: &PackPlan,
    phdrs: &[Phdr],
) -> Result<()> {
    let mut iter = blocks.iter();
    for ex in pplan.extents.iter().filter(|x| x.in_stream()) {
        let mut pos = ex.off;
        while pos < ex.end() {
            let b = iter
                .next()
                .ok_or(Error::CompressedDataViolation("stream ends inside an extent"))?;
            if pos + b.info.u_len as u64 > ex.end() {
                return Err(Error::CompressedDataViolation("block overruns its extent"));
            }
            let mut data = decompress_block(b)?;
            if b.info.filter != 0 {
                filter::invert(
                    &mut data,
                    b.info.filter,
                    b.info.filter_param,
                    off_to_vaddr(phdrs, pos),
                    pplan.base_va,
                )?;
            }
            out[pos as usize..pos as usize + data.len()].copy_from_slice(&data);
            pos += b.info.u_len as u64;
        }
    }
    if iter.next().is_some() {
        return Err(Error::CompressedDataViolation("trailing blocks beyond the plan"));
    }
    Ok(())
}

/// Locate the metadata records: right after the synthesized headers for an
/// executable, at the code boundary (past any aux page) for a library.
fn meta_offset(packed_hdr: &FileHeader, ph: &PackHeader, page: u64) -> u64 {
    match ph.format {
        FMT_SHLIB => ph.xct_off as u64 + ph.asl_pages as u64 * page,
        _ => packed_hdr.phoff + (packed_hdr.phnum as u64) * (packed_hdr.phentsize as u64),
    }
}

pub fn unpack(packed: &[u8]) -> Result<Unpacked> {
    // Read the trailer. Endianness comes from the packed file's own ident
    // bytes, which both output formats preserve.
    let packed_hdr = parse_file_header(packed)?;
    let e = packed_hdr.abi.endian;
    let ph = PackHeader::decode(e, packed)?;
    if ph.format != FMT_EXEC && ph.format != FMT_SHLIB {
        return Err(Error::CompressedDataViolation("unknown output format"));
    }
    let arch = arch::lookup(packed_hdr.machine, packed_hdr.abi.class)?;

    let meta = meta_offset(&packed_hdr, &ph, arch.page_size) as usize;
    let l_info = LInfo::decode(e, packed, meta)?;
    if l_info.version != VERSION || l_info.format != ph.format {
        return Err(Error::CompressedDataViolation("metadata does not match trailer"));
    }
    let p_info = PInfo::decode(e, packed, meta + L_INFO_SIZE)?;
    if p_info.orig_file_size != ph.u_file_size {
        return Err(Error::CompressedDataViolation("metadata does not match trailer"));
    }

    // Walk the stream and verify the compressed checksum before expanding
    // anything; recovery shifts never change the payload bytes, so the
    // checksum holds for a resynchronized stream too.
    let stream_start = meta + L_INFO_SIZE + P_INFO_SIZE;
    let (blocks, outcome) = walk_stream(packed, stream_start, e, ph.method)?;
    let mut c_adler = Adler32::new();
    for b in &blocks {
        c_adler.update(b.payload);
    }
    if c_adler.finish() != ph.c_adler {
        return Err(Error::ChecksumError);
    }
    if blocks.is_empty() {
        return Err(Error::CompressedDataViolation("empty block stream"));
    }

    // Bootstrap the original structures from block zero and re-derive the
    // extent plan the packer used.
    let block0 = decompress_block(&blocks[0])?;
    let hdr = parse_file_header(&block0)?;
    let phdrs = read_phdrs(&block0, &hdr)?;
    let (classification, xct_override) = match ph.format {
        FMT_SHLIB => (Classification::SharedLib, Some(ph.xct_off as u64)),
        _ => (Classification::Exec, None),
    };
    let pplan = plan::build_plan(
        &hdr,
        &phdrs,
        &[],
        classification,
        ph.u_file_size as u64,
        xct_override,
    )?;

    let mut out = vec![0u8; ph.u_file_size as usize];
    fill_stream_extents(&mut out, &blocks, &pplan, &phdrs)?;

    if ph.format == FMT_SHLIB {
        restore_inplace(&mut out, packed, &hdr, &phdrs, &pplan, &ph, arch)?;
    }

    // The final gate: the reconstruction must hash to the recorded value.
    if adler32(&out) != ph.u_adler {
        return Err(Error::ChecksumError);
    }
    Ok(Unpacked { data: out, outcome })
}

/// Copy the writable segments back from their slid offsets and undo every
/// patch the packer applied to them: the generic slide sites, then the
/// hijacked init slot, restored from the stash in the packed prefix.
fn restore_inplace(
    out: &mut [u8],
    packed: &[u8],
    hdr: &FileHeader,
    phdrs: &[Phdr],
    pplan: &PackPlan,
    ph: &PackHeader,
    arch: &arch::ArchInfo,
) -> Result<()> {
    let abi = hdr.abi;
    let asl_delta = ph.asl_pages as u64 * arch.page_size;
    let ctx = SlideCtx::new(pplan, phdrs, ph.so_slide as i64, asl_delta)?;

    for ex in pplan.extents.iter().filter(|x| x.kind == ExtentKind::InPlace) {
        let src = (ex.off as i64 + ctx.so_slide) as usize;
        let bytes = slice(packed, src, ex.len as usize)?;
        out[ex.off as usize..ex.end() as usize].copy_from_slice(bytes);
    }

    // The prefix and the compressed extents are already original, so the
    // structures the enumeration reads are exactly what the packer saw.
    let di = DynIndex::build(out, hdr, phdrs)?
        .ok_or(Error::MalformedDynamic("packed library lost its PT_DYNAMIC"))?;
    let (init, _) = layout::resolve_init_slot(out, abi, phdrs, &di)?;
    let hijack_off = init.value_off();
    let mut sites = layout::enumerate_patch_sites(out, hdr, phdrs, &di, arch)?;
    sites.retain(|s| s.off != hijack_off);

    let in_inplace = |off: u64| {
        pplan
            .extents
            .iter()
            .any(|x| x.kind == ExtentKind::InPlace && off >= x.off && off < x.end())
    };
    for site in &sites {
        if !in_inplace(site.off) {
            continue;
        }
        let v = abi.addr(out, site.off as usize)?;
        abi.set_addr(out, site.off as usize, layout::undo_value(site.kind, v, &ctx))?;
    }

    // The original init target was stashed in dynsym[0].st_value of the
    // packed prefix; block zero restored the field itself to zero.
    let stash_off = di
        .symtab_off
        .ok_or(Error::MalformedDynamic("no DT_SYMTAB"))?
        + crate::elf::model::sym_value_field(abi.class) as u64;
    let orig_init = abi.addr(packed, stash_off as usize)?;
    if in_inplace(hijack_off) {
        abi.set_addr(out, hijack_off as usize, orig_init)?;
        if let InitSlot::SpareNull { tag_slot, .. } = init {
            match abi.class {
                ElfClass::Elf32 => abi.endian.set32(out, tag_slot as usize, DT_NULL as u32)?,
                ElfClass::Elf64 => abi.endian.set64(out, tag_slot as usize, DT_NULL as u64)?,
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpacking_an_ordinary_file_reports_no_trailer() {
        let mut buf = vec![0u8; 256];
        buf[..4].copy_from_slice(&crate::elf::consts::ELFMAG);
        buf[4] = 2; // ELFCLASS64
        buf[5] = 1; // ELFDATA2LSB
        buf[6] = 1;
        // A valid ident but no trailer magic at the end.
        assert!(matches!(unpack(&buf), Err(Error::InvalidFormat(_))));
    }

    #[test]
    fn terminator_probe_is_byte_exact() {
        let mut buf = vec![0u8; 64];
        buf[20..24].copy_from_slice(b"SQZ!");
        assert!(BInfo::is_terminator(&buf, 16));
        buf[21] ^= 1;
        assert!(!BInfo::is_terminator(&buf, 16));
    }
}
