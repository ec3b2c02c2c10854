//! End-to-end pack/unpack round trips over synthetic ELF images.

use sqz::elf::consts::*;
use sqz::elf::model::{
    parse_file_header, read_phdr, write_file_header, write_phdr, Abi, ElfClass, FileHeader, Phdr,
};
use sqz::endian::Endianness;
use sqz::error::Error;
use sqz::plan::Classification;
use sqz::trailer::{PInfo, PackHeader, L_INFO_SIZE};
use sqz::unpack::UnpackOutcome;
use sqz::{can_pack, pack, unpack, PackOptions};

const ABI: Abi = Abi { class: ElfClass::Elf64, endian: Endianness::Little };
const E: Endianness = Endianness::Little;

fn load(off: u64, va: u64, sz: u64, flags: u32) -> Phdr {
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

// ---------------- synthetic executable ----------------

/// Two-load ET_EXEC: a page of text mapped at 0x400000 and a page of data,
/// 0x2000 bytes total.
fn build_exec() -> Vec<u8> {
    let mut f = vec![0u8; 0x2000];
    let hdr = FileHeader {
        abi: ABI,
        osabi: 0,
        e_type: ET_EXEC,
        machine: EM_X86_64,
        entry: 0x40_0200,
        phoff: 64,
        shoff: 0,
        flags: 0,
        ehsize: 64,
        phentsize: 56,
        phnum: 2,
        shentsize: 0,
        shnum: 0,
        shstrndx: 0,
    };
    write_file_header(&mut f, &hdr).unwrap();
    write_phdr(ABI, &mut f, 64, &load(0, 0x40_0000, 0x1000, PF_R | PF_X)).unwrap();
    write_phdr(ABI, &mut f, 120, &load(0x1000, 0x40_1000, 0x1000, PF_R | PF_W)).unwrap();

    // Text: mostly nops with a couple of branches the byte filter can chew on.
    for b in &mut f[0x100..0x1000] {
        *b = 0x90;
    }
    f[0x200..0x205].copy_from_slice(&[0xe8, 0x10, 0x00, 0x00, 0x00]); // call +0x10
    f[0x240..0x246].copy_from_slice(&[0x0f, 0x84, 0x40, 0x00, 0x00, 0x00]); // je near
    for i in 0x1000..0x2000 {
        f[i] = (i % 7) as u8;
    }
    f
}

// ---------------- 32-bit big-endian executable ----------------

const ABI_BE32: Abi = Abi { class: ElfClass::Elf32, endian: Endianness::Big };

/// Two-load ET_EXEC for a 64 KiB page machine, 32-bit big-endian.
fn build_exec_be32() -> Vec<u8> {
    let mut f = vec![0u8; 0x2000];
    let hdr = FileHeader {
        abi: ABI_BE32,
        osabi: 0,
        e_type: ET_EXEC,
        machine: EM_PPC,
        entry: 0x1000_0100,
        phoff: 52,
        shoff: 0,
        flags: 0,
        ehsize: 52,
        phentsize: 32,
        phnum: 2,
        shentsize: 0,
        shnum: 0,
        shstrndx: 0,
    };
    write_file_header(&mut f, &hdr).unwrap();
    let mut text = load(0, 0x1000_0000, 0x1000, PF_R | PF_X);
    let mut data = load(0x1000, 0x1000_1000, 0x1000, PF_R | PF_W);
    text.align = 0x10000;
    data.align = 0x10000;
    write_phdr(ABI_BE32, &mut f, 52, &text).unwrap();
    write_phdr(ABI_BE32, &mut f, 84, &data).unwrap();
    for i in 0x100..0x2000 {
        f[i] = (i % 5) as u8;
    }
    f
}

// ---------------- synthetic shared library ----------------

/// ET_DYN library: non-writable text LOAD covering the code boundary at
/// 0x1000, a writable data LOAD holding the dynamic segment, section headers
/// in the unloaded tail. 0x3000 bytes total.
fn build_shlib() -> Vec<u8> {
    let mut f = vec![0u8; 0x3000];
    let hdr = FileHeader {
        abi: ABI,
        osabi: 0,
        e_type: ET_DYN,
        machine: EM_X86_64,
        entry: 0,
        phoff: 64,
        shoff: 0x2f00,
        flags: 0,
        ehsize: 64,
        phentsize: 56,
        phnum: 3,
        shentsize: 64,
        shnum: 2,
        shstrndx: 0,
    };
    write_file_header(&mut f, &hdr).unwrap();
    write_phdr(ABI, &mut f, 64, &load(0, 0, 0x2000, PF_R | PF_X)).unwrap();
    write_phdr(ABI, &mut f, 120, &load(0x2000, 0x3000, 0xf00, PF_R | PF_W)).unwrap();
    let dynamic = Phdr {
        p_type: PT_DYNAMIC,
        flags: PF_R | PF_W,
        offset: 0x2000,
        vaddr: 0x3000,
        paddr: 0x3000,
        filesz: 0x120,
        memsz: 0x120,
        align: 8,
    };
    write_phdr(ABI, &mut f, 176, &dynamic).unwrap();

    // .dynsym at 0x100: null, _init (in text), _end (absolute-but-relative).
    let sym = |f: &mut [u8], at: usize, name: u32, shndx: u16, value: u64| {
        E.set32(f, at, name).unwrap();
        f[at + 4] = 0x12; // GLOBAL FUNC
        f[at + 6] = (shndx & 0xff) as u8;
        f[at + 7] = (shndx >> 8) as u8;
        E.set64(f, at + 8, value).unwrap();
    };
    sym(&mut f, 0x118, 1, 1, 0x1000); // _init
    sym(&mut f, 0x130, 7, SHN_ABS, 0x3f00); // _end

    // .dynstr at 0x180.
    f[0x180..0x18c].copy_from_slice(b"\0_init\0_end\0");

    // SysV hash at 0x200: one bucket, three chain slots.
    for (i, v) in [1u32, 3, 1, 0, 2, 0].iter().enumerate() {
        E.set32(&mut f, 0x200 + 4 * i, *v).unwrap();
    }

    // .rela.dyn at 0x240: a RELATIVE entry and a GLOB_DAT entry, both
    // targeting GOT words in the data segment.
    E.set64(&mut f, 0x240, 0x3010).unwrap();
    E.set64(&mut f, 0x248, R_X86_64_RELATIVE as u64).unwrap();
    E.set64(&mut f, 0x250, 0x1500).unwrap(); // address-like addend
    E.set64(&mut f, 0x258, 0x3018).unwrap();
    E.set64(&mut f, 0x260, (1u64 << 32) | R_X86_64_GLOB_DAT as u64).unwrap();
    E.set64(&mut f, 0x268, 0).unwrap();

    // Text page.
    for b in &mut f[0x1000..0x2000] {
        *b = 0x90;
    }
    f[0x1000] = 0xc3; // _init: ret

    // Dynamic segment at 0x2000 (va 0x3000).
    let tags: [(i64, u64); 11] = [
        (DT_HASH, 0x200),
        (DT_STRTAB, 0x180),
        (DT_SYMTAB, 0x100),
        (DT_STRSZ, 12),
        (DT_SYMENT, 24),
        (DT_RELA, 0x240),
        (DT_RELASZ, 48),
        (DT_RELAENT, 24),
        (DT_INIT, 0x1000),
        (DT_FINI, 0x1800),
        (DT_NULL, 0),
    ];
    for (i, (tag, val)) in tags.iter().enumerate() {
        E.set64(&mut f, 0x2000 + 16 * i, *tag as u64).unwrap();
        E.set64(&mut f, 0x2008 + 16 * i, *val).unwrap();
    }
    E.set64(&mut f, 0x2010, 0xdead_beef).unwrap(); // GOT word the relocs target

    // Section headers at 0x2f00: null + .text, which fixes the code boundary.
    let sh_text = 0x2f40;
    E.set32(&mut f, sh_text + 4, SHT_PROGBITS).unwrap();
    E.set64(&mut f, sh_text + 8, SHF_ALLOC | SHF_EXECINSTR).unwrap();
    E.set64(&mut f, sh_text + 16, 0x1000).unwrap(); // sh_addr
    E.set64(&mut f, sh_text + 24, 0x1000).unwrap(); // sh_offset
    E.set64(&mut f, sh_text + 32, 0x1000).unwrap(); // sh_size
    f
}

fn dyn_value(buf: &[u8], dyn_off: usize, tag: i64) -> Option<u64> {
    for i in 0..32 {
        let at = dyn_off + 16 * i;
        let t = E.get64(buf, at).ok()? as i64;
        if t == DT_NULL {
            return None;
        }
        if t == tag {
            return E.get64(buf, at + 8).ok();
        }
    }
    None
}

// ---------------- executables ----------------

#[test]
fn exec_round_trip_is_byte_exact() {
    let orig = build_exec();
    let packed = pack(&orig, &PackOptions::default()).unwrap();
    assert!(packed.len() < orig.len(), "synthetic image must actually shrink");

    let ph = parse_file_header(&packed).unwrap();
    assert_eq!(ph.e_type, ET_EXEC);
    assert_eq!(ph.phnum, 2);
    // The reservation segment comes first and spans the original image.
    let base = read_phdr(ABI, &packed, 64).unwrap();
    assert_eq!(base.p_type, PT_LOAD);
    assert_eq!(base.flags, PF_R | PF_W);
    assert_eq!(base.vaddr, 0x40_0000);
    assert_eq!(base.memsz, 0x2000);
    // The text segment maps the whole packed file.
    let text = read_phdr(ABI, &packed, 120).unwrap();
    assert_eq!(text.flags, PF_R | PF_X);
    assert_eq!(text.offset, 0);
    assert_eq!(text.filesz, packed.len() as u64);
    // Entry lands inside the mapped stub, past the original entry.
    assert!(ph.entry > 0x40_0000 && ph.entry < 0x40_0000 + packed.len() as u64);

    let meta = 64 + 2 * 56;
    let p_info = PInfo::decode(E, &packed, meta + L_INFO_SIZE).unwrap();
    assert_eq!(p_info.orig_file_size, 0x2000);

    let restored = unpack(&packed).unwrap();
    assert_eq!(restored.outcome, UnpackOutcome::Clean);
    assert_eq!(restored.data, orig);
}

#[test]
fn exec_round_trips_with_forced_store() {
    let orig = build_exec();
    let opts = PackOptions {
        methods: vec![sqz::compress::M_STORE],
        ..PackOptions::default()
    };
    let packed = pack(&orig, &opts).unwrap();
    let restored = unpack(&packed).unwrap();
    assert_eq!(restored.data, orig);
}

#[test]
fn packing_twice_is_rejected() {
    let packed = pack(&build_exec(), &PackOptions::default()).unwrap();
    assert!(matches!(
        pack(&packed, &PackOptions::default()),
        Err(Error::AlreadyPacked)
    ));
}

#[test]
fn flipped_payload_byte_is_a_checksum_error() {
    let mut packed = pack(&build_exec(), &PackOptions::default()).unwrap();
    // Inside block zero's literal payload: records still parse, bytes differ.
    let meta = 64 + 2 * 56;
    packed[meta + 24 + 12 + 40] ^= 0xff;
    assert!(matches!(unpack(&packed), Err(Error::ChecksumError)));
}

#[test]
fn junk_before_a_block_record_is_recovered() {
    let orig = build_exec();
    let mut packed = pack(&orig, &PackOptions::default()).unwrap();
    // Block zero is the 176-byte header literal; splice four zero bytes
    // right where the second block record begins.
    let meta = 64 + 2 * 56;
    let second_record = meta + 24 + 12 + 176;
    for _ in 0..4 {
        packed.insert(second_record, 0);
    }
    let restored = unpack(&packed).unwrap();
    assert_eq!(restored.outcome, UnpackOutcome::Recovered);
    assert_eq!(restored.data, orig);
}

#[test]
fn oversized_phnum_errors_instead_of_panicking() {
    let mut f = build_exec();
    E.set16(&mut f, 56, 500).unwrap(); // e_phnum
    assert!(pack(&f, &PackOptions::default()).is_err());
}

#[test]
fn detached_program_header_table_cannot_pack() {
    let mut f = build_exec();
    // Move the table out from behind the Ehdr and point e_phoff at it.
    let table: Vec<u8> = f[64..176].to_vec();
    f[0x300..0x370].copy_from_slice(&table);
    E.set64(&mut f, 32, 0x300).unwrap(); // e_phoff
    let err = pack(&f, &PackOptions::default()).unwrap_err();
    assert!(matches!(err, Error::CantPack(_)));
}

#[test]
fn big_endian_32bit_exec_round_trips() {
    let orig = build_exec_be32();
    let packed = pack(&orig, &PackOptions::default()).unwrap();

    let ph = parse_file_header(&packed).unwrap();
    assert_eq!(ph.abi, ABI_BE32);
    assert_eq!(ph.e_type, ET_EXEC);
    let base = read_phdr(ABI_BE32, &packed, 52).unwrap();
    assert_eq!(base.vaddr, 0x1000_0000);
    assert_eq!(base.memsz, 0x10000, "reservation rounds up to the 64 KiB page");

    let restored = unpack(&packed).unwrap();
    assert_eq!(restored.outcome, UnpackOutcome::Clean);
    assert_eq!(restored.data, orig);
}

#[test]
fn truncated_packed_file_reports_a_missing_trailer() {
    let packed = pack(&build_exec(), &PackOptions::default()).unwrap();
    assert!(matches!(
        unpack(&packed[..200]),
        Err(Error::InvalidFormat(_))
    ));
}

// ---------------- shared libraries ----------------

#[test]
fn shlib_round_trip_restores_init_and_layout() {
    let orig = build_shlib();
    let packed = pack(&orig, &PackOptions::default()).unwrap();

    let tr = PackHeader::decode(E, &packed).unwrap();
    assert_eq!(tr.xct_off, 0x1000);
    assert_eq!(tr.so_slide, 0, "stream fits below the data segment");
    assert_eq!(tr.asl_pages, 0);

    // Section headers are gone from the literal header.
    let ph = parse_file_header(&packed).unwrap();
    assert_eq!(ph.shoff, 0);
    assert_eq!(ph.shnum, 0);
    // The original init target is stashed in dynsym[0].st_value.
    assert_eq!(E.get64(&packed, 0x108).unwrap(), 0x1000);
    // DT_INIT now points into the stub region, and the covering segment
    // grew to map it.
    let init = dyn_value(&packed, 0x2000, DT_INIT).unwrap();
    assert!(init > 0x1000 && init < 0x2000, "init va {:#x}", init);
    let cover = read_phdr(ABI, &packed, 64).unwrap();
    assert!(cover.filesz > init);
    // The prefix below the code boundary is byte-identical outside the
    // enumerated patch sites; spot-check an untouched table.
    assert_eq!(&packed[0x180..0x18c], &orig[0x180..0x18c]);
    assert_eq!(&packed[0x200..0x218], &orig[0x200..0x218]);

    let restored = unpack(&packed).unwrap();
    assert_eq!(restored.outcome, UnpackOutcome::Clean);
    assert_eq!(restored.data, orig);
}

#[test]
fn shlib_aux_page_round_trip_slides_the_data_segment() {
    let orig = build_shlib();
    let opts = PackOptions { aux_page: true, ..PackOptions::default() };
    let packed = pack(&orig, &opts).unwrap();

    let tr = PackHeader::decode(E, &packed).unwrap();
    assert_eq!(tr.asl_pages, 1);
    assert_eq!(tr.so_slide, 0x1000, "one page of stream spill");
    // The aux page at the code boundary carries a readable header copy.
    assert_eq!(packed[0x1000..0x1004], ELFMAG);
    // The dynamic segment moved with the slide; its shifted DT_FINI proves
    // the address delta was applied.
    let fini = dyn_value(&packed, 0x3000, DT_FINI).unwrap();
    assert_eq!(fini, 0x1800 + 0x1000);

    let restored = unpack(&packed).unwrap();
    assert_eq!(restored.data, orig);
}

#[test]
fn unrecognized_relocation_type_cannot_pack() {
    let mut f = build_shlib();
    // Retag the GLOB_DAT entry as a direct 64-bit relocation (R_X86_64_64),
    // which carries an address the slide does not track.
    E.set64(&mut f, 0x260, (1u64 << 32) | 1).unwrap();
    let err = pack(&f, &PackOptions::default()).unwrap_err();
    assert!(matches!(err, Error::CantPack(_)));
}

#[test]
fn classification_reports_the_image_kind() {
    assert_eq!(can_pack(&build_exec()).unwrap(), Classification::Exec);
    assert_eq!(can_pack(&build_shlib()).unwrap(), Classification::SharedLib);
    assert!(matches!(can_pack(&[0u8; 64]), Err(Error::InvalidFormat(_))));
}

#[test]
fn nonzero_stash_slot_cannot_pack() {
    let mut f = build_shlib();
    E.set64(&mut f, 0x108, 0x42).unwrap(); // dynsym[0].st_value
    let err = pack(&f, &PackOptions::default()).unwrap_err();
    assert!(matches!(err, Error::CantPack(_)));
}

#[test]
fn writable_code_segment_cannot_pack() {
    let mut f = build_shlib();
    // Make the covering LOAD writable: p_flags of the first phdr.
    E.set32(&mut f, 64 + 4, PF_R | PF_W | PF_X).unwrap();
    let err = pack(&f, &PackOptions::default()).unwrap_err();
    assert!(matches!(err, Error::CantPack(_)));
}
