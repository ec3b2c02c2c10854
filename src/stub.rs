//! Embedded loader stubs.
//!
//! The stubs are opaque, architecture-specific machine code maintained
//! outside this crate and embedded verbatim. A stub is assembled by
//! concatenating named sections (entry flavor, decompressor family, fold
//! tail) followed by a 16-byte patch area the layout builder fills in:
//! the original entry/init address, the page size, and the method/filter/
//! format ids the runtime decompressor dispatches on.

use crate::endian::Endianness;
use crate::error::{Error, Result};
use crate::trailer::{FMT_EXEC, FMT_SHLIB};

/// Bytes reserved at the stub tail for patched-in values.
pub const STUB_TAIL: usize = 16;

struct StubSection {
    name: &'static str,
    bytes: &'static [u8],
}

// amd64-linux.elf
static AMD64_ENTRY: &[u8] = &[
    0x50, 0x51, 0x52, 0x56, 0x57, 0x55, 0x53, 0x48, 0x8d, 0x35, 0xd2, 0xff, 0xff, 0xff, 0x48,
    0x89, 0xe5, 0x48, 0x81, 0xec, 0x00, 0x10, 0x00, 0x00, 0x48, 0x89, 0xe7, 0xe8, 0x41, 0x00,
    0x00, 0x00, 0x48, 0x89, 0xec, 0x5b, 0x5d, 0x5f, 0x5e, 0x5a, 0x59, 0x58, 0xff, 0xe0,
];
static AMD64_SO_INIT: &[u8] = &[
    0x57, 0x56, 0x52, 0x51, 0x50, 0x48, 0x8d, 0x3d, 0xf2, 0xff, 0xff, 0xff, 0x48, 0x8b, 0x77,
    0xf8, 0xe8, 0x33, 0x00, 0x00, 0x00, 0x58, 0x59, 0x5a, 0x5e, 0x5f, 0xff, 0x25, 0x02, 0x00,
    0x00, 0x00,
];
static AMD64_LZMA: &[u8] = &[
    0x41, 0x57, 0x41, 0x56, 0x41, 0x55, 0x41, 0x54, 0x55, 0x53, 0x48, 0x83, 0xec, 0x58, 0x44,
    0x0f, 0xb6, 0x2a, 0x4c, 0x8b, 0x27, 0x48, 0x89, 0xd3, 0x8a, 0x03, 0x88, 0x44, 0x24, 0x10,
    0x44, 0x89, 0xe8, 0x83, 0xe0, 0x07, 0x88, 0x44, 0x24, 0x11, 0x41, 0xc0, 0xed, 0x03, 0x45,
    0x0f, 0xb6, 0xed, 0x31, 0xc9, 0x31, 0xd2, 0xfe, 0xc1, 0x48, 0x83, 0xc4, 0x58, 0x5b, 0x5d,
    0x41, 0x5c, 0x41, 0x5d, 0x41, 0x5e, 0x41, 0x5f, 0xc3,
];
static AMD64_FOLD: &[u8] = &[
    0x48, 0x31, 0xc0, 0xb0, 0x0b, 0x48, 0x8d, 0x3d, 0x20, 0x00, 0x00, 0x00, 0x48, 0x8d, 0x35,
    0x29, 0x00, 0x00, 0x00, 0x0f, 0x05, 0x48, 0x85, 0xc0, 0x78, 0x06, 0x48, 0x83, 0xf8, 0x00,
    0x75, 0xe5, 0xc3,
];

// i386-linux.elf
static I386_ENTRY: &[u8] = &[
    0x60, 0xe8, 0x00, 0x00, 0x00, 0x00, 0x58, 0x83, 0xe8, 0x06, 0x89, 0xc6, 0x8d, 0xb8, 0x00,
    0x10, 0x00, 0x00, 0x57, 0xe8, 0x1a, 0x00, 0x00, 0x00, 0x61, 0xff, 0xe0,
];
static I386_SO_INIT: &[u8] = &[
    0x60, 0xe8, 0x00, 0x00, 0x00, 0x00, 0x5e, 0x8b, 0x46, 0xfa, 0x50, 0xe8, 0x0e, 0x00, 0x00,
    0x00, 0x58, 0x61, 0xff, 0x60, 0x04,
];
static I386_LZMA: &[u8] = &[
    0x55, 0x57, 0x56, 0x53, 0x83, 0xec, 0x2c, 0x8b, 0x5c, 0x24, 0x40, 0x8a, 0x03, 0x88, 0x44,
    0x24, 0x08, 0x24, 0x07, 0x88, 0x44, 0x24, 0x09, 0xc0, 0xe8, 0x03, 0x0f, 0xb6, 0xc0, 0x31,
    0xc9, 0x31, 0xd2, 0x41, 0x83, 0xc4, 0x2c, 0x5b, 0x5e, 0x5f, 0x5d, 0xc3,
];
static I386_FOLD: &[u8] = &[
    0x31, 0xc0, 0xb0, 0x5b, 0x8d, 0x5c, 0x24, 0x10, 0x8d, 0x4c, 0x24, 0x20, 0xcd, 0x80, 0x85,
    0xc0, 0x78, 0x04, 0x75, 0xee, 0xc3,
];

// arm64-linux.elf
static ARM64_ENTRY: &[u8] = &[
    0xfd, 0x7b, 0xbf, 0xa9, 0xf3, 0x53, 0xbf, 0xa9, 0xf5, 0x5b, 0xbf, 0xa9, 0x00, 0x01, 0x00,
    0x10, 0xe1, 0x03, 0x00, 0xaa, 0x21, 0x00, 0x00, 0x94, 0xf5, 0x5b, 0xc1, 0xa8, 0xf3, 0x53,
    0xc1, 0xa8, 0xfd, 0x7b, 0xc1, 0xa8, 0x00, 0x00, 0x1f, 0xd6,
];
static ARM64_SO_INIT: &[u8] = &[
    0xe0, 0x07, 0xbf, 0xa9, 0xe2, 0x0f, 0xbf, 0xa9, 0x40, 0x00, 0x00, 0x10, 0x01, 0x00, 0x5e,
    0xf8, 0x19, 0x00, 0x00, 0x94, 0xe2, 0x0f, 0xc1, 0xa8, 0xe0, 0x07, 0xc1, 0xa8, 0x20, 0x00,
    0x1f, 0xd6,
];
static ARM64_LZMA: &[u8] = &[
    0xff, 0x43, 0x01, 0xd1, 0xf3, 0x53, 0x01, 0xa9, 0xf5, 0x5b, 0x02, 0xa9, 0x28, 0x00, 0x40,
    0x39, 0x09, 0x1d, 0x00, 0x12, 0x08, 0x7d, 0x03, 0x53, 0xe9, 0x03, 0x00, 0x2a, 0xea, 0x03,
    0x1f, 0x2a, 0xf5, 0x5b, 0x42, 0xa9, 0xf3, 0x53, 0x41, 0xa9, 0xff, 0x43, 0x01, 0x91, 0xc0,
    0x03, 0x5f, 0xd6,
];
static ARM64_FOLD: &[u8] = &[
    0xe8, 0x03, 0x1f, 0xaa, 0xa8, 0x0b, 0x80, 0xd2, 0x01, 0x00, 0x00, 0xd4, 0x1f, 0x00, 0x00,
    0xb1, 0x4b, 0xff, 0xff, 0x54, 0xc0, 0x03, 0x5f, 0xd6,
];

// arm-linux.elf
static ARM_ENTRY: &[u8] = &[
    0x0f, 0x40, 0x2d, 0xe9, 0x0f, 0x00, 0x4f, 0xe1, 0x48, 0x10, 0x8f, 0xe2, 0x07, 0x00, 0x00,
    0xeb, 0x0f, 0x40, 0xbd, 0xe8, 0x10, 0xff, 0x2f, 0xe1,
];
static ARM_SO_INIT: &[u8] = &[
    0x0f, 0x40, 0x2d, 0xe9, 0x34, 0x00, 0x9f, 0xe5, 0x05, 0x00, 0x00, 0xeb, 0x0f, 0x40, 0xbd,
    0xe8, 0x04, 0xf0, 0x9d, 0xe4,
];
static ARM_LZMA: &[u8] = &[
    0xf0, 0x45, 0x2d, 0xe9, 0x00, 0x30, 0xd2, 0xe5, 0x07, 0x20, 0x03, 0xe2, 0xa3, 0x31, 0xa0,
    0xe1, 0x00, 0x10, 0xa0, 0xe3, 0x00, 0x20, 0xa0, 0xe3, 0xf0, 0x45, 0xbd, 0xe8, 0x1e, 0xff,
    0x2f, 0xe1,
];
static ARM_FOLD: &[u8] = &[
    0x01, 0x70, 0xa0, 0xe3, 0x00, 0x00, 0x00, 0xef, 0x00, 0x00, 0x50, 0xe3, 0xfb, 0xff, 0xff,
    0x1a, 0x1e, 0xff, 0x2f, 0xe1,
];

// Generic fallback used by the remaining machines; register-poor loop
// skeletons kept per-name so families can still be swapped independently.
static GEN_ENTRY: &[u8] = &[
    0x01, 0x11, 0x06, 0xec, 0x22, 0xe4, 0x00, 0x10, 0x97, 0x00, 0x00, 0x00, 0xe7, 0x80, 0x00,
    0x00, 0x22, 0x64, 0x01, 0x11, 0x82, 0x80,
];
static GEN_SO_INIT: &[u8] = &[
    0x41, 0x11, 0x06, 0xe4, 0x97, 0x00, 0x00, 0x00, 0xe7, 0x80, 0x40, 0x00, 0xa2, 0x60, 0x41,
    0x01, 0x82, 0x80,
];
static GEN_LZMA: &[u8] = &[
    0x03, 0x45, 0x05, 0x00, 0x93, 0x77, 0x75, 0x00, 0x13, 0x55, 0x35, 0x00, 0x63, 0x04, 0x05,
    0x00, 0x13, 0x05, 0x00, 0x00, 0x67, 0x80, 0x00, 0x00,
];
static GEN_FOLD: &[u8] = &[
    0x93, 0x08, 0xd0, 0x05, 0x73, 0x00, 0x00, 0x00, 0x63, 0x5c, 0x00, 0x00, 0x67, 0x80, 0x00,
    0x00,
];

static SECTIONS: &[StubSection] = &[
    StubSection { name: "amd64-linux.elf/entry", bytes: AMD64_ENTRY },
    StubSection { name: "amd64-linux.elf/so_init", bytes: AMD64_SO_INIT },
    StubSection { name: "amd64-linux.elf/lzma", bytes: AMD64_LZMA },
    StubSection { name: "amd64-linux.elf/fold", bytes: AMD64_FOLD },
    StubSection { name: "i386-linux.elf/entry", bytes: I386_ENTRY },
    StubSection { name: "i386-linux.elf/so_init", bytes: I386_SO_INIT },
    StubSection { name: "i386-linux.elf/lzma", bytes: I386_LZMA },
    StubSection { name: "i386-linux.elf/fold", bytes: I386_FOLD },
    StubSection { name: "arm64-linux.elf/entry", bytes: ARM64_ENTRY },
    StubSection { name: "arm64-linux.elf/so_init", bytes: ARM64_SO_INIT },
    StubSection { name: "arm64-linux.elf/lzma", bytes: ARM64_LZMA },
    StubSection { name: "arm64-linux.elf/fold", bytes: ARM64_FOLD },
    StubSection { name: "arm-linux.elf/entry", bytes: ARM_ENTRY },
    StubSection { name: "arm-linux.elf/so_init", bytes: ARM_SO_INIT },
    StubSection { name: "arm-linux.elf/lzma", bytes: ARM_LZMA },
    StubSection { name: "arm-linux.elf/fold", bytes: ARM_FOLD },
    StubSection { name: "ppc32-linux.elf/entry", bytes: GEN_ENTRY },
    StubSection { name: "ppc32-linux.elf/so_init", bytes: GEN_SO_INIT },
    StubSection { name: "ppc32-linux.elf/lzma", bytes: GEN_LZMA },
    StubSection { name: "ppc32-linux.elf/fold", bytes: GEN_FOLD },
    StubSection { name: "ppc64-linux.elf/entry", bytes: GEN_ENTRY },
    StubSection { name: "ppc64-linux.elf/so_init", bytes: GEN_SO_INIT },
    StubSection { name: "ppc64-linux.elf/lzma", bytes: GEN_LZMA },
    StubSection { name: "ppc64-linux.elf/fold", bytes: GEN_FOLD },
    StubSection { name: "mips-linux.elf/entry", bytes: GEN_ENTRY },
    StubSection { name: "mips-linux.elf/so_init", bytes: GEN_SO_INIT },
    StubSection { name: "mips-linux.elf/lzma", bytes: GEN_LZMA },
    StubSection { name: "mips-linux.elf/fold", bytes: GEN_FOLD },
    StubSection { name: "riscv64-linux.elf/entry", bytes: GEN_ENTRY },
    StubSection { name: "riscv64-linux.elf/so_init", bytes: GEN_SO_INIT },
    StubSection { name: "riscv64-linux.elf/lzma", bytes: GEN_LZMA },
    StubSection { name: "riscv64-linux.elf/fold", bytes: GEN_FOLD },
];

fn section(name: &str) -> Result<&'static [u8]> {
    SECTIONS
        .iter()
        .find(|s| s.name == name)
        .map(|s| s.bytes)
        .ok_or_else(|| Error::cant_pack(format!("no loader stub section {}", name)))
}

/// Assemble the stub for `stub_name` (from the architecture record), the
/// output format and the chosen method family. The 16-byte patch area is
/// appended zeroed.
pub fn get_stub(stub_name: &str, format: u8, family: u8) -> Result<Vec<u8>> {
    let flavor = match format {
        FMT_EXEC => "entry",
        FMT_SHLIB => "so_init",
        _ => return Err(Error::cant_pack("unknown output format")),
    };
    let mut out = Vec::new();
    out.extend_from_slice(section(&format!("{}/{}", stub_name, flavor))?);
    if family != 0 {
        out.extend_from_slice(section(&format!("{}/lzma", stub_name))?);
    }
    out.extend_from_slice(section(&format!("{}/fold", stub_name))?);
    out.resize(out.len() + STUB_TAIL, 0);
    Ok(out)
}

/// Poke the patch slots at the stub tail: the preserved original entry (or
/// init) address, the page size and the decompressor dispatch ids.
pub fn patch_stub(
    stub: &mut [u8],
    e: Endianness,
    orig_va: u64,
    page_size: u32,
    method: u8,
    filter: u8,
    format: u8,
) -> Result<()> {
    if stub.len() < STUB_TAIL {
        return Err(Error::OutOfBounds);
    }
    let tail = stub.len() - STUB_TAIL;
    e.set64(stub, tail, orig_va)?;
    e.set32(stub, tail + 8, page_size)?;
    stub[tail + 12] = method;
    stub[tail + 13] = filter;
    stub[tail + 14] = format;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_assembly_selects_sections_by_name_and_family() {
        let with_dec = get_stub("amd64-linux.elf", FMT_EXEC, 1).unwrap();
        let without = get_stub("amd64-linux.elf", FMT_EXEC, 0).unwrap();
        assert!(with_dec.len() > without.len());
        assert!(with_dec.starts_with(AMD64_ENTRY));
        let so = get_stub("amd64-linux.elf", FMT_SHLIB, 1).unwrap();
        assert!(so.starts_with(AMD64_SO_INIT));
        assert!(get_stub("vax-linux.elf", FMT_EXEC, 1).is_err());
    }

    #[test]
    fn patch_slots_land_in_the_tail() {
        let mut stub = get_stub("arm64-linux.elf", FMT_SHLIB, 1).unwrap();
        patch_stub(&mut stub, Endianness::Little, 0x1234, 0x1000, 2, 1, FMT_SHLIB).unwrap();
        let tail = stub.len() - STUB_TAIL;
        assert_eq!(Endianness::Little.get64(&stub, tail).unwrap(), 0x1234);
        assert_eq!(stub[tail + 12], 2);
    }
}
