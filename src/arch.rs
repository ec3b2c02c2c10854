//! Architecture capability records.
//!
//! One closed table replaces a per-architecture class hierarchy: everything
//! machine-specific the engine needs (page size, the relocation types that
//! carry addresses, which byte filters apply, which stub to embed) is plain
//! data passed into otherwise architecture-agnostic code.

use crate::elf::consts::*;
use crate::elf::model::ElfClass;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct ArchInfo {
    pub machine: u16,
    pub name: &'static str,
    pub page_size: u64,
    /// R_*_RELATIVE for this machine; target word at r_offset holds an address.
    pub rel_relative: u32,
    /// R_*_GLOB_DAT, if the machine has one.
    pub rel_glob_dat: Option<u32>,
    /// R_*_JMP_SLOT / jump-slot relocation.
    pub rel_jmp_slot: Option<u32>,
    /// Byte-filter ids usable on this machine's executable extents.
    pub filters: &'static [u8],
    pub stub_name: &'static str,
}

const ARCHES: &[ArchInfo] = &[
    ArchInfo {
        machine: EM_386,
        name: "i386",
        page_size: 0x1000,
        rel_relative: R_386_RELATIVE,
        rel_glob_dat: Some(R_386_GLOB_DAT),
        rel_jmp_slot: Some(R_386_JMP_SLOT),
        filters: &[0],
        stub_name: "i386-linux.elf",
    },
    ArchInfo {
        machine: EM_X86_64,
        name: "amd64",
        page_size: 0x1000,
        rel_relative: R_X86_64_RELATIVE,
        rel_glob_dat: Some(R_X86_64_GLOB_DAT),
        rel_jmp_slot: Some(R_X86_64_JUMP_SLOT),
        filters: &[0, 1],
        stub_name: "amd64-linux.elf",
    },
    ArchInfo {
        machine: EM_ARM,
        name: "arm",
        page_size: 0x1000,
        rel_relative: R_ARM_RELATIVE,
        rel_glob_dat: Some(R_ARM_GLOB_DAT),
        rel_jmp_slot: Some(R_ARM_JUMP_SLOT),
        filters: &[0],
        stub_name: "arm-linux.elf",
    },
    ArchInfo {
        machine: EM_AARCH64,
        name: "arm64",
        page_size: 0x1000,
        rel_relative: R_AARCH64_RELATIVE,
        rel_glob_dat: Some(R_AARCH64_GLOB_DAT),
        rel_jmp_slot: Some(R_AARCH64_JUMP_SLOT),
        filters: &[0],
        stub_name: "arm64-linux.elf",
    },
    ArchInfo {
        machine: EM_PPC,
        name: "ppc32",
        page_size: 0x10000,
        rel_relative: R_PPC_RELATIVE,
        rel_glob_dat: None,
        rel_jmp_slot: None,
        filters: &[0],
        stub_name: "ppc32-linux.elf",
    },
    ArchInfo {
        machine: EM_PPC64,
        name: "ppc64",
        page_size: 0x10000,
        rel_relative: R_PPC64_RELATIVE,
        rel_glob_dat: None,
        rel_jmp_slot: None,
        filters: &[0],
        stub_name: "ppc64-linux.elf",
    },
    ArchInfo {
        machine: EM_MIPS,
        name: "mips",
        page_size: 0x1000,
        rel_relative: R_MIPS_REL32,
        rel_glob_dat: None,
        rel_jmp_slot: None,
        filters: &[0],
        stub_name: "mips-linux.elf",
    },
    ArchInfo {
        machine: EM_RISCV,
        name: "riscv64",
        page_size: 0x1000,
        rel_relative: R_RISCV_RELATIVE,
        rel_glob_dat: None,
        rel_jmp_slot: Some(R_RISCV_JUMP_SLOT),
        filters: &[0],
        stub_name: "riscv64-linux.elf",
    },
];

// The filter table is independent of EI_CLASS; a 32-bit image claiming
// EM_X86_64 (x32) is packable but the planner never filters it.
pub fn lookup(machine: u16, _class: ElfClass) -> Result<&'static ArchInfo> {
    ARCHES
        .iter()
        .find(|a| a.machine == machine)
        .ok_or(Error::InvalidFormat("unsupported e_machine"))
}

/// True when `r_type` carries a virtual address the slide must track.
pub fn reloc_targets_address(arch: &ArchInfo, r_type: u32) -> bool {
    r_type == arch.rel_relative
        || arch.rel_glob_dat == Some(r_type)
        || arch.rel_jmp_slot == Some(r_type)
}
