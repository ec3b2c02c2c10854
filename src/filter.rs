//! Reversible byte filters applied to executable extents before compression.
//!
//! Filter 1 rewrites x86-64 rel32 branch targets and RIP-relative
//! displacements into image-relative absolute form, which exposes repeated
//! call targets to the compressor. Only immediate/displacement bytes are
//! touched, so instruction boundaries are identical when the filtered bytes
//! are decoded again and the transform inverts exactly. The filter parameter
//! selects the stored byte order; big-endian storage sometimes models better.

use byteorder::{ByteOrder, LittleEndian};
use iced_x86::{Decoder, DecoderOptions};

use crate::error::{Error, Result};

pub const FILTER_NONE: u8 = 0;
pub const FILTER_X86_BRANCH: u8 = 1;

#[derive(Clone, Copy)]
struct Patch {
    fo: usize,
    next_ip: u32,
}

fn collect_patches(data: &[u8], extent_va: u64) -> Vec<Patch> {
    let mut patches = Vec::new();
    let mut decoder = Decoder::with_ip(64, data, extent_va, DecoderOptions::NONE);
    while decoder.can_decode() {
        let inst = decoder.decode();
        let inst_ip = inst.ip();
        let inst_len = inst.len();
        let next_ip = inst_ip.wrapping_add(inst_len as u64) as u32;
        let off_in_ext = (inst_ip - extent_va) as usize;
        if off_in_ext + inst_len > data.len() {
            break;
        }
        let co = decoder.get_constant_offsets(&inst);
        if inst.is_ip_rel_memory_operand() && co.has_displacement() && co.displacement_size() == 4 {
            let fo = off_in_ext + co.displacement_offset();
            if fo + 4 <= data.len() {
                patches.push(Patch { fo, next_ip });
            }
        }
        if (inst.is_call_near() || inst.is_jmp_near() || inst.is_jcc_short_or_near())
            && co.has_immediate()
            && co.immediate_size() == 4
        {
            let fo = off_in_ext + co.immediate_offset();
            if fo + 4 <= data.len() {
                patches.push(Patch { fo, next_ip });
            }
        }
    }
    patches
}

fn run(data: &mut [u8], param: u8, extent_va: u64, image_base: u64, forward: bool) {
    let base = image_base as u32;
    let use_be = param != 0;
    for p in collect_patches(data, extent_va) {
        if forward {
            let rel = LittleEndian::read_u32(&data[p.fo..p.fo + 4]);
            let dest = rel.wrapping_add(p.next_ip);
            let norm = dest.wrapping_sub(base);
            if use_be {
                data[p.fo..p.fo + 4].copy_from_slice(&norm.to_be_bytes());
            } else {
                data[p.fo..p.fo + 4].copy_from_slice(&norm.to_le_bytes());
            }
        } else {
            let norm = if use_be {
                u32::from_be_bytes(data[p.fo..p.fo + 4].try_into().unwrap())
            } else {
                LittleEndian::read_u32(&data[p.fo..p.fo + 4])
            };
            let dest = norm.wrapping_add(base);
            let rel = dest.wrapping_sub(p.next_ip);
            LittleEndian::write_u32(&mut data[p.fo..p.fo + 4], rel);
        }
    }
}

pub fn apply(data: &mut [u8], filter: u8, param: u8, extent_va: u64, image_base: u64) -> Result<()> {
    match filter {
        FILTER_NONE => Ok(()),
        FILTER_X86_BRANCH => {
            run(data, param, extent_va, image_base, true);
            Ok(())
        }
        _ => Err(Error::cant_pack(format!("unknown filter id {}", filter))),
    }
}

pub fn invert(data: &mut [u8], filter: u8, param: u8, extent_va: u64, image_base: u64) -> Result<()> {
    match filter {
        FILTER_NONE => Ok(()),
        FILTER_X86_BRANCH => {
            run(data, param, extent_va, image_base, false);
            Ok(())
        }
        _ => Err(Error::CompressedDataViolation("unknown filter id in block record")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // call +0x10; jne +0x20; mov eax,[rip+0x30]; then slack.
    fn sample_code() -> Vec<u8> {
        let mut v = vec![
            0xe8, 0x10, 0x00, 0x00, 0x00, // call
            0x0f, 0x85, 0x20, 0x00, 0x00, 0x00, // jne near
            0x8b, 0x05, 0x30, 0x00, 0x00, 0x00, // mov eax, [rip+0x30]
        ];
        v.extend_from_slice(&[0x90; 16]);
        v
    }

    #[test]
    fn filter_round_trips_both_byte_orders() {
        for param in [0u8, 1u8] {
            let original = sample_code();
            let mut work = original.clone();
            apply(&mut work, FILTER_X86_BRANCH, param, 0x40_1000, 0x40_0000).unwrap();
            assert_ne!(work, original, "filter must actually rewrite something");
            invert(&mut work, FILTER_X86_BRANCH, param, 0x40_1000, 0x40_0000).unwrap();
            assert_eq!(work, original);
        }
    }

    #[test]
    fn call_target_becomes_image_relative_absolute() {
        let mut work = sample_code();
        apply(&mut work, FILTER_X86_BRANCH, 0, 0x40_1000, 0x40_0000).unwrap();
        // call at ip 0x401000, next_ip 0x401005, rel 0x10 -> dest 0x401015,
        // minus base 0x400000 = 0x1015.
        assert_eq!(LittleEndian::read_u32(&work[1..5]), 0x1015);
    }

    #[test]
    fn unknown_filter_id_is_rejected() {
        let mut b = [0u8; 8];
        assert!(apply(&mut b, 9, 0, 0, 0).is_err());
        assert!(invert(&mut b, 9, 0, 0, 0).is_err());
    }
}
