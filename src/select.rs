//! Method and filter selection by parallel trial compression.
//!
//! Every candidate `(method, filter, param)` combination is tried on the
//! actual block data and the smallest total wins. One method/filter pair is
//! chosen for the whole file so the stub only needs a single decompressor,
//! but each block still falls back to literal storage individually when
//! compression fails to shrink it.

use rayon::prelude::*;

use crate::compress;
use crate::error::{Error, Result};
use crate::filter;
use crate::trailer::BInfo;

/// One block of in-stream data, carried with the context the byte filter
/// needs should it apply.
pub struct BlockSpec {
    pub data: Vec<u8>,
    /// Whether this block belongs to the plan's filter-candidate extent.
    pub filterable: bool,
    pub extent_va: u64,
    pub image_base: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub method: u8,
    pub filter: u8,
    pub filter_param: u8,
}

fn filter_variants(filters: &[u8]) -> Vec<(u8, u8)> {
    let mut out = Vec::new();
    for &f in filters {
        match f {
            filter::FILTER_NONE => out.push((f, 0)),
            // Both stored byte orders; big-endian sometimes models better.
            filter::FILTER_X86_BRANCH => {
                out.push((f, 0));
                out.push((f, 1));
            }
            _ => {}
        }
    }
    if out.is_empty() {
        out.push((filter::FILTER_NONE, 0));
    }
    out
}

/// Size of one block under a candidate, with the per-block literal fallback
/// already accounted for.
fn trial_block(block: &BlockSpec, method: u8, f: u8, param: u8) -> Result<u64> {
    let c_len = if block.filterable && f != filter::FILTER_NONE {
        let mut work = block.data.clone();
        filter::apply(&mut work, f, param, block.extent_va, block.image_base)?;
        compress::compress(&work, method)?.len()
    } else {
        compress::compress(&block.data, method)?.len()
    };
    Ok(c_len.min(block.data.len()) as u64)
}

/// Try every candidate combination over all blocks and pick the smallest
/// total. Candidates are independent, so the trials run in parallel; ties go
/// to the earlier candidate, which keeps the choice deterministic.
pub fn choose(blocks: &[BlockSpec], methods: &[u8], filters: &[u8]) -> Result<Selection> {
    if methods.is_empty() {
        return Err(Error::cant_pack("no compression method candidates"));
    }
    let mut candidates = Vec::new();
    for &m in methods {
        if !compress::is_known(m) {
            return Err(Error::cant_pack(format!("unknown method {}", m)));
        }
        for (f, param) in filter_variants(filters) {
            candidates.push(Selection { method: m, filter: f, filter_param: param });
        }
    }

    let totals: Vec<Result<u64>> = candidates
        .par_iter()
        .map(|c| {
            blocks
                .iter()
                .map(|b| trial_block(b, c.method, c.filter, c.filter_param))
                .try_fold(0u64, |acc, r| r.map(|n| acc + n))
        })
        .collect();

    let mut best: Option<(u64, Selection)> = None;
    for (c, total) in candidates.iter().zip(totals) {
        let total = total?;
        if best.map_or(true, |(t, _)| total < t) {
            best = Some((total, *c));
        }
    }
    Ok(best.expect("at least one candidate").1)
}

/// Compress one block under the chosen selection. A block that refuses to
/// shrink is stored literally (unfiltered), which its record announces.
pub fn encode_block(block: &BlockSpec, sel: Selection) -> Result<(BInfo, Vec<u8>)> {
    let apply_filter = block.filterable && sel.filter != filter::FILTER_NONE;
    let payload = if apply_filter {
        let mut work = block.data.clone();
        filter::apply(&mut work, sel.filter, sel.filter_param, block.extent_va, block.image_base)?;
        compress::compress(&work, sel.method)?
    } else {
        compress::compress(&block.data, sel.method)?
    };
    if payload.len() >= block.data.len() || sel.method == compress::M_STORE {
        return Ok((
            BInfo {
                u_len: block.data.len() as u32,
                c_len: block.data.len() as u32,
                method: compress::M_STORE,
                filter: 0,
                filter_param: 0,
            },
            block.data.clone(),
        ));
    }
    Ok((
        BInfo {
            u_len: block.data.len() as u32,
            c_len: payload.len() as u32,
            method: sel.method,
            filter: if apply_filter { sel.filter } else { 0 },
            filter_param: if apply_filter { sel.filter_param } else { 0 },
        },
        payload,
    ))
}
