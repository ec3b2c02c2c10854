//! The compression codec boundary.
//!
//! Method ids are small integers recorded in every block; the rest of the
//! engine treats them opaquely apart from grouping into families when
//! choosing which loader sub-sections to embed. Both LZMA flavors ride on
//! the xz2 backend.

use std::io::{Read, Write};

use xz2::stream::{Check, Filters, LzmaOptions, Stream};

use crate::error::{Error, Result};

pub const M_STORE: u8 = 0;
pub const M_LZMA: u8 = 2;
pub const M_XZ: u8 = 3;

pub const DEFAULT_METHODS: &[u8] = &[M_LZMA, M_XZ];

const PRESET: u32 = 9 | (1u32 << 31); // 9 | PRESET_EXTREME

pub fn is_known(method: u8) -> bool {
    matches!(method, M_STORE | M_LZMA | M_XZ)
}

/// Loader sub-section family; store needs no decompressor at all.
pub fn family(method: u8) -> u8 {
    match method {
        M_STORE => 0,
        _ => 1,
    }
}

fn choose_dict_size(stream_len: usize) -> u32 {
    let min_ds: usize = 1 << 16;
    let max_ds: usize = 1 << 26;
    stream_len.max(min_ds).next_power_of_two().clamp(min_ds, max_ds) as u32
}

fn lzma_options(len: usize) -> Result<LzmaOptions> {
    let mut opts = LzmaOptions::new_preset(PRESET).map_err(|e| Error::Compression(e.to_string()))?;
    opts.position_bits(2).dict_size(choose_dict_size(len));
    Ok(opts)
}

fn encoder_stream(method: u8, len: usize) -> Result<Stream> {
    let opts = lzma_options(len)?;
    match method {
        M_LZMA => Stream::new_lzma_encoder(&opts).map_err(|e| Error::Compression(e.to_string())),
        M_XZ => {
            let mut filters = Filters::new();
            filters.lzma2(&opts);
            Stream::new_stream_encoder(&filters, Check::None)
                .map_err(|e| Error::Compression(e.to_string()))
        }
        _ => Err(Error::Compression(format!("unknown method {}", method))),
    }
}

fn decoder_stream(method: u8) -> Result<Stream> {
    match method {
        M_LZMA => Stream::new_lzma_decoder(u64::MAX).map_err(|e| Error::Compression(e.to_string())),
        M_XZ => Stream::new_stream_decoder(u64::MAX, 0)
            .map_err(|e| Error::Compression(e.to_string())),
        _ => Err(Error::Compression(format!("unknown method {}", method))),
    }
}

pub fn compress(data: &[u8], method: u8) -> Result<Vec<u8>> {
    if method == M_STORE {
        return Ok(data.to_vec());
    }
    let stream = encoder_stream(method, data.len())?;
    let mut enc = xz2::write::XzEncoder::new_stream(Vec::new(), stream);
    enc.write_all(data).map_err(|e| Error::Compression(e.to_string()))?;
    enc.finish().map_err(|e| Error::Compression(e.to_string()))
}

/// Decompress one block; the output length must equal `expected` exactly.
pub fn decompress(data: &[u8], method: u8, expected: usize) -> Result<Vec<u8>> {
    if method == M_STORE {
        if data.len() != expected {
            return Err(Error::CompressedDataViolation("literal block length mismatch"));
        }
        return Ok(data.to_vec());
    }
    let stream = decoder_stream(method)?;
    let mut dec = xz2::read::XzDecoder::new_stream(data, stream);
    let mut out = Vec::with_capacity(expected);
    dec.read_to_end(&mut out)
        .map_err(|e| Error::Compression(e.to_string()))?;
    if out.len() != expected {
        return Err(Error::CompressedDataViolation("block expanded to the wrong size"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_lzma_flavors_round_trip() {
        let data: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        for method in [M_LZMA, M_XZ] {
            let c = compress(&data, method).unwrap();
            assert!(c.len() < data.len());
            assert_eq!(decompress(&c, method, data.len()).unwrap(), data);
        }
    }

    #[test]
    fn wrong_expected_size_is_a_violation() {
        let data = vec![7u8; 256];
        let c = compress(&data, M_XZ).unwrap();
        assert!(matches!(
            decompress(&c, M_XZ, 255),
            Err(Error::CompressedDataViolation(_))
        ));
    }

    #[test]
    fn store_is_identity() {
        let data = vec![1u8, 2, 3];
        assert_eq!(compress(&data, M_STORE).unwrap(), data);
        assert_eq!(decompress(&data, M_STORE, 3).unwrap(), data);
    }
}
