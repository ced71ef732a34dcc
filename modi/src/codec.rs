//! Codec dispatch (C3).
//!
//! Unifies the five decompressors behind the block-table's compression
//! method tag so the segment cache (C5) can decode a block without
//! knowing which codec produced it.

use crate::codec_adc;
use crate::codec_bzip2;
use crate::codec_deflate;
use crate::codec_lzfse;
use crate::codec_lzma;
use crate::error::Result;

/// Compression method carried by a `mish` block-table entry's `type`
/// field (see `BlockTableEntry.type` in the container design).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Adc,
    Zlib,
    Bzip2,
    Lzfse,
    Lzma,
}

impl CompressionMethod {
    /// Maps a `mish` entry type to its compression method, or `None` for
    /// the non-compressed (raw/sparse/comment/terminator) types.
    pub fn from_block_type(block_type: u32) -> Option<Self> {
        match block_type {
            0x8000_0004 => Some(CompressionMethod::Adc),
            0x8000_0005 => Some(CompressionMethod::Zlib),
            0x8000_0006 => Some(CompressionMethod::Bzip2),
            0x8000_0007 => Some(CompressionMethod::Lzfse),
            0x8000_0008 => Some(CompressionMethod::Lzma),
            _ => None,
        }
    }
}

/// Decompresses `compressed` into `out`, dispatching on `method`.
/// Returns the number of bytes written to `out`. `verify_checksums` gates
/// the codecs that carry an embedded checksum (zlib's Adler-32, BZIP2's
/// per-block and stream CRC-32); codecs with no checksum of their own
/// ignore the flag.
pub fn decompress(
    method: CompressionMethod,
    compressed: &[u8],
    out: &mut [u8],
    verify_checksums: bool,
) -> Result<usize> {
    match method {
        CompressionMethod::Adc => codec_adc::decompress(compressed, out),
        CompressionMethod::Zlib => codec_deflate::inflate_zlib(compressed, out, verify_checksums),
        CompressionMethod::Bzip2 => codec_bzip2::decompress(compressed, out, verify_checksums),
        CompressionMethod::Lzfse => codec_lzfse::decompress(compressed, out),
        CompressionMethod::Lzma => codec_lzma::decompress(compressed, out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_block_types() {
        assert_eq!(
            CompressionMethod::from_block_type(0x8000_0004),
            Some(CompressionMethod::Adc)
        );
        assert_eq!(
            CompressionMethod::from_block_type(0x8000_0008),
            Some(CompressionMethod::Lzma)
        );
    }

    #[test]
    fn raw_and_sparse_types_have_no_method() {
        assert_eq!(CompressionMethod::from_block_type(0x0000_0000), None);
        assert_eq!(CompressionMethod::from_block_type(0x0000_0001), None);
        assert_eq!(CompressionMethod::from_block_type(0xFFFF_FFFF), None);
    }
}
