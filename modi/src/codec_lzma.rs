//! LZMA (xz-container) decompression.
//!
//! The reference implementation decodes these blocks with liblzma's
//! `lzma_stream_decoder`, which parses the `.xz` container format (stream
//! header/footer, block CRC, index) rather than a bare LZMA1 byte stream.
//! This mirrors that by reading through `xz2::read::XzDecoder`, the same
//! crate and read-adapter pattern the pack's `pbzx` reader already uses
//! for its own XZ-compressed chunks.

use std::io::Read;

use xz2::read::XzDecoder;

use crate::error::{CompressionError, Result};

pub fn decompress(compressed: &[u8], out: &mut [u8]) -> Result<usize> {
    let mut decoder = XzDecoder::new(compressed);
    let mut decoded = Vec::with_capacity(out.len());
    decoder
        .read_to_end(&mut decoded)
        .map_err(|e| CompressionError::Data(format!("xz/LZMA decode failed: {e}")))?;

    if decoded.len() > out.len() {
        return Err(CompressionError::BufferTooSmall {
            needed: decoded.len(),
            available: out.len(),
        }
        .into());
    }
    out[..decoded.len()].copy_from_slice(&decoded);
    Ok(decoded.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_xz_input() {
        let garbage = [0u8; 16];
        let mut out = [0u8; 64];
        assert!(decompress(&garbage, &mut out).is_err());
    }
}
