//! LZFSE decompression.
//!
//! LZFSE is Apple's own compressor and the only codec in the suite that
//! is not implemented directly: it is gated behind the `lzfse` Cargo
//! feature (default-enabled) and delegates to the `lzfse` crate.

use crate::error::Result;

#[cfg(feature = "lzfse")]
pub fn decompress(compressed: &[u8], out: &mut [u8]) -> Result<usize> {
    use crate::error::CompressionError;

    // The lzfse crate's decoder wants headroom beyond the exact output
    // size; allocate 2x and copy only what's actually needed.
    let mut scratch = vec![0u8; out.len() * 2 + 64];
    let decoded_size = lzfse::decode_buffer(compressed, &mut scratch)
        .map_err(|e| CompressionError::Data(format!("LZFSE decode failed: {e:?}")))?;

    if decoded_size > out.len() {
        return Err(CompressionError::BufferTooSmall {
            needed: decoded_size,
            available: out.len(),
        }
        .into());
    }
    out[..decoded_size].copy_from_slice(&scratch[..decoded_size]);
    Ok(decoded_size)
}

#[cfg(not(feature = "lzfse"))]
pub fn decompress(_compressed: &[u8], _out: &mut [u8]) -> Result<usize> {
    use crate::error::CompressionError;

    Err(CompressionError::Unsupported(
        "LZFSE support was not compiled in (enable the \"lzfse\" feature)".into(),
    )
    .into())
}

#[cfg(all(test, feature = "lzfse"))]
mod tests {
    use super::*;

    #[test]
    fn surfaces_decode_errors_as_compression_error() {
        let garbage = [0xFFu8; 8];
        let mut out = [0u8; 64];
        assert!(decompress(&garbage, &mut out).is_err());
    }
}
