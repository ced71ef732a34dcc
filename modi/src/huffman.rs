//! Canonical Huffman code construction and symbol decoding.
//!
//! Shared by DEFLATE (literal/length and distance alphabets) and BZIP2
//! (per-group symbol trees). Codes are assigned the canonical way: within
//! a code length, codes are consecutive integers assigned in order of
//! increasing symbol value; the first code of each length is derived from
//! the count of codes of every shorter length.

use crate::bit_stream::BitStream;
use crate::error::{CompressionError, Result};

/// Maximum code length this table supports (DEFLATE codes are bounded to
/// 15 bits, BZIP2 group codes to 20; 20 covers both).
const MAX_BITS: usize = 20;

/// A canonical Huffman decode table.
pub struct HuffmanTable {
    /// Number of codes of each length, indexed by length (0 unused).
    counts: [u16; MAX_BITS + 1],
    /// Symbols sorted first by code length, then by original symbol index.
    symbols: Vec<u16>,
    max_length: u8,
}

impl HuffmanTable {
    /// Builds a canonical table from a per-symbol array of code lengths
    /// (0 meaning the symbol is unused).
    pub fn build(code_lengths: &[u8]) -> Result<Self> {
        let mut counts = [0u16; MAX_BITS + 1];
        let mut max_length = 0u8;

        for &len in code_lengths {
            if len as usize > MAX_BITS {
                return Err(CompressionError::Data(format!(
                    "huffman code length {len} exceeds supported maximum {MAX_BITS}"
                ))
                .into());
            }
            if len > 0 {
                counts[len as usize] += 1;
                max_length = max_length.max(len);
            }
        }

        // offsets[len] = index into `symbols` where codes of length `len` begin
        let mut offsets = [0u16; MAX_BITS + 2];
        for len in 1..=MAX_BITS {
            offsets[len + 1] = offsets[len] + counts[len];
        }

        let mut symbols = vec![0u16; offsets[MAX_BITS + 1] as usize];
        for (symbol, &len) in code_lengths.iter().enumerate() {
            if len > 0 {
                symbols[offsets[len as usize] as usize] = symbol as u16;
                offsets[len as usize] += 1;
            }
        }

        Ok(HuffmanTable {
            counts,
            symbols,
            max_length,
        })
    }

    /// Decodes one symbol from `bit_stream`, reading one bit at a time
    /// until the accumulated code matches a known length's range.
    ///
    /// This is the classic incremental canonical-Huffman decode: `code`
    /// accumulates bits MSB-first; `first`/`index` track the running
    /// starting code and symbol-table offset for each length in turn.
    pub fn decode(&self, bit_stream: &mut BitStream) -> Result<u16> {
        let mut code: i32 = 0;
        let mut first: i32 = 0;
        let mut index: i32 = 0;

        for len in 1..=self.max_length {
            code |= bit_stream.get_value(1)? as i32;
            let count = self.counts[len as usize] as i32;
            if code - first < count {
                return Ok(self.symbols[(index + (code - first)) as usize]);
            }
            index += count;
            first += count;
            first <<= 1;
            code <<= 1;
        }

        Err(CompressionError::Data("no matching huffman code found".into()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bit_stream::StorageType;

    #[test]
    fn builds_fixed_length_table_and_decodes() {
        // Four symbols, all 2 bits: 0=00, 1=01, 2=10, 3=11 (MSB-first codes)
        let table = HuffmanTable::build(&[2, 2, 2, 2]).unwrap();

        let data = [0b00_01_10_11u8];
        let mut bs = BitStream::new(&data, 0, StorageType::BackToFront);
        assert_eq!(table.decode(&mut bs).unwrap(), 0);
        assert_eq!(table.decode(&mut bs).unwrap(), 1);
        assert_eq!(table.decode(&mut bs).unwrap(), 2);
        assert_eq!(table.decode(&mut bs).unwrap(), 3);
    }

    #[test]
    fn handles_unbalanced_lengths() {
        // symbol 0: 1 bit (code 0), symbol 1: 2 bits (code 10), symbol 2: 2 bits (code 11)
        let table = HuffmanTable::build(&[1, 2, 2]).unwrap();

        // Encode symbol1 (10) then symbol0 (0) then symbol2 (11): bits "10" "0" "11" = 10011 + pad
        let data = [0b1001_1000u8];
        let mut bs = BitStream::new(&data, 0, StorageType::BackToFront);
        assert_eq!(table.decode(&mut bs).unwrap(), 1);
        assert_eq!(table.decode(&mut bs).unwrap(), 0);
        assert_eq!(table.decode(&mut bs).unwrap(), 2);
    }

    #[test]
    fn rejects_overlong_code_lengths() {
        let lengths = vec![0u8; 5];
        let mut lengths = lengths;
        lengths[0] = 21;
        assert!(HuffmanTable::build(&lengths).is_err());
    }
}
