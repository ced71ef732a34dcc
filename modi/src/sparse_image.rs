//! Sparse-image (`.sparseimage`) header and band table parsing (C4.4.1).
//!
//! The header is a fixed 64-byte big-endian prefix followed by the band
//! table itself. The table's on-disk encoding is inverted from how the
//! reader wants to use it: each table entry names the *slot* a band
//! occupies, rather than each slot naming its band, so parsing builds the
//! inverse mapping once up front.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Read};

use crate::error::{ModiError, Result};

pub const SIGNATURE: &[u8; 4] = b"sprs";
pub const HEADER_FIXED_SIZE: usize = 64;

/// A parsed sparse-image header plus its inverted band table.
#[derive(Debug)]
pub struct SparseImageHeader {
    pub sectors_per_band: u32,
    pub number_of_sectors: u32,
    pub number_of_bands: u32,
    /// `band_references[slot]` is the band table index backing that slot,
    /// or `u32::MAX` if the slot is sparse (no band stored on disk).
    pub band_references: Vec<u32>,
}

impl SparseImageHeader {
    pub fn media_size(&self) -> u64 {
        self.number_of_sectors as u64 * 512
    }

    pub fn band_offset(&self, table_index: u32) -> u64 {
        4096 + table_index as u64 * self.sectors_per_band as u64 * 512
    }
}

/// Parses a sparse-image header (the fixed 64-byte prefix plus band
/// table) from a complete in-memory copy of those bytes.
///
/// `data` must contain at least `HEADER_FIXED_SIZE` bytes; the caller is
/// responsible for having read enough of the file to cover the band
/// table (`HEADER_FIXED_SIZE + 4 * number_of_bands`), which is not known
/// until after the fixed prefix is parsed.
pub fn parse_header(data: &[u8]) -> Result<SparseImageHeader> {
    if data.len() < HEADER_FIXED_SIZE {
        return Err(ModiError::MalformedHeader(
            "sparse-image header shorter than the fixed 64-byte prefix".into(),
        ));
    }

    let mut cursor = Cursor::new(data);
    let mut signature = [0u8; 4];
    cursor.read_exact(&mut signature)?;
    if &signature != SIGNATURE {
        return Err(ModiError::MalformedHeader(format!(
            "expected sparse-image signature {SIGNATURE:?}, found {signature:?}"
        )));
    }

    cursor.read_u32::<BigEndian>()?; // unknown @4
    let sectors_per_band = cursor.read_u32::<BigEndian>()?;
    if sectors_per_band == 0 {
        return Err(ModiError::OutOfBounds(
            "sparse-image sectors_per_band is zero".into(),
        ));
    }
    cursor.read_u32::<BigEndian>()?; // unknown @12
    let number_of_sectors = cursor.read_u32::<BigEndian>()?;

    let number_of_bands = number_of_sectors.div_ceil(sectors_per_band);

    let table_bytes_needed = HEADER_FIXED_SIZE + 4 * number_of_bands as usize;
    if data.len() < table_bytes_needed {
        return Err(ModiError::MalformedHeader(format!(
            "sparse-image band table truncated: need {table_bytes_needed} bytes, have {}",
            data.len()
        )));
    }

    let mut band_references = vec![u32::MAX; number_of_bands as usize];
    let mut table_cursor = Cursor::new(&data[HEADER_FIXED_SIZE..table_bytes_needed]);
    for table_index in 0..number_of_bands {
        let value = table_cursor.read_u32::<BigEndian>()?;
        if value == 0 {
            continue;
        }
        let slot = value - 1;
        if slot >= number_of_bands {
            return Err(ModiError::OutOfBounds(format!(
                "band table entry {table_index} names slot {slot}, but only {number_of_bands} bands exist"
            )));
        }
        band_references[slot as usize] = table_index;
    }

    Ok(SparseImageHeader {
        sectors_per_band,
        number_of_sectors,
        number_of_bands,
        band_references,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_header(sectors_per_band: u32, number_of_sectors: u32, table: &[u32]) -> Vec<u8> {
        use byteorder::WriteBytesExt;
        let mut buf = Vec::new();
        buf.write_all(SIGNATURE).unwrap();
        buf.write_u32::<BigEndian>(0).unwrap();
        buf.write_u32::<BigEndian>(sectors_per_band).unwrap();
        buf.write_u32::<BigEndian>(0).unwrap();
        buf.write_u32::<BigEndian>(number_of_sectors).unwrap();
        buf.extend_from_slice(&[0u8; HEADER_FIXED_SIZE - 20]);
        for &v in table {
            buf.write_u32::<BigEndian>(v).unwrap();
        }
        buf
    }

    #[test]
    fn parses_header_with_one_mapped_and_one_sparse_band() {
        // sectors_per_band=16, number_of_sectors=32 -> 2 bands
        // table = [1, 0]: slot 0 holds table entry 0, slot 1 is sparse
        let data = build_header(16, 32, &[1, 0]);
        let header = parse_header(&data).unwrap();
        assert_eq!(header.number_of_bands, 2);
        assert_eq!(header.band_references, vec![0, u32::MAX]);
        assert_eq!(header.media_size(), 32 * 512);
    }

    #[test]
    fn rejects_zero_sectors_per_band() {
        let data = build_header(0, 32, &[]);
        assert!(parse_header(&data).is_err());
    }

    #[test]
    fn rejects_bad_signature() {
        let mut data = build_header(16, 32, &[1, 0]);
        data[0] = b'X';
        assert!(parse_header(&data).is_err());
    }

    #[test]
    fn rejects_table_entry_naming_slot_past_band_count() {
        // number_of_bands=2, but entry value 5 implies slot 4
        let data = build_header(16, 32, &[5, 0]);
        assert!(parse_header(&data).is_err());
    }

    #[test]
    fn band_offset_accounts_for_header_and_band_size() {
        let data = build_header(16, 32, &[1, 0]);
        let header = parse_header(&data).unwrap();
        assert_eq!(header.band_offset(0), 4096);
        assert_eq!(header.band_offset(1), 4096 + 16 * 512);
    }
}
