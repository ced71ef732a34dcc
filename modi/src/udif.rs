//! UDIF (`.dmg`) trailer, XML plist traversal, and `mish` block-table
//! parsing (C4.4.3 / C4.4.4).
//!
//! Feeds the unified `SegmentList` (C5) directly rather than driving a
//! whole-partition decompress-to-buffer pass.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Read};

use crate::codec::CompressionMethod;
use crate::error::{ModiError, Result};
use crate::segment::{SegmentFlags, SegmentList};

pub const KOLY_SIGNATURE: &[u8; 4] = b"koly";
pub const MISH_SIGNATURE: &[u8; 4] = b"mish";
pub const TRAILER_SIZE: usize = 512;
const MISH_HEADER_SIZE: usize = 204;
const BLOCK_RUN_SIZE: usize = 40;

/// The 512-byte `koly` trailer at `file_size - 512`.
#[derive(Debug)]
pub struct UdifTrailer {
    pub format_version: u32,
    pub data_fork_offset: u64,
    pub data_fork_size: u64,
    pub resource_fork_offset: u64,
    pub resource_fork_size: u64,
    pub number_of_segments: u32,
    pub xml_plist_offset: u64,
    pub xml_plist_size: u64,
    pub number_of_sectors: u64,
}

pub fn parse_trailer(data: &[u8]) -> Result<UdifTrailer> {
    if data.len() < TRAILER_SIZE {
        return Err(ModiError::MalformedHeader(
            "UDIF trailer shorter than 512 bytes".into(),
        ));
    }
    let mut cursor = Cursor::new(data);
    let mut signature = [0u8; 4];
    cursor.read_exact(&mut signature)?;
    if &signature != KOLY_SIGNATURE {
        return Err(ModiError::MalformedHeader(format!(
            "expected UDIF signature {KOLY_SIGNATURE:?}, found {signature:?}"
        )));
    }

    let format_version = cursor.read_u32::<BigEndian>()?;
    // format_version != 4 is advisory only, per the design's resolution
    // of Open Question 1: the trailer's other fields are still trusted.
    cursor.read_u32::<BigEndian>()?; // size (=512)
    cursor.read_u32::<BigEndian>()?; // flags
    cursor.read_u64::<BigEndian>()?; // unknown @16
    let data_fork_offset = cursor.read_u64::<BigEndian>()?;
    let data_fork_size = cursor.read_u64::<BigEndian>()?;
    let resource_fork_offset = cursor.read_u64::<BigEndian>()?;
    let resource_fork_size = cursor.read_u64::<BigEndian>()?;
    cursor.read_u32::<BigEndian>()?; // unknown @56
    let number_of_segments = cursor.read_u32::<BigEndian>()?;
    if number_of_segments > 1 {
        return Err(ModiError::UnsupportedFormat(format!(
            "UDIF trailer declares {number_of_segments} segments; only single-segment images are supported"
        )));
    }

    // Skip segment UUID (16) + checksum blocks up to xml_plist_offset @216.
    let mut skip = [0u8; 16 + 8 + 128];
    cursor.read_exact(&mut skip)?;

    let xml_plist_offset = cursor.read_u64::<BigEndian>()?;
    let xml_plist_size = cursor.read_u64::<BigEndian>()?;

    cursor.set_position(492);
    let number_of_sectors = {
        let mut buf = [0u8; 8];
        cursor.read_exact(&mut buf)?;
        u64::from_be_bytes(buf)
    };

    Ok(UdifTrailer {
        format_version,
        data_fork_offset,
        data_fork_size,
        resource_fork_offset,
        resource_fork_size,
        number_of_segments,
        xml_plist_offset,
        xml_plist_size,
        number_of_sectors,
    })
}

/// Traverses `root -> resource-fork -> blkx -> array`, returning each
/// entry's raw `Data` payload (one `mish` block table per entry).
pub fn blkx_data_blobs(plist_data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let value: plist::Value = plist::from_bytes(plist_data)
        .map_err(|e| ModiError::InvalidPlist(format!("UDIF resource-fork plist error: {e}")))?;

    let dict = value
        .as_dictionary()
        .ok_or_else(|| ModiError::InvalidPlist("UDIF plist root is not a dictionary".into()))?;
    let resource_fork = dict
        .get("resource-fork")
        .and_then(|v| v.as_dictionary())
        .ok_or_else(|| ModiError::InvalidPlist("UDIF plist missing resource-fork".into()))?;
    let blkx = resource_fork
        .get("blkx")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ModiError::InvalidPlist("UDIF plist missing blkx array".into()))?;

    let mut blobs = Vec::with_capacity(blkx.len());
    for entry in blkx {
        let entry_dict = entry
            .as_dictionary()
            .ok_or_else(|| ModiError::InvalidPlist("blkx entry is not a dictionary".into()))?;
        let data = entry_dict
            .get("Data")
            .and_then(|v| v.as_data())
            .ok_or_else(|| ModiError::InvalidPlist("blkx entry missing Data".into()))?;
        blobs.push(data.to_vec());
    }
    Ok(blobs)
}

/// Appends every block run of one `mish` table (already base64-decoded by
/// the `plist` crate's `Data` representation) to `segments`, validating
/// the table's invariants and tracking the image-wide compression method.
pub fn append_mish_table(data: &[u8], segments: &mut SegmentList) -> Result<()> {
    if data.len() < MISH_HEADER_SIZE {
        return Err(ModiError::MalformedTable(
            "mish block table shorter than its 204-byte header".into(),
        ));
    }
    let mut cursor = Cursor::new(data);
    let mut signature = [0u8; 4];
    cursor.read_exact(&mut signature)?;
    if &signature != MISH_SIGNATURE {
        return Err(ModiError::MalformedTable(format!(
            "expected mish signature {MISH_SIGNATURE:?}, found {signature:?}"
        )));
    }
    let format_version = cursor.read_u32::<BigEndian>()?;
    if format_version != 1 {
        return Err(ModiError::MalformedTable(format!(
            "unsupported mish format_version {format_version}"
        )));
    }
    cursor.read_u64::<BigEndian>()?; // first_sector
    let declared_sector_count = cursor.read_u64::<BigEndian>()?;
    cursor.set_position(MISH_HEADER_SIZE as u64);

    let entries_bytes = &data[MISH_HEADER_SIZE..];
    if entries_bytes.len() % BLOCK_RUN_SIZE != 0 {
        return Err(ModiError::MalformedTable(
            "mish block run table is not a multiple of the 40-byte entry size".into(),
        ));
    }

    let mut running_sectors = 0u64;
    let mut running_start = 0u64;
    let mut terminated = false;

    for chunk in entries_bytes.chunks_exact(BLOCK_RUN_SIZE) {
        let mut entry_cursor = Cursor::new(chunk);
        let block_type = entry_cursor.read_u32::<BigEndian>()?;
        entry_cursor.read_u32::<BigEndian>()?; // comment
        let start_sector = entry_cursor.read_u64::<BigEndian>()?;
        let number_of_sectors = entry_cursor.read_u64::<BigEndian>()?;
        let data_offset = entry_cursor.read_u64::<BigEndian>()?;
        let data_size = entry_cursor.read_u64::<BigEndian>()?;

        if block_type == 0xFFFF_FFFF {
            terminated = true;
            break;
        }
        if block_type == 0x7FFF_FFFE {
            continue; // comment: no mapping, no sector accounting
        }

        if number_of_sectors == 0 {
            return Err(ModiError::MalformedTable(
                "mish block run has zero number_of_sectors".into(),
            ));
        }
        if start_sector != running_start {
            return Err(ModiError::MalformedTable(format!(
                "mish block run start_sector {start_sector} is not contiguous with the running total {running_start}"
            )));
        }

        let mapped_size = number_of_sectors * 512;
        match block_type {
            0x0000_0000 | 0x0000_0002 => {
                segments.append(0, 0, 0, mapped_size, SegmentFlags::Sparse);
            }
            0x0000_0001 => {
                segments.append(
                    0,
                    data_offset,
                    mapped_size,
                    mapped_size,
                    SegmentFlags::None,
                );
            }
            other => {
                if number_of_sectors > 2048 {
                    return Err(ModiError::MalformedTable(format!(
                        "compressed mish block run spans {number_of_sectors} sectors, exceeding the 2048-sector bound"
                    )));
                }
                let method = CompressionMethod::from_block_type(other as u32).ok_or_else(|| {
                    ModiError::UnsupportedFormat(format!(
                        "unrecognized mish block type {other:#x}"
                    ))
                })?;
                segments.set_or_check_compression_method(method)?;
                segments.append(0, data_offset, data_size, mapped_size, SegmentFlags::Compressed);
            }
        }

        running_start += number_of_sectors;
        running_sectors += number_of_sectors;
    }

    if !terminated {
        return Err(ModiError::MalformedTable(
            "mish block table missing 0xFFFFFFFF terminator".into(),
        ));
    }
    if running_sectors != declared_sector_count {
        return Err(ModiError::MalformedTable(format!(
            "mish table declares {declared_sector_count} sectors but entries sum to {running_sectors}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    fn build_trailer(
        format_version: u32,
        data_fork_size: u64,
        number_of_segments: u32,
        xml_plist_offset: u64,
        xml_plist_size: u64,
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(KOLY_SIGNATURE);
        buf.write_u32::<BigEndian>(format_version).unwrap();
        buf.write_u32::<BigEndian>(512).unwrap();
        buf.write_u32::<BigEndian>(0).unwrap();
        buf.write_u64::<BigEndian>(0).unwrap();
        buf.write_u64::<BigEndian>(0).unwrap(); // data_fork_offset
        buf.write_u64::<BigEndian>(data_fork_size).unwrap();
        buf.write_u64::<BigEndian>(0).unwrap(); // resource_fork_offset
        buf.write_u64::<BigEndian>(0).unwrap(); // resource_fork_size
        buf.write_u32::<BigEndian>(0).unwrap();
        buf.write_u32::<BigEndian>(number_of_segments).unwrap();
        buf.extend_from_slice(&[0u8; 16 + 8 + 128]);
        buf.write_u64::<BigEndian>(xml_plist_offset).unwrap();
        buf.write_u64::<BigEndian>(xml_plist_size).unwrap();
        buf.resize(492, 0);
        buf.write_u64::<BigEndian>(0).unwrap(); // number_of_sectors
        buf.resize(TRAILER_SIZE, 0);
        buf
    }

    #[test]
    fn parses_valid_trailer() {
        let data = build_trailer(4, 1_048_576, 1, 0x1000, 0x200);
        let trailer = parse_trailer(&data).unwrap();
        assert_eq!(trailer.data_fork_size, 1_048_576);
        assert_eq!(trailer.xml_plist_offset, 0x1000);
        assert_eq!(trailer.xml_plist_size, 0x200);
    }

    #[test]
    fn rejects_more_than_one_segment() {
        let data = build_trailer(4, 1_048_576, 2, 0, 0);
        assert!(parse_trailer(&data).is_err());
    }

    #[test]
    fn accepts_unexpected_format_version_as_advisory() {
        let data = build_trailer(7, 1_048_576, 1, 0, 0);
        assert!(parse_trailer(&data).is_ok());
    }

    fn build_mish_entry(
        block_type: u32,
        start_sector: u64,
        number_of_sectors: u64,
        data_offset: u64,
        data_size: u64,
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(block_type).unwrap();
        buf.write_u32::<BigEndian>(0).unwrap();
        buf.write_u64::<BigEndian>(start_sector).unwrap();
        buf.write_u64::<BigEndian>(number_of_sectors).unwrap();
        buf.write_u64::<BigEndian>(data_offset).unwrap();
        buf.write_u64::<BigEndian>(data_size).unwrap();
        buf
    }

    fn build_mish_table(entries: &[Vec<u8>], declared_sectors: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MISH_SIGNATURE);
        buf.write_u32::<BigEndian>(1).unwrap();
        buf.write_u64::<BigEndian>(0).unwrap(); // first_sector
        buf.write_u64::<BigEndian>(declared_sectors).unwrap();
        buf.resize(MISH_HEADER_SIZE, 0);
        for e in entries {
            buf.extend_from_slice(e);
        }
        buf
    }

    #[test]
    fn parses_raw_and_sparse_entries() {
        let entries = vec![
            build_mish_entry(0x0000_0001, 0, 512, 0x28, 512 * 512),
            build_mish_entry(0x0000_0000, 512, 256, 0, 0),
            build_mish_entry(0xFFFF_FFFF, 768, 0, 0, 0),
        ];
        let table = build_mish_table(&entries, 768);
        let mut segments = SegmentList::new();
        append_mish_table(&table, &mut segments).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments.total_mapped_size(), 768 * 512);
    }

    #[test]
    fn rejects_mixed_compression_methods() {
        let entries = vec![
            build_mish_entry(0x8000_0005, 0, 512, 0x28, 100),
            build_mish_entry(0x8000_0006, 512, 512, 0x200, 100),
            build_mish_entry(0xFFFF_FFFF, 1024, 0, 0, 0),
        ];
        let table = build_mish_table(&entries, 1024);
        let mut segments = SegmentList::new();
        assert!(append_mish_table(&table, &mut segments).is_err());
    }

    #[test]
    fn rejects_missing_terminator() {
        let entries = vec![build_mish_entry(0x0000_0001, 0, 512, 0x28, 512 * 512)];
        let table = build_mish_table(&entries, 512);
        let mut segments = SegmentList::new();
        assert!(append_mish_table(&table, &mut segments).is_err());
    }
}
