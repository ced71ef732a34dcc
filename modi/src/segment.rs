//! Segment list (C5): the unified logical-to-physical mapping element
//! that replaces the source's separate band-table and block-table
//! traversal with a single ordered list inspected by the read loop.

use crate::codec::CompressionMethod;
use crate::error::{ModiError, Result};

/// How a segment's bytes are produced on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentFlags {
    /// Reads as all-zero bytes; no underlying storage is consulted.
    Sparse,
    /// Bytes are read verbatim from the physical file.
    None,
    /// Bytes are produced by decompressing `phys_size` bytes at
    /// `phys_offset` through the segment's image-wide compression method.
    Compressed,
}

/// One contiguous run of logical media backed by one physical source.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub mapped_offset: u64,
    pub mapped_size: u64,
    pub phys_file_index: u32,
    pub phys_offset: u64,
    pub phys_size: u64,
    pub flags: SegmentFlags,
}

/// Ordered, contiguous list of segments covering `[0, total_mapped_size())`.
#[derive(Debug, Default)]
pub struct SegmentList {
    segments: Vec<Segment>,
    compression_method: Option<CompressionMethod>,
}

impl SegmentList {
    pub fn new() -> Self {
        SegmentList {
            segments: Vec::new(),
            compression_method: None,
        }
    }

    /// Appends a segment immediately after the current end of coverage.
    pub fn append(
        &mut self,
        phys_file_index: u32,
        phys_offset: u64,
        phys_size: u64,
        mapped_size: u64,
        flags: SegmentFlags,
    ) {
        let mapped_offset = self.total_mapped_size();
        self.segments.push(Segment {
            mapped_offset,
            mapped_size,
            phys_file_index,
            phys_offset,
            phys_size,
            flags,
        });
    }

    /// Records (or checks) the single compression method shared by every
    /// compressed segment in the image. A mismatch with a previously
    /// recorded method is the "mixed codec" failure from the container
    /// design — callers surface this as `UnsupportedFormat`.
    pub fn set_or_check_compression_method(&mut self, method: CompressionMethod) -> Result<()> {
        match self.compression_method {
            None => {
                self.compression_method = Some(method);
                Ok(())
            }
            Some(existing) if existing == method => Ok(()),
            Some(_) => Err(ModiError::UnsupportedFormat(
                "image mixes more than one compression method across compressed blocks".into(),
            )),
        }
    }

    pub fn compression_method(&self) -> Option<CompressionMethod> {
        self.compression_method
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, index: usize) -> &Segment {
        &self.segments[index]
    }

    /// Removes the final segment entirely.
    pub fn pop_last(&mut self) {
        self.segments.pop();
    }

    /// Shrinks the final segment's mapped (and, for uncompressed
    /// segments, physical) size by `amount`, used to trim a sparse-image
    /// or sparse-bundle's last band down to the declared media size.
    pub fn shrink_last(&mut self, amount: u64) {
        if let Some(last) = self.segments.last_mut() {
            last.mapped_size -= amount;
            if last.flags != SegmentFlags::Sparse {
                last.phys_size = last.phys_size.saturating_sub(amount);
            }
        }
    }

    pub fn total_mapped_size(&self) -> u64 {
        self.segments
            .last()
            .map(|s| s.mapped_offset + s.mapped_size)
            .unwrap_or(0)
    }

    /// Binary search by `mapped_offset`: returns the index of the segment
    /// containing `logical_offset` and the intra-segment offset within it.
    pub fn resolve(&self, logical_offset: u64) -> Result<(usize, u64)> {
        if self.segments.is_empty() || logical_offset >= self.total_mapped_size() {
            return Err(ModiError::OutOfBounds(format!(
                "logical offset {logical_offset} is outside the mapped media"
            )));
        }
        let idx = match self
            .segments
            .binary_search_by_key(&logical_offset, |s| s.mapped_offset)
        {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let seg = &self.segments[idx];
        Ok((idx, logical_offset - seg.mapped_offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build() -> SegmentList {
        let mut list = SegmentList::new();
        list.append(0, 0, 100, 100, SegmentFlags::None);
        list.append(0, 0, 0, 50, SegmentFlags::Sparse);
        list.append(0, 200, 80, 80, SegmentFlags::Compressed);
        list
    }

    #[test]
    fn appends_are_contiguous() {
        let list = build();
        assert_eq!(list.total_mapped_size(), 230);
        assert_eq!(list.get(1).mapped_offset, 100);
        assert_eq!(list.get(2).mapped_offset, 150);
    }

    #[test]
    fn resolve_finds_containing_segment_and_intra_offset() {
        let list = build();
        let (idx, intra) = list.resolve(0).unwrap();
        assert_eq!(idx, 0);
        assert_eq!(intra, 0);

        let (idx, intra) = list.resolve(120).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(intra, 20);

        let (idx, intra) = list.resolve(229).unwrap();
        assert_eq!(idx, 2);
        assert_eq!(intra, 79);
    }

    #[test]
    fn resolve_rejects_offset_past_end() {
        let list = build();
        assert!(list.resolve(230).is_err());
    }

    #[test]
    fn mismatched_compression_methods_are_rejected() {
        let mut list = SegmentList::new();
        list.set_or_check_compression_method(CompressionMethod::Zlib)
            .unwrap();
        let err = list
            .set_or_check_compression_method(CompressionMethod::Bzip2)
            .unwrap_err();
        assert!(matches!(err, ModiError::UnsupportedFormat(_)));
    }
}
