//! Reader core (C6): `Handle`, the single entry point that detects a
//! container's format, builds its segment list, and services
//! read/seek/tell/size.
//!
//! Detection order and the read loop below mirror the design exactly
//! (see the module-level walk-through), collapsing the source's separate
//! band-table and block-chunk traversal into one segment list inspected
//! by a single loop, per Design Note 2.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{DataBlockCache, DEFAULT_CAPACITY};
use crate::codec::{self, CompressionMethod};
use crate::error::{ModiError, Result};
use crate::io::Io;
use crate::segment::{SegmentFlags, SegmentList};
use crate::sparse_bundle::{self, SparseBundleManifest};
use crate::sparse_image::{self, SparseImageHeader};
use crate::udif::{self, UdifTrailer};

/// What a successfully opened `Handle` turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Raw,
    SparseImage,
    SparseBundle,
    UdifUncompressed,
    UdifCompressed,
}

/// A per-`Handle` trace sink, invoked with human-readable lines equivalent
/// to the reference implementation's verbose debug output (header fields,
/// band table entries, block-table entries). Replaces a process-wide
/// logger: nothing is emitted unless a caller supplies one.
pub type DebugSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Tunables accepted at open time: a small `Default`-able options struct
/// rather than a constructor with a long parameter list.
#[derive(Clone)]
pub struct HandleOptions {
    /// Whether to verify embedded codec checksums (zlib Adler-32, BZIP2
    /// CRC-32) while decompressing. Defaults to `true`.
    pub verify_checksums: bool,
    /// Cap on simultaneously open band-file handles for a sparse-bundle
    /// pool. `None` uses [`crate::io::DEFAULT_MAX_OPEN_HANDLES`].
    pub max_open_handles: Option<usize>,
    /// Capacity of the decoded-block LRU cache. `None` uses
    /// [`DEFAULT_CAPACITY`].
    pub cache_capacity: Option<usize>,
    /// Optional trace sink; see [`DebugSink`].
    pub debug_sink: Option<DebugSink>,
}

impl Default for HandleOptions {
    fn default() -> Self {
        HandleOptions {
            verify_checksums: true,
            max_open_handles: None,
            cache_capacity: None,
            debug_sink: None,
        }
    }
}

/// Absolute/relative/end-relative seek, matching `std::io::SeekFrom`'s
/// shape without requiring `Handle` to implement `Seek` itself (it is
/// not generic over an inner reader — it owns its own `Io` facade
/// instead).
#[derive(Debug, Clone, Copy)]
pub enum Whence {
    Start(u64),
    Current(i64),
    End(i64),
}

enum State {
    New,
    Opened(OpenedState),
    Closed,
}

struct OpenedState {
    image_type: ImageType,
    io: Io,
    segments: SegmentList,
    media_size: u64,
    cache: DataBlockCache,
    current_offset: u64,
    abort: bool,
    verify_checksums: bool,
    debug_sink: Option<DebugSink>,
}

impl OpenedState {
    fn trace(&self, line: impl Fn() -> String) {
        if let Some(sink) = &self.debug_sink {
            sink(&line());
        }
    }
}

pub struct Handle {
    state: State,
}

impl Default for Handle {
    fn default() -> Self {
        Self::new()
    }
}

impl Handle {
    pub fn new() -> Self {
        Handle { state: State::New }
    }

    pub fn image_type(&self) -> Result<ImageType> {
        match &self.state {
            State::Opened(s) => Ok(s.image_type),
            _ => Err(ModiError::NotOpen),
        }
    }

    pub fn media_size(&self) -> Result<u64> {
        match &self.state {
            State::Opened(s) => Ok(s.media_size),
            _ => Err(ModiError::NotOpen),
        }
    }

    pub fn tell(&self) -> Result<u64> {
        match &self.state {
            State::Opened(s) => Ok(s.current_offset),
            _ => Err(ModiError::NotOpen),
        }
    }

    pub fn signal_abort(&mut self) -> Result<()> {
        match &mut self.state {
            State::Opened(s) => {
                s.abort = true;
                Ok(())
            }
            _ => Err(ModiError::NotOpen),
        }
    }

    pub fn set_max_open_handles(&mut self, n: usize) -> Result<()> {
        match &mut self.state {
            State::Opened(s) => {
                s.io.set_max_open_handles(n);
                Ok(())
            }
            _ => Err(ModiError::NotOpen),
        }
    }

    pub fn seek(&mut self, whence: Whence) -> Result<u64> {
        let state = match &mut self.state {
            State::Opened(s) => s,
            _ => return Err(ModiError::NotOpen),
        };
        let new_offset = match whence {
            Whence::Start(off) => off as i128,
            Whence::Current(delta) => state.current_offset as i128 + delta as i128,
            Whence::End(delta) => state.media_size as i128 + delta as i128,
        };
        if new_offset < 0 {
            return Err(ModiError::InvalidArgument(
                "seek would produce a negative offset".into(),
            ));
        }
        state.current_offset = new_offset as u64;
        Ok(state.current_offset)
    }

    pub fn close(&mut self) -> Result<()> {
        if let State::Opened(mut s) = std::mem::replace(&mut self.state, State::Closed) {
            s.io.close();
        }
        self.state = State::Closed;
        Ok(())
    }

    /// Opens `source` (a file path, or a directory for a sparse-bundle)
    /// with default options (checksum verification enabled, no trace
    /// sink), detecting the container format per the order below. On any
    /// failure the Handle is left in `New` — no partial state survives.
    pub fn open(&mut self, source: impl AsRef<Path>) -> Result<()> {
        self.open_with_options(source, HandleOptions::default())
    }

    /// Opens `source` the same way [`Handle::open`] does, but with
    /// caller-supplied tunables (checksum verification, pool sizing,
    /// cache capacity, and a trace sink).
    pub fn open_with_options(
        &mut self,
        source: impl AsRef<Path>,
        options: HandleOptions,
    ) -> Result<()> {
        if !matches!(self.state, State::New) {
            return Err(ModiError::AlreadyOpen);
        }
        match self.open_inner(source.as_ref(), &options) {
            Ok(opened) => {
                self.state = State::Opened(opened);
                Ok(())
            }
            Err(e) => {
                self.state = State::New;
                Err(e)
            }
        }
    }

    fn open_inner(&mut self, source: &Path, options: &HandleOptions) -> Result<OpenedState> {
        let metadata = fs::metadata(source)?;
        let is_directory = metadata.is_dir();
        let file_size = if is_directory { 0 } else { metadata.len() };

        if !is_directory && file_size >= 512 {
            if let Some(opened) = Self::try_open_udif(source, file_size, options)? {
                return Ok(opened);
            }
        }
        if !is_directory && file_size >= 4096 {
            if let Some(opened) = Self::try_open_sparse_image(source, file_size, options)? {
                return Ok(opened);
            }
        }
        if is_directory || Self::starts_with_xml(source)? {
            return Self::open_sparse_bundle(source, options);
        }
        Self::open_raw(source, file_size, options)
    }

    fn starts_with_xml(source: &Path) -> Result<bool> {
        let bytes = match fs::read(source) {
            Ok(b) => b,
            Err(_) => return Ok(false),
        };
        Ok(bytes.len() >= 5 && &bytes[..5] == sparse_bundle::XML_PREFIX)
    }

    fn try_open_udif(
        source: &Path,
        file_size: u64,
        options: &HandleOptions,
    ) -> Result<Option<OpenedState>> {
        let mut io = Io::open_single(source)?;
        let mut trailer_bytes = vec![0u8; udif::TRAILER_SIZE];
        io.read_at(0, file_size - udif::TRAILER_SIZE as u64, &mut trailer_bytes)?;

        // Only a signature mismatch means "this isn't UDIF, keep probing
        // other formats" — once the `koly` signature is present, any
        // further parse failure (e.g. number_of_segments > 1) is a real
        // structural error in a UDIF image and must propagate rather than
        // silently falling through to sparse-image/raw detection.
        if trailer_bytes.len() < 4 || &trailer_bytes[0..4] != udif::KOLY_SIGNATURE {
            return Ok(None);
        }
        let trailer = udif::parse_trailer(&trailer_bytes)?;
        if let Some(sink) = &options.debug_sink {
            sink(&format!(
                "udif: trailer format_version={} data_fork_size={} xml_plist_size={}",
                trailer.format_version, trailer.data_fork_size, trailer.xml_plist_size
            ));
            if trailer.format_version != 4 {
                sink(&format!(
                    "udif: unexpected trailer format_version {} (advisory, proceeding)",
                    trailer.format_version
                ));
            }
        }

        let mut segments = SegmentList::new();
        if trailer.xml_plist_size == 0 {
            segments.append(
                0,
                trailer.data_fork_offset,
                trailer.data_fork_size,
                trailer.data_fork_size,
                SegmentFlags::None,
            );
        } else {
            let mut plist_bytes = vec![0u8; trailer.xml_plist_size as usize];
            io.read_at(0, trailer.xml_plist_offset, &mut plist_bytes)?;
            let mish_blobs = udif::blkx_data_blobs(&plist_bytes)?;
            for blob in &mish_blobs {
                udif::append_mish_table(blob, &mut segments)?;
            }
            if let Some(sink) = &options.debug_sink {
                sink(&format!(
                    "udif: {} blkx table(s), {} segment(s), compression={:?}",
                    mish_blobs.len(),
                    segments.len(),
                    segments.compression_method()
                ));
            }
        }

        let image_type = if segments.compression_method().is_some() {
            ImageType::UdifCompressed
        } else {
            ImageType::UdifUncompressed
        };
        let media_size = segments.total_mapped_size();

        Ok(Some(OpenedState {
            image_type,
            io,
            segments,
            media_size,
            cache: DataBlockCache::new(options.cache_capacity.unwrap_or(DEFAULT_CAPACITY)),
            current_offset: 0,
            abort: false,
            verify_checksums: options.verify_checksums,
            debug_sink: options.debug_sink.clone(),
        }))
    }

    fn try_open_sparse_image(
        source: &Path,
        file_size: u64,
        options: &HandleOptions,
    ) -> Result<Option<OpenedState>> {
        let mut io = Io::open_single(source)?;
        let mut prefix = [0u8; 4];
        io.read_at(0, 0, &mut prefix)?;
        if &prefix != sparse_image::SIGNATURE {
            return Ok(None);
        }

        // Bands start at a fixed file offset of 4096, so the header plus
        // its band table always fits in the bytes before that boundary.
        let read_len = 4096.min(file_size) as usize;
        let mut header_bytes = vec![0u8; read_len];
        io.read_at(0, 0, &mut header_bytes)?;
        let header: SparseImageHeader = sparse_image::parse_header(&header_bytes)?;
        if let Some(sink) = &options.debug_sink {
            sink(&format!(
                "sparse-image: sectors_per_band={} number_of_sectors={} number_of_bands={}",
                header.sectors_per_band, header.number_of_sectors, header.number_of_bands
            ));
        }

        let mut segments = SegmentList::new();
        for slot in 0..header.number_of_bands {
            let table_index = header.band_references[slot as usize];
            let band_bytes = header.sectors_per_band as u64 * 512;
            if table_index == u32::MAX {
                segments.append(0, 0, 0, band_bytes, SegmentFlags::Sparse);
                if let Some(sink) = &options.debug_sink {
                    sink(&format!("sparse-image: band {slot:03} (sparse)"));
                }
            } else {
                let offset = header.band_offset(table_index);
                segments.append(0, offset, band_bytes, band_bytes, SegmentFlags::None);
                if let Some(sink) = &options.debug_sink {
                    sink(&format!(
                        "sparse-image: band {slot:03} (data offset: {offset:#010x})"
                    ));
                }
            }
        }
        // The last band may be short of a full `sectors_per_band` worth
        // of sectors; trim mapped coverage down to the declared media
        // size rather than over-reporting zero-padding.
        let declared_media_size = header.media_size();
        Self::truncate_to(&mut segments, declared_media_size);

        Ok(Some(OpenedState {
            image_type: ImageType::SparseImage,
            io,
            media_size: segments.total_mapped_size(),
            segments,
            cache: DataBlockCache::new(options.cache_capacity.unwrap_or(DEFAULT_CAPACITY)),
            current_offset: 0,
            abort: false,
            verify_checksums: options.verify_checksums,
            debug_sink: options.debug_sink.clone(),
        }))
    }

    fn open_sparse_bundle(source: &Path, options: &HandleOptions) -> Result<OpenedState> {
        let info_plist_path = source.join("Info.plist");
        let plist_bytes = fs::read(&info_plist_path)?;
        let manifest: SparseBundleManifest = sparse_bundle::parse_manifest(&plist_bytes)?;
        if let Some(sink) = &options.debug_sink {
            sink(&format!(
                "sparse-bundle: band_data_size={} media_size={} number_of_bands={}",
                manifest.band_data_size, manifest.media_size, manifest.number_of_bands
            ));
            if let Some(unrecognized) = &manifest.unrecognized_bundle_type {
                sink(&format!(
                    "sparse-bundle: unrecognized diskimage-bundle-type {unrecognized:?} (advisory, proceeding)"
                ));
            }
        }

        let bands_dir = source.join("bands");
        let mut io = Io::open_pool(
            manifest.number_of_bands as usize,
            options
                .max_open_handles
                .unwrap_or(crate::io::DEFAULT_MAX_OPEN_HANDLES),
        );
        let mut segments = SegmentList::new();

        if let Io::Pool(pool) = &mut io {
            for slot in 0..manifest.number_of_bands {
                let band_path = bands_dir.join(SparseBundleManifest::band_file_name(slot));
                if band_path.is_file() {
                    let band_len = fs::metadata(&band_path)?.len();
                    pool.attach(slot as usize, band_path)?;

                    let remaining_in_media = manifest
                        .media_size
                        .saturating_sub(slot * manifest.band_data_size);
                    let full_band = manifest.band_data_size.min(remaining_in_media);
                    let present = band_len.min(full_band);
                    if present > 0 {
                        segments.append(slot as u32, 0, present, present, SegmentFlags::None);
                    }
                    let shortfall = full_band - present;
                    if shortfall > 0 {
                        segments.append(slot as u32, 0, 0, shortfall, SegmentFlags::Sparse);
                    }
                } else {
                    pool.attach_none(slot as usize)?;
                    let remaining_in_media = manifest
                        .media_size
                        .saturating_sub(slot * manifest.band_data_size);
                    let full_band = manifest.band_data_size.min(remaining_in_media);
                    segments.append(slot as u32, 0, 0, full_band, SegmentFlags::Sparse);
                }
            }
        }

        Ok(OpenedState {
            image_type: ImageType::SparseBundle,
            io,
            media_size: segments.total_mapped_size(),
            segments,
            cache: DataBlockCache::new(options.cache_capacity.unwrap_or(DEFAULT_CAPACITY)),
            current_offset: 0,
            abort: false,
            verify_checksums: options.verify_checksums,
            debug_sink: options.debug_sink.clone(),
        })
    }

    fn open_raw(source: &Path, file_size: u64, options: &HandleOptions) -> Result<OpenedState> {
        let io = Io::open_single(source)?;
        let mut segments = SegmentList::new();
        segments.append(0, 0, file_size, file_size, SegmentFlags::None);
        Ok(OpenedState {
            image_type: ImageType::Raw,
            io,
            media_size: file_size,
            segments,
            cache: DataBlockCache::new(options.cache_capacity.unwrap_or(DEFAULT_CAPACITY)),
            current_offset: 0,
            abort: false,
            verify_checksums: options.verify_checksums,
            debug_sink: options.debug_sink.clone(),
        })
    }

    /// Drops mapped coverage past `limit`, shrinking (but never growing)
    /// the final segment. Used when a sparse-image's last band only
    /// partially covers `sectors_per_band`.
    fn truncate_to(segments: &mut SegmentList, limit: u64) {
        while segments.total_mapped_size() > limit && !segments.is_empty() {
            let last_index = segments.len() - 1;
            let last = *segments.get(last_index);
            let overshoot = segments.total_mapped_size() - limit;
            if overshoot >= last.mapped_size {
                segments.pop_last();
            } else {
                segments.shrink_last(overshoot);
                break;
            }
        }
    }

    /// Reads up to `buf.len()` bytes starting at the current offset,
    /// advancing it by the number of bytes actually served. Returns a
    /// short read once `media_size` is reached; never errors out after
    /// bytes have already been copied into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let state = match &mut self.state {
            State::Opened(s) => s,
            _ => return Err(ModiError::NotOpen),
        };
        if state.abort {
            return Err(ModiError::Cancelled);
        }

        let mut served = 0usize;
        while served < buf.len() && state.current_offset < state.media_size {
            let (segment_index, intra) = state.segments.resolve(state.current_offset)?;
            let segment = *state.segments.get(segment_index);
            let remaining_in_segment = segment.mapped_size - intra;
            let remaining_in_media = state.media_size - state.current_offset;
            let take = (buf.len() - served) as u64;
            let take = take.min(remaining_in_segment).min(remaining_in_media) as usize;

            match segment.flags {
                SegmentFlags::Sparse => {
                    buf[served..served + take].fill(0);
                }
                SegmentFlags::Compressed => {
                    if state.cache.get(segment_index).is_none() {
                        let mut compressed = vec![0u8; segment.phys_size as usize];
                        state.io.read_at(
                            segment.phys_file_index as usize,
                            segment.phys_offset,
                            &mut compressed,
                        )?;
                        let method = state.segments.compression_method().ok_or_else(|| {
                            ModiError::MalformedTable(
                                "compressed segment with no recorded compression method".into(),
                            )
                        })?;
                        let mut decoded = vec![0u8; segment.mapped_size as usize];
                        let n = codec::decompress(
                            method,
                            &compressed,
                            &mut decoded,
                            state.verify_checksums,
                        )?;
                        decoded.truncate(n.max(segment.mapped_size as usize).min(decoded.len()));
                        state.trace(|| {
                            format!(
                                "decoded segment {segment_index} ({method:?}, {} -> {} bytes)",
                                segment.phys_size,
                                decoded.len()
                            )
                        });
                        state.cache.insert(segment_index, decoded);
                    }
                    let decoded = state.cache.get(segment_index).unwrap();
                    let start = intra as usize;
                    buf[served..served + take].copy_from_slice(&decoded[start..start + take]);
                }
                SegmentFlags::None => {
                    state.io.read_at(
                        segment.phys_file_index as usize,
                        segment.phys_offset + intra,
                        &mut buf[served..served + take],
                    )?;
                }
            }

            served += take;
            state.current_offset += take as u64;
        }

        Ok(served)
    }

    /// Reads exactly the bytes at `[offset, offset + buf.len())`,
    /// independent of (and not advancing) the current seek position.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let saved = self.tell()?;
        self.seek(Whence::Start(offset))?;
        let result = self.read(buf);
        self.seek(Whence::Start(saved))?;
        result
    }

    #[allow(dead_code)]
    fn compression_method_hint(&self) -> Option<CompressionMethod> {
        match &self.state {
            State::Opened(s) => s.segments.compression_method(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn opens_raw_image_and_reads_tail_bytes() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(1_048_576).collect();
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();

        let mut handle = Handle::new();
        handle.open(tmp.path()).unwrap();
        assert_eq!(handle.image_type().unwrap(), ImageType::Raw);
        assert_eq!(handle.media_size().unwrap(), 1_048_576);

        let mut buf = [0u8; 16];
        let n = handle.read_at(1_048_570, &mut buf).unwrap();
        assert_eq!(n, 6);
        assert_eq!(&buf[..6], &data[1_048_570..1_048_576]);
    }

    #[test]
    fn seek_past_media_size_then_read_returns_zero() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[1u8; 16]).unwrap();
        tmp.flush().unwrap();

        let mut handle = Handle::new();
        handle.open(tmp.path()).unwrap();
        handle.seek(Whence::Start(100)).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(handle.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn negative_seek_fails() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[1u8; 16]).unwrap();
        tmp.flush().unwrap();

        let mut handle = Handle::new();
        handle.open(tmp.path()).unwrap();
        assert!(handle.seek(Whence::Current(-1)).is_err());
    }

    #[test]
    fn double_open_fails_with_already_open() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[1u8; 16]).unwrap();
        tmp.flush().unwrap();

        let mut handle = Handle::new();
        handle.open(tmp.path()).unwrap();
        assert!(matches!(handle.open(tmp.path()), Err(ModiError::AlreadyOpen)));
    }

    #[test]
    fn ops_before_open_fail_with_not_open() {
        let handle = Handle::new();
        assert!(matches!(handle.media_size(), Err(ModiError::NotOpen)));
    }

    #[test]
    fn open_with_options_invokes_debug_sink() {
        use std::sync::Mutex;

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[1u8; 16]).unwrap();
        tmp.flush().unwrap();

        let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = lines.clone();
        let options = HandleOptions {
            debug_sink: Some(Arc::new(move |line: &str| {
                sink_lines.lock().unwrap().push(line.to_string());
            })),
            ..HandleOptions::default()
        };

        let mut handle = Handle::new();
        handle.open_with_options(tmp.path(), options).unwrap();
        // A raw image has no parser trace points, but the sink must be
        // threaded through without panicking and the handle must open.
        assert_eq!(handle.image_type().unwrap(), ImageType::Raw);
        drop(handle);
        assert!(lines.lock().unwrap().is_empty());
    }

    #[test]
    fn default_options_verify_checksums() {
        assert!(HandleOptions::default().verify_checksums);
    }

    #[test]
    fn multi_segment_udif_trailer_surfaces_unsupported_format() {
        use byteorder::{BigEndian, WriteBytesExt};

        let mut trailer = Vec::new();
        trailer.extend_from_slice(crate::udif::KOLY_SIGNATURE);
        trailer.write_u32::<BigEndian>(4).unwrap(); // format_version
        trailer.write_u32::<BigEndian>(512).unwrap();
        trailer.write_u32::<BigEndian>(0).unwrap(); // flags
        trailer.write_u64::<BigEndian>(0).unwrap(); // unknown @16
        trailer.write_u64::<BigEndian>(0).unwrap(); // data_fork_offset
        trailer.write_u64::<BigEndian>(16).unwrap(); // data_fork_size
        trailer.write_u64::<BigEndian>(0).unwrap(); // resource_fork_offset
        trailer.write_u64::<BigEndian>(0).unwrap(); // resource_fork_size
        trailer.write_u32::<BigEndian>(0).unwrap(); // unknown @56
        trailer.write_u32::<BigEndian>(2).unwrap(); // number_of_segments (invalid)
        trailer.resize(512, 0);

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&trailer).unwrap();
        tmp.flush().unwrap();

        let mut handle = Handle::new();
        let err = handle.open(tmp.path()).unwrap_err();
        assert!(matches!(err, ModiError::UnsupportedFormat(_)));
    }
}
