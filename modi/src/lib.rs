//! modi - random-access reader for Apple Mac OS Disk Image containers
//!
//! Reads sparse-image (`.sparseimage`), sparse-bundle (`.sparsebundle`),
//! UDIF (`.dmg`), and raw disk images through one uniform handle: open a
//! source, then `read`/`seek`/`tell` against its logical media exactly as
//! if it were the decompressed, defragmented whole.
//!
//! # Supported containers
//!
//! - Sparse-image: fixed header + band table, bands stored contiguously
//!   after a 4096-byte prefix.
//! - Sparse-bundle: `Info.plist` + a `bands/` directory of per-band files,
//!   with missing bands read back as zero-filled.
//! - UDIF: `koly` trailer + XML resource-fork plist + `mish` block tables,
//!   compressed with ADC, zlib/DEFLATE, BZIP2, LZFSE, or LZMA.
//! - Raw: any other file, read back verbatim.
//!
//! # Example
//!
//! ```no_run
//! use modi::{Handle, Whence};
//!
//! fn main() -> modi::Result<()> {
//!     let mut handle = Handle::new();
//!     handle.open("image.dmg")?;
//!
//!     println!("{:?}, {} bytes", handle.image_type()?, handle.media_size()?);
//!
//!     let mut buf = [0u8; 4096];
//!     handle.seek(Whence::Start(0))?;
//!     handle.read(&mut buf)?;
//!
//!     handle.close()?;
//!     Ok(())
//! }
//! ```

pub mod bit_stream;
pub mod cache;
pub mod codec;
pub mod codec_adc;
pub mod codec_bzip2;
pub mod codec_deflate;
pub mod codec_lzfse;
pub mod codec_lzma;
pub mod error;
pub mod handle;
pub mod huffman;
pub mod io;
pub mod segment;
pub mod sparse_bundle;
pub mod sparse_image;
pub mod udif;

pub use codec::CompressionMethod;
pub use error::{CompressionError, ModiError, Result};
pub use handle::{DebugSink, Handle, HandleOptions, ImageType, Whence};
pub use io::Io;
pub use segment::{Segment, SegmentFlags, SegmentList};
