//! File I/O facade (C7).
//!
//! Replaces the source's two-level `bfio` handle/pool split with a single
//! sum type: `Single` wraps the one file a sparse-image or UDIF image
//! reads from, `Pool` wraps the per-band files a sparse-bundle reads
//! from, keyed by band index with an LRU cap on simultaneously open
//! handles.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{ModiError, Result};

/// Default cap on simultaneously open band-file handles for a pool when
/// the caller doesn't request a specific limit.
pub const DEFAULT_MAX_OPEN_HANDLES: usize = 32;

/// A `read_at`-capable source. Implemented for `std::fs::File` via
/// seek-then-read since there is no portable positioned-read in std.
pub trait IoSource {
    fn size(&mut self) -> Result<u64>;
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

impl IoSource for File {
    fn size(&mut self) -> Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            match self.read(&mut buf[total..])? {
                0 => break,
                n => total += n,
            }
        }
        Ok(total)
    }
}

struct PoolSlot {
    path: Option<PathBuf>,
    handle: Option<File>,
    /// Whether this slot's handle, if any, was opened by the library
    /// (and so must be closed by `Handle::close`) versus handed in by
    /// the caller.
    created_in_library: bool,
}

/// A bounded pool of band-file handles, opened lazily and closed on an
/// LRU basis once `max_open_handles` is exceeded.
pub struct Pool {
    slots: Vec<PoolSlot>,
    max_open_handles: usize,
    /// Indices into `slots` with a currently-open handle, oldest first.
    open_order: Vec<usize>,
}

impl Pool {
    pub fn new(number_of_slots: usize, max_open_handles: usize) -> Self {
        let mut slots = Vec::with_capacity(number_of_slots);
        for _ in 0..number_of_slots {
            slots.push(PoolSlot {
                path: None,
                handle: None,
                created_in_library: false,
            });
        }
        Pool {
            slots,
            max_open_handles: max_open_handles.max(1),
            open_order: Vec::new(),
        }
    }

    /// Associates `index` with a path on disk. The file is opened lazily
    /// on first `read_at`/`size`.
    pub fn attach(&mut self, index: usize, path: impl Into<PathBuf>) -> Result<()> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| ModiError::OutOfBounds(format!("pool index {index} out of range")))?;
        slot.path = Some(path.into());
        Ok(())
    }

    /// Leaves `index` with no backing file (a fully sparse band).
    pub fn attach_none(&mut self, index: usize) -> Result<()> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| ModiError::OutOfBounds(format!("pool index {index} out of range")))?;
        slot.path = None;
        slot.handle = None;
        Ok(())
    }

    pub fn has_slot(&self, index: usize) -> Result<bool> {
        Ok(self
            .slots
            .get(index)
            .ok_or_else(|| ModiError::OutOfBounds(format!("pool index {index} out of range")))?
            .path
            .is_some())
    }

    pub fn set_max_open_handles(&mut self, n: usize) {
        self.max_open_handles = n.max(1);
        self.enforce_capacity();
    }

    fn enforce_capacity(&mut self) {
        while self.open_order.len() > self.max_open_handles {
            let victim = self.open_order.remove(0);
            self.slots[victim].handle = None;
        }
    }

    fn ensure_open(&mut self, index: usize) -> Result<()> {
        let needs_open = self.slots[index].handle.is_none();
        if needs_open {
            let path = self.slots[index].path.clone().ok_or_else(|| {
                ModiError::InvalidArgument(format!("pool index {index} has no attached file"))
            })?;
            let file = File::open(&path)?;
            self.slots[index].handle = Some(file);
            self.slots[index].created_in_library = true;
            self.open_order.push(index);
            self.enforce_capacity();
        } else if let Some(pos) = self.open_order.iter().position(|&i| i == index) {
            self.open_order.remove(pos);
            self.open_order.push(index);
        }
        Ok(())
    }

    pub fn size(&mut self, index: usize) -> Result<u64> {
        self.ensure_open(index)?;
        self.slots[index].handle.as_mut().unwrap().size()
    }

    pub fn read_at(&mut self, index: usize, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open(index)?;
        self.slots[index].handle.as_mut().unwrap().read_at(offset, buf)
    }

    /// Closes every handle this pool opened itself, leaving caller-handed
    /// handles untouched (there are none in the lazy-open design above,
    /// but the flag is kept to mirror the design's tracked-ownership
    /// rule for a future externally-supplied pool).
    pub fn close(&mut self) {
        for slot in &mut self.slots {
            if slot.created_in_library {
                slot.handle = None;
            }
        }
        self.open_order.clear();
    }
}

/// The File I/O facade: either one handle (sparse-image, UDIF) or a pool
/// of band handles (sparse-bundle).
pub enum Io {
    Single(Box<dyn IoSourceHandle>),
    Pool(Pool),
}

/// Object-safe wrapper so `Io::Single` can hold any `IoSource`.
pub trait IoSourceHandle: IoSource {}
impl<T: IoSource> IoSourceHandle for T {}

impl Io {
    pub fn open_single(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Io::Single(Box::new(file)))
    }

    pub fn single_from_handle(handle: File) -> Self {
        Io::Single(Box::new(handle))
    }

    pub fn open_pool(number_of_slots: usize, max_open_handles: usize) -> Self {
        Io::Pool(Pool::new(number_of_slots, max_open_handles))
    }

    pub fn size(&mut self, index: usize) -> Result<u64> {
        match self {
            Io::Single(handle) => handle.size(),
            Io::Pool(pool) => pool.size(index),
        }
    }

    pub fn read_at(&mut self, index: usize, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match self {
            Io::Single(handle) => handle.read_at(offset, buf),
            Io::Pool(pool) => pool.read_at(index, offset, buf),
        }
    }

    pub fn set_max_open_handles(&mut self, n: usize) {
        if let Io::Pool(pool) = self {
            pool.set_max_open_handles(n);
        }
    }

    pub fn close(&mut self) {
        if let Io::Pool(pool) = self {
            pool.close();
        }
    }
}
