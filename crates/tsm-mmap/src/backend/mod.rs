//! Platform mapping primitives.
//!
//! - Unix: `mmap`/`munmap`/`madvise` through rustix
//! - Windows: file-mapping objects, with a process-wide registry to find the
//!   handles that own a view again at unmap time
//! - anything else: positional reads into an owned buffer

use std::{ffi::c_void, ptr::NonNull};

use crate::{descriptor::MappingDescriptor, error::MmapError, error::Result};

pub mod heap;
#[cfg(unix)]
pub mod unix;
#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub type PlatformBackend = unix::PosixBackend;
#[cfg(windows)]
pub type PlatformBackend = windows::HandleRegistryBackend;
#[cfg(not(any(unix, windows)))]
pub type PlatformBackend = heap::ReadBackend;

/// Expected access pattern passed on to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    WillNeed,
    DontNeed,
}

/// Base address and length of a live OS mapping.
///
/// Returned by [`MapBackend::create`] and handed back to
/// [`MapBackend::destroy`]; the address doubles as the key for native
/// resources that cannot be recovered from the pointer alone.
#[derive(Debug, PartialEq, Eq)]
pub struct MappingHandle {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the handle is the sole owner of the mapping it describes, and the
// mapped memory is not tied to the thread that created it.
unsafe impl Send for MappingHandle {}
unsafe impl Sync for MappingHandle {}

impl MappingHandle {
    /// Returns `None` for a null base.
    ///
    /// # Safety
    ///
    /// `base` must point to a live mapping of at least `len` readable bytes
    /// that stays mapped until the handle is passed to `destroy`.
    pub unsafe fn from_raw(base: *mut c_void, len: usize) -> Option<Self> {
        NonNull::new(base.cast::<u8>()).map(|base| Self { base, len })
    }

    #[must_use]
    pub fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[must_use]
    pub fn as_ptr(&self) -> *mut c_void {
        self.base.as_ptr().cast()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Materialized bytes of a descriptor: the whole `map_len` span.
#[derive(Debug)]
pub enum Region {
    Mapped(MappingHandle),
    /// Zeroed or read-in memory owned by the process, no OS mapping.
    Owned(Box<[u8]>),
}

impl Region {
    pub(crate) fn zeroed(len: usize) -> Self {
        Region::Owned(vec![0u8; len].into_boxed_slice())
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Region::Mapped(handle) => unsafe {
                std::slice::from_raw_parts(handle.base.as_ptr(), handle.len)
            },
            Region::Owned(buf) => buf,
        }
    }

    /// Only valid for anonymous regions, which are always mapped writable.
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Region::Mapped(handle) => unsafe {
                std::slice::from_raw_parts_mut(handle.base.as_ptr(), handle.len)
            },
            Region::Owned(buf) => buf,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Region::Mapped(handle) => handle.len,
            Region::Owned(buf) => buf.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A failed [`MapBackend::destroy`].
#[derive(Debug)]
pub struct DestroyError {
    /// Given back when the region is still intact so release can be retried.
    pub region: Option<Region>,
    pub source: MmapError,
}

pub trait MapBackend: Send + Sync {
    /// Map `desc.map_len()` bytes starting at `desc.page_start()`.
    fn create(&self, desc: &MappingDescriptor) -> Result<Region>;

    /// Tear down the whole region created by [`MapBackend::create`].
    fn destroy(&self, region: Region) -> Result<(), DestroyError>;

    fn advise(&self, region: &Region, advice: Advice) -> Result<()>;
}

impl<B: MapBackend + ?Sized> MapBackend for std::sync::Arc<B> {
    fn create(&self, desc: &MappingDescriptor) -> Result<Region> {
        (**self).create(desc)
    }

    fn destroy(&self, region: Region) -> Result<(), DestroyError> {
        (**self).destroy(region)
    }

    fn advise(&self, region: &Region, advice: Advice) -> Result<()> {
        (**self).advise(region, advice)
    }
}
