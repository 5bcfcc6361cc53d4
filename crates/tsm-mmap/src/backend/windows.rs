use std::{
    fs::File,
    io,
    os::windows::io::{
        AsRawHandle, FromRawHandle, IntoRawHandle, OwnedHandle, RawHandle,
    },
    ptr,
};

use snafu::{IntoError, ResultExt};
use windows_sys::Win32::{
    Foundation::{CloseHandle, GENERIC_READ, HANDLE, INVALID_HANDLE_VALUE},
    Storage::FileSystem::{
        FILE_ATTRIBUTE_NORMAL, FILE_SHARE_DELETE, FILE_SHARE_READ,
        FILE_SHARE_WRITE, ReOpenFile,
    },
    System::Memory::{
        CreateFileMappingW, FILE_MAP_READ, MEMORY_MAPPED_VIEW_ADDRESS,
        MapViewOfFile, PAGE_READONLY, UnmapViewOfFile,
    },
};

use super::{Advice, DestroyError, MapBackend, MappingHandle, Region};
use crate::{
    descriptor::{MapSource, MappingDescriptor},
    error::{MappingFailedSnafu, MmapError, Result, UnmapFailedSnafu},
    registry::HandleRegistry,
};

/// Handles owning a mapped view, released together at unmap time.
struct NativeResources {
    mapping: OwnedHandle,
    file: File,
}

// UnmapViewOfFile only takes the base address, so the mapping object and the
// re-opened file have to be found again from it.
static REGISTRY: HandleRegistry<NativeResources> = HandleRegistry::new();

/// File-mapping object backed views.
///
/// Anonymous mappings are not mapped at all; they get a zeroed owned buffer.
/// There is no advice facility, so both hints succeed without effect.
#[derive(Debug, Default, Clone, Copy)]
pub struct HandleRegistryBackend;

impl HandleRegistryBackend {
    /// Whether the view at `addr` still has live native handles.
    #[must_use]
    pub fn is_registered(addr: usize) -> bool {
        REGISTRY.contains(addr)
    }
}

/// Open a second handle to `file` that tolerates other writers and deleters.
fn reopen_shared(file: &File) -> io::Result<File> {
    let h = unsafe {
        ReOpenFile(
            file.as_raw_handle() as HANDLE,
            GENERIC_READ,
            FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
            FILE_ATTRIBUTE_NORMAL,
        )
    };
    if h == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: ReOpenFile handed us a fresh handle we now own
    Ok(unsafe { File::from_raw_handle(h as RawHandle) })
}

fn close_handle(handle: OwnedHandle, len: usize) -> Result<()> {
    let raw = handle.into_raw_handle();
    if unsafe { CloseHandle(raw as HANDLE) } == 0 {
        return Err(
            UnmapFailedSnafu { len }.into_error(io::Error::last_os_error())
        );
    }
    Ok(())
}

fn create_mapping_object(file: &File, size: u64) -> io::Result<OwnedHandle> {
    let (size_hi, size_lo) = split_u64(size);
    let raw = unsafe {
        CreateFileMappingW(
            file.as_raw_handle() as HANDLE,
            ptr::null(),
            PAGE_READONLY,
            size_hi,
            size_lo,
            ptr::null(),
        )
    };
    if raw.is_null() {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: non-null handle returned by CreateFileMappingW
    Ok(unsafe { OwnedHandle::from_raw_handle(raw as RawHandle) })
}

/// Record the handles behind the view at `addr`.
///
/// An entry already present belongs to a view the OS has since unmapped and
/// handed the address out again, so its handles are closed here.
fn register(addr: usize, len: usize, resources: NativeResources) {
    let Some(stale) = REGISTRY.insert(addr, resources) else {
        return;
    };
    let NativeResources { mapping, file } = stale;
    for h in [mapping, OwnedHandle::from(file)] {
        if let Err(e) = close_handle(h, len) {
            tracing::warn!("closing stale handles for {addr:#x} failed: {e}");
        }
    }
}

fn split_u64(n: u64) -> (u32, u32) {
    ((n >> 32) as u32, (n & 0xffff_ffff) as u32)
}

impl MapBackend for HandleRegistryBackend {
    fn create(&self, desc: &MappingDescriptor) -> Result<Region> {
        let offset = desc.page_start();
        let len = desc.map_len();

        let MapSource::File(file) = desc.source() else {
            return Ok(Region::zeroed(len));
        };

        let shared =
            reopen_shared(file).context(MappingFailedSnafu { offset, len })?;

        // the mapping object has to reach the end of the view, not just its
        // length
        let mapping = create_mapping_object(&shared, offset + len as u64)
            .context(MappingFailedSnafu { offset, len })?;

        let (off_hi, off_lo) = split_u64(offset);
        let view = unsafe {
            MapViewOfFile(
                mapping.as_raw_handle() as HANDLE,
                FILE_MAP_READ,
                off_hi,
                off_lo,
                len,
            )
        };
        // SAFETY: MapViewOfFile mapped `len` bytes or returned null
        let Some(handle) =
            (unsafe { MappingHandle::from_raw(view.Value, len) })
        else {
            return Err(MappingFailedSnafu { offset, len }
                .into_error(io::Error::last_os_error()));
        };

        register(
            handle.addr(),
            len,
            NativeResources {
                mapping,
                file: shared,
            },
        );
        tracing::trace!(
            "registered view {:#x} ({} bytes)",
            handle.addr(),
            len
        );

        Ok(Region::Mapped(handle))
    }

    fn destroy(&self, region: Region) -> Result<(), DestroyError> {
        let Region::Mapped(handle) = region else {
            return Ok(());
        };
        let len = handle.len();
        let addr = handle.addr();

        let view = MEMORY_MAPPED_VIEW_ADDRESS {
            Value: handle.as_ptr(),
        };
        if unsafe { UnmapViewOfFile(view) } == 0 {
            return Err(DestroyError {
                region: Some(Region::Mapped(handle)),
                source: UnmapFailedSnafu { len }
                    .into_error(io::Error::last_os_error()),
            });
        }

        // from here on the view is gone, so the region cannot be handed back
        let fail = |source: MmapError| DestroyError {
            region: None,
            source,
        };
        let NativeResources { mapping, file } =
            REGISTRY.take(addr).map_err(fail)?;
        close_handle(mapping, len).map_err(fail)?;
        close_handle(OwnedHandle::from(file), len).map_err(fail)?;

        tracing::trace!("released view {:#x}", addr);
        Ok(())
    }

    fn advise(&self, _region: &Region, _advice: Advice) -> Result<()> {
        Ok(())
    }
}
