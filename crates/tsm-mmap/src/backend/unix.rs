use std::{io, os::fd::AsFd, ptr};

use rustix::mm::{self, MapFlags, ProtFlags};
use snafu::{IntoError, ResultExt};

use super::{Advice, DestroyError, MapBackend, MappingHandle, Region};
use crate::{
    descriptor::{MapSource, MappingDescriptor},
    error::{
        AdviseFailedSnafu, MappingFailedSnafu, Result, UnmapFailedSnafu,
    },
};

/// `mmap(2)` backed mappings.
///
/// Files are mapped read-only and shared; anonymous regions are private and
/// writable.
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixBackend;

impl MapBackend for PosixBackend {
    fn create(&self, desc: &MappingDescriptor) -> Result<Region> {
        let offset = desc.page_start();
        let len = desc.map_len();

        let raw = match desc.source() {
            MapSource::File(file) => {
                // touching pages past EOF raises SIGBUS, so refuse up front
                let file_len = file
                    .metadata()
                    .context(MappingFailedSnafu { offset, len })?
                    .len();
                if offset + len as u64 > file_len {
                    return Err(MappingFailedSnafu { offset, len }.into_error(
                        io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("range ends past end of file ({file_len} bytes)"),
                        ),
                    ));
                }
                unsafe {
                    mm::mmap(
                        ptr::null_mut(),
                        len,
                        ProtFlags::READ,
                        MapFlags::SHARED,
                        file.as_fd(),
                        offset,
                    )
                }
            }
            MapSource::Anonymous => unsafe {
                mm::mmap_anonymous(
                    ptr::null_mut(),
                    len,
                    ProtFlags::READ | ProtFlags::WRITE,
                    MapFlags::PRIVATE,
                )
            },
        }
        .map_err(io::Error::from)
        .context(MappingFailedSnafu { offset, len })?;

        // SAFETY: mmap succeeded for `len` bytes and nothing else unmaps it
        let handle = unsafe { MappingHandle::from_raw(raw, len) }
            .ok_or_else(|| io::Error::other("mmap returned a null address"))
            .context(MappingFailedSnafu { offset, len })?;

        Ok(Region::Mapped(handle))
    }

    fn destroy(&self, region: Region) -> Result<(), DestroyError> {
        let Region::Mapped(handle) = region else {
            return Ok(());
        };

        match unsafe { mm::munmap(handle.as_ptr(), handle.len()) } {
            Ok(()) => Ok(()),
            Err(errno) => {
                let len = handle.len();
                Err(DestroyError {
                    region: Some(Region::Mapped(handle)),
                    source: UnmapFailedSnafu { len }
                        .into_error(io::Error::from(errno)),
                })
            }
        }
    }

    fn advise(&self, region: &Region, advice: Advice) -> Result<()> {
        let Region::Mapped(handle) = region else {
            return Ok(());
        };

        let flag = match advice {
            Advice::WillNeed => mm::Advice::WillNeed,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Advice::DontNeed => mm::Advice::LinuxDontNeed,
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            Advice::DontNeed => mm::Advice::DontNeed,
        };

        unsafe { mm::madvise(handle.as_ptr(), handle.len(), flag) }
            .map_err(io::Error::from)
            .context(AdviseFailedSnafu { advice })
    }
}
