use std::{fs::File, io};

use snafu::ResultExt;

use super::{Advice, DestroyError, MapBackend, Region};
use crate::{
    descriptor::{MapSource, MappingDescriptor},
    error::{MappingFailedSnafu, Result},
};

/// Copies the requested span into an owned buffer instead of mapping it.
///
/// Used where no mapping facility exists, and usable anywhere a file lives
/// on something that cannot be mapped. Advice is accepted and ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadBackend;

impl MapBackend for ReadBackend {
    fn create(&self, desc: &MappingDescriptor) -> Result<Region> {
        let offset = desc.page_start();
        let len = desc.map_len();

        let mut region = Region::zeroed(len);
        if let MapSource::File(file) = desc.source() {
            read_exact_at(file, region.as_mut_slice(), offset)
                .context(MappingFailedSnafu { offset, len })?;
        }
        Ok(region)
    }

    fn destroy(&self, region: Region) -> Result<(), DestroyError> {
        drop(region);
        Ok(())
    }

    fn advise(&self, _region: &Region, _advice: Advice) -> Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::read_exact_at(file, buf, offset)
}

#[cfg(windows)]
fn read_exact_at(
    file: &File,
    mut buf: &mut [u8],
    mut offset: u64,
) -> io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                let rest = buf;
                buf = &mut rest[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn read_exact_at(
    mut file: &File,
    buf: &mut [u8],
    offset: u64,
) -> io::Result<()> {
    use std::io::{Read, Seek, SeekFrom};

    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}
