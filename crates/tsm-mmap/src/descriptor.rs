use std::{fs::File, sync::Arc};

use snafu::{OptionExt, ensure};

use crate::{
    error::{InvalidArgumentSnafu, Result},
    page::{align_down, page_size},
};

/// What a mapping is backed by.
///
/// The file is shared with whoever opened it; this crate never closes the
/// caller's handle.
#[derive(Debug, Clone)]
pub enum MapSource {
    File(Arc<File>),
    /// Zero-filled scratch pages with no file behind them.
    Anonymous,
}

impl From<Arc<File>> for MapSource {
    fn from(file: Arc<File>) -> Self {
        MapSource::File(file)
    }
}

impl From<File> for MapSource {
    fn from(file: File) -> Self {
        MapSource::File(Arc::new(file))
    }
}

/// Page-aligned parameters for mapping `len` bytes at `offset`.
///
/// Mappings must start on a page boundary, so the mapped span is widened at
/// the front to `page_start` and the caller's bytes begin `page_delta` bytes
/// into it. Immutable once built; building one never touches the OS.
#[derive(Debug, Clone)]
pub struct MappingDescriptor {
    source: MapSource,
    page_start: u64,
    page_delta: usize,
    map_len: usize,
    len: usize,
}

impl MappingDescriptor {
    pub fn new(
        source: impl Into<MapSource>,
        offset: u64,
        len: usize,
    ) -> Result<Self> {
        Self::with_page_size(source, offset, len, page_size())
    }

    /// Scratch region of `len` zeroed bytes.
    pub fn anonymous(len: usize) -> Result<Self> {
        Self::new(MapSource::Anonymous, 0, len)
    }

    pub fn with_page_size(
        source: impl Into<MapSource>,
        offset: u64,
        len: usize,
        page_size: u64,
    ) -> Result<Self> {
        ensure!(
            len > 0,
            InvalidArgumentSnafu {
                reason: "mapping length must be greater than zero",
            }
        );
        ensure!(
            page_size > 0,
            InvalidArgumentSnafu {
                reason: "page size must be greater than zero",
            }
        );
        offset.checked_add(len as u64).context(InvalidArgumentSnafu {
            reason: format!("offset {offset} + length {len} overflows"),
        })?;

        let page_start = align_down(offset, page_size);
        // always < page_size, which itself fits in memory
        let page_delta = (offset - page_start) as usize;
        let map_len =
            len.checked_add(page_delta).context(InvalidArgumentSnafu {
                reason: format!("mapping length {len} too large"),
            })?;

        Ok(Self {
            source: source.into(),
            page_start,
            page_delta,
            map_len,
            len,
        })
    }

    pub fn source(&self) -> &MapSource {
        &self.source
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        matches!(self.source, MapSource::Anonymous)
    }

    /// Offset of the first mapped byte, on a page boundary.
    #[must_use]
    pub fn page_start(&self) -> u64 {
        self.page_start
    }

    /// Where the caller's bytes start within the mapped span.
    #[must_use]
    pub fn page_delta(&self) -> usize {
        self.page_delta
    }

    /// Total bytes that get mapped, `len + page_delta`.
    #[must_use]
    pub fn map_len(&self) -> usize {
        self.map_len
    }

    /// Logical length, i.e. the size of the view handed back.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Never true; zero lengths are rejected at construction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The offset the caller originally asked for.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.page_start + self.page_delta as u64
    }

    pub(crate) fn view_range(&self) -> std::ops::Range<usize> {
        self.page_delta..self.page_delta + self.len
    }
}
