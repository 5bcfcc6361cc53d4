//! Lazily materialized, page-aligned memory-mapped views of immutable
//! segment files.
//!
//! A [`MappingDescriptor`] records which bytes of a file (or of anonymous
//! scratch memory) a caller wants; a [`LazyMmap`] turns it into an OS mapping
//! the first time the bytes are asked for, and can release and remap it any
//! number of times afterwards.

pub mod backend;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod lazy;
pub mod page;
pub mod registry;

pub use backend::{Advice, MapBackend, PlatformBackend};
pub use config::{MapConfig, MapPolicy};
pub use descriptor::{MapSource, MappingDescriptor};
pub use error::{MmapError, Result};
pub use lazy::{ByteView, LazyMmap, Lifecycle};
pub use page::page_size;
