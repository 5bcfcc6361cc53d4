use snafu::{Backtrace, Snafu};

use crate::backend::Advice;

pub type Result<T, E = MmapError> = std::result::Result<T, E>;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum MmapError {
    #[snafu(display("invalid argument: {reason}"))]
    InvalidArgument {
        reason: String,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(display(
        "failed to map {len} bytes at page offset {offset}: {source}"
    ))]
    MappingFailed {
        offset: u64,
        len: usize,
        source: std::io::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(display("failed to unmap {len} byte region: {source}"))]
    UnmapFailed {
        len: usize,
        source: std::io::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(display("kernel rejected {advice:?} advice: {source}"))]
    AdviseFailed {
        advice: Advice,
        source: std::io::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    // the native handles for this address can never be closed again
    #[snafu(display("unknown mapping base address {addr:#x}"))]
    UnknownMapping {
        addr: usize,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
}

impl MmapError {
    /// `true` for errors after which the mapping's native resources are lost
    /// for the rest of the process.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, MmapError::UnknownMapping { .. })
    }
}
