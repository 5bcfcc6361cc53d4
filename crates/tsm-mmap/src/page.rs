use std::sync::OnceLock;

static PAGE_SIZE: OnceLock<u64> = OnceLock::new();

/// Granularity that mapping offsets must be aligned to.
///
/// Queried from the OS once and treated as constant afterwards. On Windows
/// this is the allocation granularity rather than the VM page size, since
/// that is what `MapViewOfFile` requires of its offset.
#[inline]
#[must_use]
pub fn page_size() -> u64 {
    *PAGE_SIZE.get_or_init(query_page_size)
}

#[cfg(target_os = "linux")]
fn query_page_size() -> u64 {
    rustix::param::page_size() as u64
}

#[cfg(all(unix, not(target_os = "linux")))]
fn query_page_size() -> u64 {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    // sysconf only fails for unknown names
    if sz > 0 { sz as u64 } else { 4096 }
}

#[cfg(windows)]
fn query_page_size() -> u64 {
    use windows_sys::Win32::System::SystemInformation::{
        GetSystemInfo, SYSTEM_INFO,
    };

    let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
    unsafe { GetSystemInfo(&raw mut info) };
    u64::from(info.dwAllocationGranularity)
}

#[cfg(not(any(unix, windows)))]
fn query_page_size() -> u64 {
    4096
}

/// Round `offset` down to the enclosing multiple of `page`.
#[inline]
#[must_use]
pub const fn align_down(offset: u64, page: u64) -> u64 {
    (offset / page) * page
}
