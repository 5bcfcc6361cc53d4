#![allow(dead_code)]

use std::{
    fs::File,
    io::Write,
    sync::{
        Arc, Once,
        atomic::{AtomicUsize, Ordering},
    },
};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use tsm_mmap::{
    Advice, MapBackend, MappingDescriptor, PlatformBackend, Result,
    backend::{DestroyError, Region},
};

static TRACING: Once = Once::new();

/// Log to stderr, filtered by `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_target(false),
            )
            .try_init();
    });
}

/// A segment-like file whose byte at `i` is a function of `i`.
pub fn patterned_file(len: usize) -> (Arc<File>, Vec<u8>) {
    let data: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
    let mut f = tempfile::tempfile().expect("tempfile should be creatable");
    f.write_all(&data).expect("write should succeed");
    f.sync_all().expect("sync should succeed");
    (Arc::new(f), data)
}

/// Platform backend that counts the calls going through it.
#[derive(Default)]
pub struct CountingBackend {
    inner: PlatformBackend,
    pub creates: AtomicUsize,
    pub destroys: AtomicUsize,
    pub advises: AtomicUsize,
}

impl CountingBackend {
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }
}

impl MapBackend for CountingBackend {
    fn create(&self, desc: &MappingDescriptor) -> Result<Region> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create(desc)
    }

    fn destroy(&self, region: Region) -> Result<(), DestroyError> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        self.inner.destroy(region)
    }

    fn advise(&self, region: &Region, advice: Advice) -> Result<()> {
        self.advises.fetch_add(1, Ordering::SeqCst);
        self.inner.advise(region, advice)
    }
}
