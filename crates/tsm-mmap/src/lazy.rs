use std::io;

use parking_lot::{
    MappedRwLockReadGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use snafu::{IntoError, ensure};

use crate::{
    backend::{Advice, DestroyError, MapBackend, PlatformBackend, Region},
    config::{MapConfig, MapPolicy},
    descriptor::MappingDescriptor,
    error::{InvalidArgumentSnafu, Result, UnmapFailedSnafu},
};

/// Read-only view of the requested bytes.
///
/// Holds the mapping pinned: while any view is alive
/// [`LazyMmap::release`] refuses to unmap, so a view never outlives its
/// mapping.
pub type ByteView<'a> = MappedRwLockReadGuard<'a, [u8]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Unset,
    Mapped,
    Released,
}

#[derive(Debug)]
enum MapState {
    Unset,
    Mapped(Region),
    Released,
}

impl MapState {
    fn region(&self) -> Option<&Region> {
        match self {
            MapState::Mapped(region) => Some(region),
            _ => None,
        }
    }

    fn lifecycle(&self) -> Lifecycle {
        match self {
            MapState::Unset => Lifecycle::Unset,
            MapState::Mapped(_) => Lifecycle::Mapped,
            MapState::Released => Lifecycle::Released,
        }
    }
}

/// A [`MappingDescriptor`] that maps itself on first use.
///
/// Materialization happens at most once per `Unset`/`Released` period no
/// matter how many threads race on [`LazyMmap::bytes`]: the loser of the
/// race finds the winner's mapping and reuses it. [`LazyMmap::release`]
/// unmaps and a later `bytes()` maps again from scratch. Dropping the value
/// releases anything still mapped.
pub struct LazyMmap<B: MapBackend = PlatformBackend> {
    desc: MappingDescriptor,
    backend: B,
    config: MapConfig,
    state: RwLock<MapState>,
}

impl LazyMmap {
    /// Deferred mapping on the platform backend.
    #[must_use]
    pub fn new(desc: MappingDescriptor) -> Self {
        Self {
            desc,
            backend: PlatformBackend::default(),
            config: MapConfig::default(),
            state: RwLock::new(MapState::Unset),
        }
    }

    pub fn open(desc: MappingDescriptor, config: MapConfig) -> Result<Self> {
        Self::with_backend(desc, PlatformBackend::default(), config)
    }
}

impl<B: MapBackend> LazyMmap<B> {
    /// With [`MapPolicy::Eager`] the mapping is created before returning and
    /// its failure is returned here.
    pub fn with_backend(
        desc: MappingDescriptor,
        backend: B,
        config: MapConfig,
    ) -> Result<Self> {
        let mmap = Self {
            desc,
            backend,
            config,
            state: RwLock::new(MapState::Unset),
        };
        if config.policy == MapPolicy::Eager {
            materialize(&mmap.backend, &mmap.desc, &mut mmap.state.write())?;
        }
        Ok(mmap)
    }

    pub fn descriptor(&self) -> &MappingDescriptor {
        &self.desc
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> MapConfig {
        self.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.read_recursive().lifecycle()
    }

    pub fn is_mapped(&self) -> bool {
        self.lifecycle() == Lifecycle::Mapped
    }

    pub fn len(&self) -> usize {
        self.desc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.desc.is_empty()
    }

    /// The requested bytes, mapping them first if needed.
    pub fn bytes(&self) -> Result<ByteView<'_>> {
        let range = self.desc.view_range();
        let region = self.mapped_region()?;
        Ok(MappedRwLockReadGuard::map(region, move |r| &r.as_slice()[range]))
    }

    /// Writable view of an anonymous mapping. File-backed mappings are
    /// read-only and are rejected.
    ///
    /// Takes `&mut self`, so no read view can be alive at the same time.
    pub fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        ensure!(
            self.desc.is_anonymous(),
            InvalidArgumentSnafu {
                reason: "file-backed mappings are read-only",
            }
        );

        let state = self.state.get_mut();
        if state.region().is_none() {
            materialize(&self.backend, &self.desc, state)?;
        }
        let range = self.desc.view_range();
        match state {
            MapState::Mapped(region) => Ok(&mut region.as_mut_slice()[range]),
            _ => unreachable!("materialized through the same borrow"),
        }
    }

    /// Unmap the whole region. No-op unless mapped.
    ///
    /// Never waits: if a view is still alive (on any thread, including this
    /// one) or another thread is mapping right now, this returns
    /// `UnmapFailed` with [`io::ErrorKind::WouldBlock`] and leaves the state
    /// untouched. Any other failure also leaves the region mapped so the call
    /// can be retried, unless the backend lost track of it, in which case the
    /// error is fatal and the state is `Released`.
    pub fn release(&self) -> Result<()> {
        let Some(mut state) = self.state.try_write() else {
            tracing::debug!(
                "release of {} byte mapping deferred: views still outstanding",
                self.desc.map_len()
            );
            return Err(UnmapFailedSnafu {
                len: self.desc.map_len(),
            }
            .into_error(io::Error::new(
                io::ErrorKind::WouldBlock,
                "views still outstanding",
            )));
        };
        match std::mem::replace(&mut *state, MapState::Released) {
            MapState::Mapped(region) => match self.backend.destroy(region) {
                Ok(()) => {
                    tracing::debug!(
                        "unmapped {} bytes at page offset {}",
                        self.desc.map_len(),
                        self.desc.page_start()
                    );
                    Ok(())
                }
                Err(DestroyError {
                    region: Some(region),
                    source,
                }) => {
                    *state = MapState::Mapped(region);
                    Err(source)
                }
                Err(DestroyError {
                    region: None,
                    source,
                }) => {
                    tracing::error!("lost native resources on release: {source}");
                    Err(source)
                }
            },
            other => {
                *state = other;
                Ok(())
            }
        }
    }

    /// Hint that the bytes will be read soon.
    pub fn advise_will_need(&self) -> Result<()> {
        self.advise(Advice::WillNeed)
    }

    /// Hint that the pages can be dropped from the cache.
    pub fn advise_dont_need(&self) -> Result<()> {
        self.advise(Advice::DontNeed)
    }

    fn advise(&self, advice: Advice) -> Result<()> {
        if !self.config.advise {
            tracing::trace!("advice disabled, ignoring {advice:?}");
            return Ok(());
        }
        let region = self.mapped_region()?;
        tracing::trace!("advising {advice:?} on {} bytes", region.len());
        self.backend.advise(&region, advice).inspect_err(|e| {
            tracing::warn!("{advice:?} advice rejected: {e}");
        })
    }

    fn mapped_region(&self) -> Result<MappedRwLockReadGuard<'_, Region>> {
        // recursive so a thread already holding a view cannot deadlock
        // behind a queued release
        let state = self.state.read_recursive();
        match RwLockReadGuard::try_map(state, MapState::region) {
            Ok(region) => return Ok(region),
            Err(state) => drop(state),
        }

        let mut state = self.state.write();
        // another thread may have mapped it while we waited
        if state.region().is_none() {
            materialize(&self.backend, &self.desc, &mut state)?;
        }
        let state = RwLockWriteGuard::downgrade(state);
        Ok(RwLockReadGuard::map(state, |s| match s {
            MapState::Mapped(region) => region,
            _ => unreachable!("materialized under the same write guard"),
        }))
    }

}

fn materialize<B: MapBackend>(
    backend: &B,
    desc: &MappingDescriptor,
    state: &mut MapState,
) -> Result<()> {
    match backend.create(desc) {
        Ok(region) => {
            tracing::debug!(
                "mapped {} bytes at page offset {} (anonymous: {})",
                desc.map_len(),
                desc.page_start(),
                desc.is_anonymous()
            );
            *state = MapState::Mapped(region);
            Ok(())
        }
        Err(e) => {
            *state = MapState::Unset;
            Err(e)
        }
    }
}

impl<B: MapBackend> Drop for LazyMmap<B> {
    fn drop(&mut self) {
        let state = std::mem::replace(self.state.get_mut(), MapState::Released);
        let MapState::Mapped(region) = state else {
            return;
        };
        if let Err(e) = self.backend.destroy(region) {
            tracing::error!(
                "failed to release {} byte mapping on drop: {}",
                self.desc.map_len(),
                e.source
            );
        }
    }
}

impl<B: MapBackend> std::fmt::Debug for LazyMmap<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyMmap")
            .field("desc", &self.desc)
            .field("config", &self.config)
            .field("lifecycle", &self.lifecycle())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use snafu::IntoError;

    use super::*;
    use crate::{
        backend::heap::ReadBackend,
        error::{
            MappingFailedSnafu, MmapError, UnknownMappingSnafu,
            UnmapFailedSnafu,
        },
    };

    /// Heap backend whose create/destroy can be made to fail on demand.
    #[derive(Default)]
    struct FlakyBackend {
        fail_create: AtomicBool,
        fail_destroy: AtomicBool,
        // destroy frees the memory but reports its bookkeeping as gone
        lose_on_destroy: AtomicBool,
        creates: AtomicUsize,
    }

    impl MapBackend for FlakyBackend {
        fn create(&self, desc: &MappingDescriptor) -> Result<Region> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(MappingFailedSnafu {
                    offset: desc.page_start(),
                    len: desc.map_len(),
                }
                .into_error(std::io::Error::other("no address space")));
            }
            self.creates.fetch_add(1, Ordering::SeqCst);
            ReadBackend.create(desc)
        }

        fn destroy(&self, region: Region) -> Result<(), DestroyError> {
            if self.fail_destroy.load(Ordering::SeqCst) {
                let len = region.len();
                return Err(DestroyError {
                    region: Some(region),
                    source: UnmapFailedSnafu { len }
                        .into_error(std::io::Error::other("busy")),
                });
            }
            if self.lose_on_destroy.load(Ordering::SeqCst) {
                let addr = region.as_slice().as_ptr() as usize;
                drop(region);
                return Err(DestroyError {
                    region: None,
                    source: UnknownMappingSnafu { addr }.build(),
                });
            }
            ReadBackend.destroy(region)
        }

        fn advise(&self, region: &Region, advice: Advice) -> Result<()> {
            ReadBackend.advise(region, advice)
        }
    }

    fn flaky(len: usize) -> LazyMmap<FlakyBackend> {
        let desc = MappingDescriptor::anonymous(len).unwrap();
        LazyMmap::with_backend(desc, FlakyBackend::default(), MapConfig::default())
            .unwrap()
    }

    #[test]
    fn construction_does_not_map() {
        let mmap = flaky(8);
        assert_eq!(mmap.lifecycle(), Lifecycle::Unset);
        assert_eq!(mmap.backend().creates.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_create_leaves_unset_and_retry_works() {
        let mmap = flaky(8);
        mmap.backend().fail_create.store(true, Ordering::SeqCst);

        let err = mmap.bytes().unwrap_err();
        assert!(matches!(err, MmapError::MappingFailed { .. }));
        assert_eq!(mmap.lifecycle(), Lifecycle::Unset);

        mmap.backend().fail_create.store(false, Ordering::SeqCst);
        assert_eq!(&*mmap.bytes().unwrap(), &[0u8; 8]);
        assert_eq!(mmap.lifecycle(), Lifecycle::Mapped);
    }

    #[test]
    fn failed_remap_after_release_goes_to_unset() {
        let mmap = flaky(8);
        drop(mmap.bytes().unwrap());
        mmap.release().unwrap();
        assert_eq!(mmap.lifecycle(), Lifecycle::Released);

        mmap.backend().fail_create.store(true, Ordering::SeqCst);
        assert!(mmap.bytes().is_err());
        assert_eq!(mmap.lifecycle(), Lifecycle::Unset);
    }

    #[test]
    fn failed_destroy_stays_mapped() {
        let mmap = flaky(8);
        drop(mmap.bytes().unwrap());
        mmap.backend().fail_destroy.store(true, Ordering::SeqCst);

        let err = mmap.release().unwrap_err();
        assert!(matches!(err, MmapError::UnmapFailed { .. }));
        assert_eq!(mmap.lifecycle(), Lifecycle::Mapped);

        mmap.backend().fail_destroy.store(false, Ordering::SeqCst);
        mmap.release().unwrap();
        assert_eq!(mmap.lifecycle(), Lifecycle::Released);
    }

    #[test]
    fn lost_resources_on_release_are_fatal_and_remap_works() {
        let mmap = flaky(8);
        drop(mmap.bytes().unwrap());
        mmap.backend().lose_on_destroy.store(true, Ordering::SeqCst);

        let err = mmap.release().unwrap_err();
        assert!(matches!(err, MmapError::UnknownMapping { .. }));
        assert!(err.is_fatal());
        assert_eq!(mmap.lifecycle(), Lifecycle::Released);

        mmap.backend().lose_on_destroy.store(false, Ordering::SeqCst);
        assert_eq!(&*mmap.bytes().unwrap(), &[0u8; 8]);
        assert_eq!(mmap.backend().creates.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn release_with_live_view_on_same_thread_fails_fast() {
        let mmap = flaky(8);
        let view = mmap.bytes().unwrap();

        let err = mmap.release().unwrap_err();
        let MmapError::UnmapFailed { source, .. } = &err else {
            panic!("expected UnmapFailed, got {err:?}");
        };
        assert_eq!(source.kind(), std::io::ErrorKind::WouldBlock);
        assert_eq!(mmap.lifecycle(), Lifecycle::Mapped);
        assert_eq!(&*view, &[0u8; 8]);

        drop(view);
        mmap.release().unwrap();
        assert_eq!(mmap.lifecycle(), Lifecycle::Released);
    }

    #[test]
    fn release_with_live_view_on_other_thread_fails_fast() {
        let mmap = flaky(8);
        let view = mmap.bytes().unwrap();

        let err = std::thread::scope(|s| s.spawn(|| mmap.release()).join())
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, MmapError::UnmapFailed { .. }));
        assert_eq!(mmap.lifecycle(), Lifecycle::Mapped);
        drop(view);
    }

    #[test]
    fn release_is_idempotent() {
        let mmap = flaky(8);
        mmap.release().unwrap();
        assert_eq!(mmap.lifecycle(), Lifecycle::Unset);

        drop(mmap.bytes().unwrap());
        mmap.release().unwrap();
        mmap.release().unwrap();
        assert_eq!(mmap.lifecycle(), Lifecycle::Released);
    }

    #[test]
    fn eager_policy_maps_up_front() {
        let desc = MappingDescriptor::anonymous(8).unwrap();
        let mmap = LazyMmap::with_backend(
            desc,
            FlakyBackend::default(),
            MapConfig::eager(),
        )
        .unwrap();
        assert!(mmap.is_mapped());
        assert_eq!(mmap.backend().creates.load(Ordering::SeqCst), 1);

        drop(mmap.bytes().unwrap());
        assert_eq!(mmap.backend().creates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn eager_policy_surfaces_mapping_failure() {
        let desc = MappingDescriptor::anonymous(8).unwrap();
        let backend = FlakyBackend::default();
        backend.fail_create.store(true, Ordering::SeqCst);
        let err = LazyMmap::with_backend(desc, backend, MapConfig::eager())
            .unwrap_err();
        assert!(matches!(err, MmapError::MappingFailed { .. }));
    }

    #[test]
    fn disabled_advice_does_not_map() {
        let desc = MappingDescriptor::anonymous(8).unwrap();
        let config = MapConfig {
            advise: false,
            ..MapConfig::default()
        };
        let mmap =
            LazyMmap::with_backend(desc, FlakyBackend::default(), config)
                .unwrap();
        mmap.advise_will_need().unwrap();
        mmap.advise_dont_need().unwrap();
        assert_eq!(mmap.lifecycle(), Lifecycle::Unset);
    }

    #[test]
    fn advice_materializes_first() {
        let mmap = flaky(8);
        mmap.advise_will_need().unwrap();
        assert!(mmap.is_mapped());
    }

    #[test]
    fn nested_views_on_one_thread() {
        let mmap = flaky(4);
        let a = mmap.bytes().unwrap();
        let b = mmap.bytes().unwrap();
        assert_eq!(a.as_ptr(), b.as_ptr());
        assert_eq!(mmap.backend().creates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bytes_mut_only_for_anonymous() {
        let mut f = tempfile::tempfile().unwrap();
        std::io::Write::write_all(&mut f, b"0123456789").unwrap();
        let desc = MappingDescriptor::new(f, 2, 4).unwrap();
        let mut mmap =
            LazyMmap::with_backend(desc, ReadBackend, MapConfig::default())
                .unwrap();
        let err = mmap.bytes_mut().unwrap_err();
        assert!(matches!(err, MmapError::InvalidArgument { .. }));
        assert_eq!(&*mmap.bytes().unwrap(), b"2345");
    }

    #[test]
    fn bytes_mut_maps_then_release_discards_writes() {
        let mut mmap = flaky(6);
        mmap.bytes_mut().unwrap().copy_from_slice(b"abcdef");
        assert_eq!(&*mmap.bytes().unwrap(), b"abcdef");
        assert_eq!(mmap.backend().creates.load(Ordering::SeqCst), 1);

        mmap.release().unwrap();
        assert_eq!(mmap.bytes_mut().unwrap(), &[0u8; 6]);
        assert_eq!(mmap.backend().creates.load(Ordering::SeqCst), 2);
    }
}
