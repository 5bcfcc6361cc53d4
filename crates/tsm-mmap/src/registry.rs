//! Address-keyed table of native resources that own a mapped view.
//!
//! Where unmapping needs more than an address and a length, the resources
//! have to be found again from the base address. Every lookup, insert and
//! removal happens under one lock, so a concurrent create and destroy never
//! observe a half-updated entry.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use snafu::OptionExt;

use crate::error::{Result, UnknownMappingSnafu};

pub struct HandleRegistry<T> {
    entries: Mutex<BTreeMap<usize, T>>,
}

impl<T> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleRegistry<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record `resources` as owning the view at `addr`.
    ///
    /// Returns whatever was previously recorded for that address, which means
    /// an earlier view was unmapped without going through [`Self::take`].
    #[must_use = "a displaced entry still owns its resources"]
    pub fn insert(&self, addr: usize, resources: T) -> Option<T> {
        let prev = self.entries.lock().insert(addr, resources);
        if prev.is_some() {
            tracing::error!(
                "handle registry: replaced live entry for {:#x}",
                addr
            );
        }
        prev
    }

    /// Remove and return the resources for `addr`.
    pub fn take(&self, addr: usize) -> Result<T> {
        self.entries
            .lock()
            .remove(&addr)
            .context(UnknownMappingSnafu { addr })
    }

    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.entries.lock().contains_key(&addr)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
