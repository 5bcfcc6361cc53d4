/// Set to materialize every mapping at construction instead of on first read.
pub const EAGER_ENV: &str = "TSM_MMAP_EAGER";
/// Set to turn kernel cache advice into a no-op.
pub const DISABLE_ADVISE_ENV: &str = "TSM_MMAP_DISABLE_ADVISE";

/// When a descriptor gets turned into an OS mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MapPolicy {
    /// On the first request for bytes. Most views are created speculatively
    /// and never read.
    #[default]
    Deferred,
    Eager,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapConfig {
    pub policy: MapPolicy,
    /// Pass `WillNeed`/`DontNeed` hints to the kernel.
    pub advise: bool,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            policy: MapPolicy::Deferred,
            advise: true,
        }
    }
}

impl MapConfig {
    #[must_use]
    pub fn eager() -> Self {
        Self {
            policy: MapPolicy::Eager,
            ..Self::default()
        }
    }

    /// Defaults, overridden by [`EAGER_ENV`] and [`DISABLE_ADVISE_ENV`].
    /// Only presence of the variables matters.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var_os(key).is_some())
    }

    pub fn from_lookup(is_set: impl Fn(&str) -> bool) -> Self {
        let mut cfg = Self::default();
        if is_set(EAGER_ENV) {
            tracing::info!("{EAGER_ENV} set, mapping eagerly");
            cfg.policy = MapPolicy::Eager;
        }
        if is_set(DISABLE_ADVISE_ENV) {
            tracing::info!("{DISABLE_ADVISE_ENV} set, ignoring cache advice");
            cfg.advise = false;
        }
        cfg
    }
}
