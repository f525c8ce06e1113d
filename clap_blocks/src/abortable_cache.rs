//! Abortable cache related configs.

use std::num::NonZeroUsize;

/// Default number of entries an abortable cache keeps.
pub const DEFAULT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1_000) {
    Some(n) => n,
    None => panic!("default capacity must be non-zero"),
};

/// CLI config for the abortable, deduplicating fetch cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::Parser)]
pub struct AbortableCacheConfig {
    /// Maximum number of entries (settled or in flight) kept by the cache.
    ///
    /// When the limit is reached, the least recently used entry is dropped.
    #[clap(
        long = "abortable-cache-capacity",
        env = "ABORTABLE_CACHE_CAPACITY",
        default_value = "1000",
        action
    )]
    pub capacity: NonZeroUsize,
}

impl AbortableCacheConfig {
    /// Config with the given capacity.
    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self { capacity }
    }
}

impl Default for AbortableCacheConfig {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}
