//! Heap configuration.

use crate::error::AllocError;
use crate::size_class::PAGE_SIZE;

/// Default arena reservation.
#[cfg(target_pointer_width = "64")]
pub const DEFAULT_ARENA_BYTES: usize = 32 << 30;

/// Default arena reservation.
#[cfg(not(target_pointer_width = "64"))]
pub const DEFAULT_ARENA_BYTES: usize = 512 << 20;

/// Default minimum growth step of the page heap (1 MiB).
pub const DEFAULT_GROW_CHUNK_BYTES: usize = 1 << 20;

/// Default per-class high-water mark of a thread cache's freed list.
pub const DEFAULT_CACHE_CLASS_BYTES: usize = 64 << 10;

/// Default bound on all freed objects held by one thread cache (4 MiB).
pub const DEFAULT_CACHE_TOTAL_BYTES: usize = 4 << 20;

/// A thread cache's freed list never flushes below this many objects.
pub const MIN_CACHED_OBJECTS: usize = 4;

/// Configuration for a [`Heap`](crate::Heap).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Bytes of address space reserved for the arena. Also the largest
    /// request the heap accepts.
    pub arena_bytes: usize,
    /// Preferred arena base address; 0 lets the OS choose.
    pub arena_hint: usize,
    /// Minimum number of bytes committed when the arena grows.
    pub grow_chunk_bytes: usize,
    /// Bytes of freed objects a thread cache keeps per class before handing
    /// half of them back to the central list.
    pub cache_class_bytes: usize,
    /// Bytes of freed objects a thread cache keeps across all classes.
    pub cache_total_bytes: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            arena_bytes: DEFAULT_ARENA_BYTES,
            arena_hint: 0,
            grow_chunk_bytes: DEFAULT_GROW_CHUNK_BYTES,
            cache_class_bytes: DEFAULT_CACHE_CLASS_BYTES,
            cache_total_bytes: DEFAULT_CACHE_TOTAL_BYTES,
        }
    }
}

impl HeapConfig {
    /// Sets the arena size.
    #[must_use]
    pub const fn with_arena_bytes(mut self, bytes: usize) -> Self {
        self.arena_bytes = bytes;
        self
    }

    /// Sets the minimum growth step.
    #[must_use]
    pub const fn with_grow_chunk_bytes(mut self, bytes: usize) -> Self {
        self.grow_chunk_bytes = bytes;
        self
    }

    /// Sets the per-class thread cache high-water mark.
    #[must_use]
    pub const fn with_cache_class_bytes(mut self, bytes: usize) -> Self {
        self.cache_class_bytes = bytes;
        self
    }

    /// Sets the total thread cache bound.
    #[must_use]
    pub const fn with_cache_total_bytes(mut self, bytes: usize) -> Self {
        self.cache_total_bytes = bytes;
        self
    }

    /// Number of freed objects of `size` bytes a thread cache may hold.
    #[must_use]
    pub fn cache_limit(&self, size: usize) -> usize {
        (self.cache_class_bytes / size).max(MIN_CACHED_OBJECTS)
    }

    pub(crate) fn validate(&self) -> Result<(), AllocError> {
        if self.arena_bytes == 0 || self.arena_bytes % PAGE_SIZE != 0 {
            return Err(AllocError::Configuration(
                "arena size must be a non-zero multiple of the page size",
            ));
        }
        if self.grow_chunk_bytes == 0 || self.grow_chunk_bytes % PAGE_SIZE != 0 {
            return Err(AllocError::Configuration(
                "grow chunk must be a non-zero multiple of the page size",
            ));
        }
        if self.arena_hint % PAGE_SIZE != 0 {
            return Err(AllocError::Configuration("arena hint must be page aligned"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        HeapConfig::default().validate().unwrap();
    }

    #[test]
    fn test_unaligned_arena_rejected() {
        let config = HeapConfig::default().with_arena_bytes(PAGE_SIZE + 1);
        assert!(matches!(config.validate(), Err(AllocError::Configuration(_))));
    }

    #[test]
    fn test_zero_grow_chunk_rejected() {
        let config = HeapConfig::default().with_grow_chunk_bytes(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cache_limit_floor() {
        let config = HeapConfig::default();
        assert_eq!(config.cache_limit(16), DEFAULT_CACHE_CLASS_BYTES / 16);
        assert_eq!(config.cache_limit(32 << 10), MIN_CACHED_OBJECTS);
    }
}
