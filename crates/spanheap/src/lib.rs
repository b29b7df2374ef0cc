//! A concurrent size-class memory allocator.
//!
//! `spanheap` turns byte-size requests into reusable slots through three
//! tiers:
//!
//! - **Thread caches** hold one span per size class and allocate from it
//!   without locking. Sub-16-byte pointer-free objects are packed together
//!   into one 16-byte slot.
//! - **Central free lists**, one per size class behind its own lock, hand
//!   spans with free slots to caches and take them back.
//! - **The page heap** manages a reserved arena in 8 KiB pages, splitting
//!   and coalescing runs of pages ("spans"). Objects over 32 KiB bypass the
//!   other tiers and get a span of their own.
//!
//! Spans may be reclaimed by an external [`Sweeper`]: the heap keeps a sweep
//! generation, and a span stamped as needing a sweep is claimed by exactly
//! one actor and swept before its slots are reused.
//!
//! # Quick Start
//!
//! ```
//! use spanheap::{AllocFlags, Heap, HeapConfig};
//!
//! let heap = Heap::builder()
//!     .config(HeapConfig::default().with_arena_bytes(64 << 20))
//!     .build()
//!     .unwrap();
//! let mut cache = heap.thread_cache();
//!
//! let small = cache.allocate(100, AllocFlags::NONE).unwrap();
//! let large = cache.allocate(40_000, AllocFlags::NONE).unwrap();
//! assert_eq!(heap.usable_size(small), Some(112));
//! assert_eq!(heap.usable_size(large), Some(40_000));
//!
//! unsafe {
//!     cache.free(small);
//!     cache.free(large);
//! }
//! ```
//!
//! # Errors and Invariants
//!
//! Allocation reports only invalid requests as errors. Running out of memory
//! aborts the process through [`std::alloc::handle_alloc_error`], and a
//! corrupted heap (double free, foreign pointer, broken free list) panics.
//! Embedders are expected to build with `panic = "abort"`.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod central;
mod config;
mod error;
mod heap;
mod lock_order;
mod memory;
mod metrics;
mod page_heap;
mod page_map;
pub mod size_class;
mod span;
mod span_pool;
mod sweep;
mod thread_cache;
mod tracing;

// Re-export public API
pub use config::{
    HeapConfig, DEFAULT_ARENA_BYTES, DEFAULT_CACHE_CLASS_BYTES, DEFAULT_CACHE_TOTAL_BYTES,
    DEFAULT_GROW_CHUNK_BYTES, MIN_CACHED_OBJECTS,
};
pub use error::AllocError;
pub use heap::{Heap, HeapBuilder, HeapReport, SpanInfo};
pub use memory::{MemoryProvider, SystemMemory};
pub use metrics::{ClassStats, HeapStats};
pub use size_class::{size_classes, SizeClass, SizeClasses, MAX_SMALL_SIZE, PAGE_SIZE};
pub use span::SpanState;
pub use sweep::{NoopSweeper, ScanDescriptor, SweepSpan, SweepStamp, SweepStatus, Sweeper};
pub use thread_cache::{AllocFlags, ThreadCache};
