//! Allocator error type.

use thiserror::Error;

/// Errors reported by the allocator.
///
/// Only [`AllocError::InvalidRequest`] reaches callers of the allocation
/// entry points. Out-of-memory aborts the process there, and a broken
/// size-class table panics on first use.
#[derive(Debug, Error)]
pub enum AllocError {
    /// The size-class computation produced the wrong number of classes.
    #[error("size class table has {computed} classes, expected {expected}")]
    ClassCount {
        /// Fixed class count the allocator is built for.
        expected: usize,
        /// Classes the computation produced.
        computed: usize,
    },
    /// A table or heap configuration is unusable.
    #[error("invalid configuration: {0}")]
    Configuration(&'static str),
    /// The request cannot be satisfied by any heap (size overflows the arena).
    #[error("invalid allocation request of {size} bytes")]
    InvalidRequest {
        /// Requested size in bytes (saturated on overflow).
        size: usize,
    },
    /// The memory provider refused to supply more memory.
    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory {
        /// Bytes the heap tried to obtain.
        requested: usize,
    },
    /// The memory provider failed while setting up the heap.
    #[error("os: {0}")]
    Os(#[from] std::io::Error),
}
