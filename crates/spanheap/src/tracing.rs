//! Heap tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! events for the slow paths of the allocator. The fast paths never log.

#[cfg(feature = "tracing")]
pub(crate) mod internal {
    use tracing::{span, Level};

    use crate::size_class::PAGE_SHIFT;

    /// Create a span for one central refill of `class`.
    pub(crate) fn trace_refill(class: usize) -> span::EnteredSpan {
        span!(Level::DEBUG, "refill", class).entered()
    }

    /// Log arena growth.
    pub(crate) fn log_grow(pages: usize, used_pages: usize) {
        tracing::debug!(
            pages,
            bytes = pages << PAGE_SHIFT,
            arena_used = used_pages << PAGE_SHIFT,
            "arena_grow"
        );
    }

    /// Log a request the arena has no room for.
    pub(crate) fn log_arena_exhausted(pages: usize, available: usize) {
        tracing::warn!(pages, available, "arena_exhausted");
    }

    /// Log a central list carving a fresh span.
    pub(crate) fn log_span_grown(class: usize, pages: usize) {
        tracing::trace!(class, pages, "span_grown");
    }

    /// Log one sweeper run.
    pub(crate) fn log_sweep(class: usize, reclaimed: usize, generation: u32) {
        tracing::trace!(class, reclaimed, generation, "span_swept");
    }

    /// Log a small span going back to the page heap.
    pub(crate) fn log_span_released(class: usize, pages: usize) {
        tracing::trace!(class, pages, "span_released");
    }

    /// Log a scavenging pass.
    pub(crate) fn log_scavenge(released: usize, committed: usize) {
        tracing::debug!(released, committed, "scavenge");
    }

    /// Log a sweep generation change.
    pub(crate) fn log_generation(generation: u32) {
        tracing::debug!(generation, "sweep_generation_advanced");
    }

    /// Log an allocation the process cannot survive.
    pub(crate) fn log_out_of_memory(requested: usize) {
        tracing::error!(requested, "out_of_memory");
    }
}
