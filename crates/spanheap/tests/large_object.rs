//! Objects over the small-size limit, served straight from the page heap.

use std::ptr::NonNull;

use spanheap::{AllocError, AllocFlags, Heap, HeapConfig, SpanState, MAX_SMALL_SIZE, PAGE_SIZE};

fn heap(arena: usize) -> Heap {
    Heap::builder()
        .config(HeapConfig::default().with_arena_bytes(arena))
        .build()
        .unwrap()
}

#[test]
fn test_large_object_span() {
    let heap = heap(64 << 20);
    let mut cache = heap.thread_cache();
    let p = cache.allocate(40_000, AllocFlags::NONE).unwrap();
    assert_eq!(p.as_ptr() as usize % PAGE_SIZE, 0);

    let info = heap.span_info(p).unwrap();
    assert_eq!(info.pages, 5);
    assert_eq!(info.size_class, 0);
    assert_eq!(info.start, p);
    assert_eq!(info.state, SpanState::InUse);

    let stats = heap.stats();
    assert_eq!(stats.large_allocs, 1);
    assert_eq!(stats.large_bytes, 40_000);
    assert_eq!(stats.inuse_pages, 5);

    unsafe { cache.free(p) };
    let stats = heap.stats();
    assert_eq!(stats.large_frees, 1);
    assert_eq!(stats.large_bytes, 0);
    assert_eq!(stats.inuse_pages, 0);
    assert!(heap.span_info(p).is_none());
}

#[test]
fn test_first_large_size() {
    let heap = heap(64 << 20);
    let mut cache = heap.thread_cache();
    let small = cache.allocate(MAX_SMALL_SIZE, AllocFlags::NONE).unwrap();
    let large = cache.allocate(MAX_SMALL_SIZE + 1, AllocFlags::NONE).unwrap();
    assert_ne!(heap.span_info(small).unwrap().size_class, 0);
    let info = heap.span_info(large).unwrap();
    assert_eq!(info.size_class, 0);
    assert_eq!(info.pages, (MAX_SMALL_SIZE + 1).div_ceil(PAGE_SIZE));
}

#[test]
fn test_reused_pages_are_zeroed() {
    let heap = heap(64 << 20);
    let mut cache = heap.thread_cache();
    let size = 100 * PAGE_SIZE;
    let p = cache.allocate(size, AllocFlags::NO_ZERO).unwrap();
    unsafe {
        std::ptr::write_bytes(p.as_ptr(), 0xC3, size);
        cache.free(p);
    }
    let q = cache.allocate(size, AllocFlags::NONE).unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(q.as_ptr(), size) };
    assert!(bytes.iter().all(|&b| b == 0));
}

#[test]
fn test_free_interior_pointer_panics() {
    let heap = heap(64 << 20);
    let mut cache = heap.thread_cache();
    let p = cache.allocate(MAX_SMALL_SIZE + PAGE_SIZE, AllocFlags::NONE).unwrap();
    assert_eq!(heap.span_info(p).unwrap().size_class, 0);
    let inner = unsafe { NonNull::new_unchecked(p.as_ptr().add(PAGE_SIZE)) };

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe {
        cache.free(inner);
    }));
    assert!(result.is_err());
    assert_eq!(heap.stats().large_allocs, 1);
    assert_eq!(heap.stats().large_frees, 0);
}

#[test]
fn test_request_beyond_arena_is_invalid() {
    let heap = heap(8 << 20);
    let mut cache = heap.thread_cache();
    let err = cache.allocate((8 << 20) + 1, AllocFlags::NONE).unwrap_err();
    assert!(matches!(err, AllocError::InvalidRequest { .. }));

    let err = cache.allocate_array(usize::MAX / 2, 3, AllocFlags::NONE).unwrap_err();
    assert!(matches!(err, AllocError::InvalidRequest { .. }));
}

#[test]
fn test_exhausted_arena_reports_oom() {
    let heap = heap(8 << 20);
    let mut cache = heap.thread_cache();
    let first = cache.try_allocate(5 << 20, AllocFlags::NONE).unwrap();
    let err = cache.try_allocate(5 << 20, AllocFlags::NONE).unwrap_err();
    assert!(matches!(err, AllocError::OutOfMemory { .. }));

    unsafe { cache.free(first) };
    cache.try_allocate(5 << 20, AllocFlags::NONE).unwrap();
}

#[test]
fn test_free_pages_coalesce() {
    let heap = heap(64 << 20);
    let mut cache = heap.thread_cache();
    let spans: Vec<_> = (0..8)
        .map(|i| cache.allocate((i + 5) * PAGE_SIZE, AllocFlags::NONE).unwrap())
        .collect();
    for p in spans.iter().step_by(2) {
        unsafe { cache.free(*p) };
    }
    assert!(heap.verify().free_spans >= 4);
    for p in spans.iter().skip(1).step_by(2) {
        unsafe { cache.free(*p) };
    }
    let report = heap.verify();
    assert_eq!(report.free_spans, 1);
    assert_eq!(report.inuse_pages, 0);
}
