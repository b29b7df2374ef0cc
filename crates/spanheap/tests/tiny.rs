//! Packing of small pointer-free objects into shared 16-byte blocks.

use std::ptr::NonNull;

use spanheap::{size_classes, AllocFlags, Heap, HeapConfig};

fn heap() -> Heap {
    Heap::builder()
        .config(HeapConfig::default().with_arena_bytes(64 << 20))
        .build()
        .unwrap()
}

fn tiny(cache: &mut spanheap::ThreadCache<'_>, size: usize) -> NonNull<u8> {
    cache.allocate(size, AllocFlags::NO_SCAN).unwrap()
}

fn offset(a: NonNull<u8>, b: NonNull<u8>) -> usize {
    b.as_ptr() as usize - a.as_ptr() as usize
}

#[test]
fn test_one_two_four_eight_share_a_block() {
    let heap = heap();
    let mut cache = heap.thread_cache();

    let a = tiny(&mut cache, 1);
    let b = tiny(&mut cache, 2);
    let c = tiny(&mut cache, 4);
    let d = tiny(&mut cache, 8);
    assert_eq!(offset(a, b), 2);
    assert_eq!(offset(a, c), 4);
    assert_eq!(offset(a, d), 8);

    let info = heap.span_info(d).unwrap();
    assert_eq!(info.object, a);
    assert_eq!(info.object_size, 16);

    let e = tiny(&mut cache, 1);
    assert_ne!(heap.span_info(e).unwrap().object, a);
}

#[test]
fn test_alignment_follows_size() {
    let heap = heap();
    let mut cache = heap.thread_cache();

    let block = tiny(&mut cache, 1);
    let two = tiny(&mut cache, 6);
    let eight = tiny(&mut cache, 8);
    assert_eq!(offset(block, two), 2);
    assert_eq!(offset(block, eight), 8);
    assert_eq!(eight.as_ptr() as usize % 8, 0);

    let odd = tiny(&mut cache, 3);
    assert_ne!(heap.span_info(odd).unwrap().object, block);
}

#[test]
fn test_keeps_block_with_more_room() {
    let heap = heap();
    let mut cache = heap.thread_cache();

    let a = tiny(&mut cache, 8);
    // Does not fit; the new block would have only 4 bytes left.
    let b = tiny(&mut cache, 12);
    assert_ne!(heap.span_info(b).unwrap().object, a);
    let c = tiny(&mut cache, 8);
    assert_eq!(offset(a, c), 8);

    // A fresh block beats the full one.
    let d = tiny(&mut cache, 2);
    assert_ne!(heap.span_info(d).unwrap().object, a);
    let e = tiny(&mut cache, 2);
    assert_eq!(offset(d, e), 2);
}

#[test]
fn test_blocks_are_zeroed() {
    let heap = heap();
    let mut cache = heap.thread_cache();

    let mut seen = Vec::new();
    for _ in 0..200 {
        let p = tiny(&mut cache, 5);
        let bytes = unsafe { std::slice::from_raw_parts_mut(p.as_ptr(), 5) };
        assert!(bytes.iter().all(|&b| b == 0));
        bytes.fill(0xEE);
        seen.push(p);
    }

    // Freed 16-byte slots come back zeroed when reused as tiny blocks.
    let plain: Vec<_> = (0..64)
        .map(|_| {
            let p = cache.allocate(16, AllocFlags::NO_ZERO).unwrap();
            unsafe { std::ptr::write_bytes(p.as_ptr(), 0xAB, 16) };
            p
        })
        .collect();
    for p in plain {
        unsafe { cache.free(p) };
    }
    for _ in 0..64 {
        let p = tiny(&mut cache, 15);
        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), 15) };
        assert!(bytes.iter().all(|&b| b == 0));
    }
}

#[test]
fn test_scannable_and_sixteen_bytes_skip_packing() {
    let heap = heap();
    let mut cache = heap.thread_cache();

    let a = cache.allocate(4, AllocFlags::NONE).unwrap();
    let b = cache.allocate(4, AllocFlags::NONE).unwrap();
    assert_eq!(offset(a, b), 8);
    assert_eq!(heap.usable_size(a), Some(8));

    let c = cache.allocate(16, AllocFlags::NO_SCAN).unwrap();
    let d = cache.allocate(16, AllocFlags::NO_SCAN).unwrap();
    assert_eq!(heap.usable_size(c), Some(16));
    assert_eq!(heap.usable_size(d), Some(16));
}

#[test]
fn test_tiny_counts() {
    let heap = heap();
    {
        let mut cache = heap.thread_cache();
        for _ in 0..16 {
            tiny(&mut cache, 4);
        }
    }
    let stats = heap.stats();
    assert_eq!(stats.tiny_allocs, 16);
    assert_eq!(stats.classes[size_classes().classify(16)].mallocs, 4);
}

#[test]
#[should_panic(expected = "not the start of a slot")]
fn test_free_inside_block_panics() {
    let heap = heap();
    let mut cache = heap.thread_cache();
    tiny(&mut cache, 2);
    let inner = tiny(&mut cache, 2);
    unsafe { cache.free(inner) };
}
