//! Coordination with an injected sweeper.
//!
//! The sweeper here reclaims every slot whose address was marked dead, so
//! each test controls exactly what a sweep finds.

use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;
use spanheap::{
    size_classes, AllocFlags, Heap, HeapConfig, ScanDescriptor, SweepSpan, SweepStatus, Sweeper,
};

#[derive(Default)]
struct DeadSet {
    dead: Mutex<HashSet<usize>>,
    descriptors: Mutex<Vec<ScanDescriptor>>,
}

impl DeadSet {
    fn kill(&self, objs: impl IntoIterator<Item = NonNull<u8>>) {
        self.dead.lock().extend(objs.into_iter().map(|p| p.as_ptr() as usize));
    }
}

impl Sweeper for DeadSet {
    fn try_sweep(&self, span: &mut SweepSpan<'_>) -> usize {
        self.descriptors.lock().push(span.descriptor());
        let mut dead = self.dead.lock();
        // SAFETY: the tests never touch an object after marking it dead.
        unsafe { span.retain(|obj| !dead.remove(&(obj.as_ptr() as usize))) }
    }
}

const SIZE: usize = 128;
const PER_SPAN: usize = 64;

fn heap() -> (Heap, Arc<DeadSet>) {
    let sweeper = Arc::new(DeadSet::default());
    let heap = Heap::builder()
        .config(HeapConfig::default().with_arena_bytes(64 << 20))
        .sweeper(Arc::clone(&sweeper))
        .build()
        .unwrap();
    (heap, sweeper)
}

/// Fills exactly one span of the test class and hands it back to the
/// central list.
fn fill_span(heap: &Heap) -> Vec<NonNull<u8>> {
    let mut cache = heap.thread_cache();
    let objs: Vec<_> = (0..PER_SPAN)
        .map(|_| cache.allocate(SIZE, AllocFlags::NONE).unwrap())
        .collect();
    let start = heap.span_info(objs[0]).unwrap().start;
    assert!(objs.iter().all(|&p| heap.span_info(p).unwrap().start == start));
    objs
}

#[test]
fn test_refill_reuses_reclaimed_span_without_growing() {
    let (heap, sweeper) = heap();
    let objs = fill_span(&heap);
    let span_start = heap.span_info(objs[0]).unwrap().start;
    assert_eq!(heap.verify().empty_spans, 1);

    sweeper.kill(objs.iter().copied());
    heap.advance_sweep_generation();
    assert_eq!(heap.span_info(objs[0]).unwrap().sweep, SweepStatus::NeedsSweep);
    let grown = heap.stats().spans_grown;

    let mut cache = heap.thread_cache();
    let p = cache.allocate(SIZE, AllocFlags::NONE).unwrap();
    let info = heap.span_info(p).unwrap();
    assert_eq!(info.start, span_start);
    assert_eq!(info.sweep, SweepStatus::Swept);

    let stats = heap.stats();
    assert_eq!(stats.spans_grown, grown);
    assert_eq!(stats.spans_swept, 1);
    assert_eq!(stats.classes[size_classes().classify(SIZE)].swept, PER_SPAN as u64);

    // Reclaimed slots come back zeroed.
    assert!(unsafe { std::slice::from_raw_parts(p.as_ptr(), SIZE) }
        .iter()
        .all(|&b| b == 0));
    unsafe { cache.free(p) };
}

#[test]
fn test_refill_grows_when_sweep_reclaims_nothing() {
    let (heap, _sweeper) = heap();
    let objs = fill_span(&heap);
    heap.advance_sweep_generation();
    let grown = heap.stats().spans_grown;

    let mut cache = heap.thread_cache();
    let p = cache.allocate(SIZE, AllocFlags::NONE).unwrap();
    assert_ne!(heap.span_info(p).unwrap().start, heap.span_info(objs[0]).unwrap().start);
    assert_eq!(heap.span_info(objs[0]).unwrap().sweep, SweepStatus::Swept);

    let stats = heap.stats();
    assert_eq!(stats.spans_grown, grown + 1);
    assert_eq!(stats.spans_swept, 1);

    let report = heap.verify();
    assert_eq!(report.empty_spans, 1);
    assert_eq!(report.cached_spans, 1);
}

#[test]
fn test_refill_sweeps_nonempty_span() {
    let (heap, sweeper) = heap();
    let mut objs = fill_span(&heap);
    {
        let mut cache = heap.thread_cache();
        unsafe { cache.free(objs.pop().unwrap()) };
    }
    assert_eq!(heap.verify().nonempty_spans, 1);

    sweeper.kill(objs.drain(..10));
    heap.advance_sweep_generation();
    let grown = heap.stats().spans_grown;

    let mut cache = heap.thread_cache();
    let reused: Vec<_> = (0..11)
        .map(|_| cache.allocate(SIZE, AllocFlags::NONE).unwrap())
        .collect();
    assert_eq!(heap.stats().spans_grown, grown);
    let start = heap.span_info(reused[0]).unwrap().start;
    assert!(reused.iter().all(|&p| heap.span_info(p).unwrap().start == start));

    cache.allocate(SIZE, AllocFlags::NONE).unwrap();
    assert_eq!(heap.stats().spans_grown, grown + 1);
}

#[test]
fn test_sweep_all_releases_dead_spans() {
    let (heap, sweeper) = heap();
    let objs = fill_span(&heap);
    sweeper.kill(objs.iter().copied());

    heap.advance_sweep_generation();
    assert!(heap.stats().inuse_pages > 0);
    assert_eq!(heap.sweep_all(), 1);
    assert_eq!(heap.sweep_all(), 0);

    let stats = heap.stats();
    assert_eq!(stats.inuse_pages, 0);
    assert_eq!(stats.spans_released, 1);
    assert!(heap.span_info(objs[0]).is_none());
    assert_eq!(heap.verify().small_spans, 0);
}

#[test]
fn test_advance_sweeps_pending_spans_first() {
    let (heap, sweeper) = heap();
    let objs = fill_span(&heap);
    let first = heap.sweep_generation();
    assert_eq!(heap.advance_sweep_generation(), first.wrapping_add(2));

    sweeper.kill(objs[..PER_SPAN / 2].iter().copied());
    heap.advance_sweep_generation();

    let stats = heap.stats();
    assert_eq!(stats.spans_swept, 1);
    assert_eq!(stats.objects_swept, (PER_SPAN / 2) as u64);
    let report = heap.verify();
    assert_eq!(report.nonempty_spans, 1);
    assert_eq!(report.listed_free, PER_SPAN / 2);
}

#[test]
fn test_sweeper_sees_descriptor() {
    let (heap, sweeper) = heap();
    let objs = fill_span(&heap);
    assert!(heap.set_scan_descriptor(objs[3], ScanDescriptor(0xD5)));
    heap.advance_sweep_generation();
    heap.sweep_all();
    assert_eq!(*sweeper.descriptors.lock(), [ScanDescriptor(0xD5)]);
}

#[test]
fn test_each_span_swept_once_under_contention() {
    const SPANS: usize = 16;
    let (heap, sweeper) = heap();
    let mut all = Vec::new();
    for _ in 0..SPANS {
        all.extend(fill_span(&heap));
    }
    sweeper.kill(all.iter().copied().step_by(2));
    heap.advance_sweep_generation();

    std::thread::scope(|s| {
        for _ in 0..3 {
            s.spawn(|| {
                let mut cache = heap.thread_cache();
                let mut mine = Vec::new();
                for _ in 0..PER_SPAN * 4 {
                    mine.push(cache.allocate(SIZE, AllocFlags::NONE).unwrap());
                }
                for p in mine {
                    unsafe { cache.free(p) };
                }
            });
        }
        s.spawn(|| heap.sweep_all());
    });
    heap.sweep_all();

    let stats = heap.stats();
    assert_eq!(stats.spans_swept, SPANS as u64);
    assert_eq!(stats.objects_swept, (SPANS * PER_SPAN / 2) as u64);
    assert!(sweeper.dead.lock().is_empty());
    heap.verify();
}

/// Blocks inside every sweep until the test lets it go.
struct Gate {
    entered: crossbeam::channel::Sender<()>,
    release: crossbeam::channel::Receiver<()>,
}

impl Sweeper for Gate {
    fn try_sweep(&self, _span: &mut SweepSpan<'_>) -> usize {
        self.entered.send(()).unwrap();
        self.release.recv().unwrap();
        0
    }
}

#[test]
fn test_span_emptied_during_sweep_outlives_advance() {
    let (entered_tx, entered_rx) = crossbeam::channel::unbounded();
    let (release_tx, release_rx) = crossbeam::channel::unbounded();
    let heap = Heap::builder()
        .config(HeapConfig::default().with_arena_bytes(64 << 20))
        .sweeper(Gate {
            entered: entered_tx,
            release: release_rx,
        })
        .build()
        .unwrap();
    let objs = fill_span(&heap);
    heap.advance_sweep_generation();

    std::thread::scope(|s| {
        let sweeping = s.spawn(|| heap.sweep_all());
        entered_rx.recv().unwrap();
        assert_eq!(heap.span_info(objs[0]).unwrap().sweep, SweepStatus::Sweeping);

        // The cycle moves on while the sweep is still in flight.
        heap.advance_sweep_generation();
        assert_eq!(heap.span_info(objs[0]).unwrap().sweep, SweepStatus::Sweeping);

        {
            let mut cache = heap.thread_cache();
            for &p in &objs {
                unsafe { cache.free(p) };
            }
        }
        // Empty, but the sweeper still holds it.
        assert!(heap.span_info(objs[0]).is_some());
        assert!(heap.stats().inuse_pages > 0);

        release_tx.send(()).unwrap();
        assert_eq!(sweeping.join().unwrap(), 1);
    });

    let stats = heap.stats();
    assert_eq!(stats.inuse_pages, 0);
    assert_eq!(stats.spans_released, 1);
    assert!(heap.span_info(objs[0]).is_none());
    assert_eq!(heap.verify().small_spans, 0);
}
