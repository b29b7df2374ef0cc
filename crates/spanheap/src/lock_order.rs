//! # Lock Ordering
//!
//! The heap has two kinds of lock:
//!
//! | Level | Lock            | Guards                                   |
//! |-------|-----------------|------------------------------------------|
//! | 1     | `Central(c)`    | nonempty/empty lists of size class `c`   |
//! | 2     | `PageHeap`      | free-run lists, span pool, arena growth  |
//!
//! Allocation and free never hold two of these at once: a central list
//! drops its lock before it asks the page heap for a span or hands one
//! back. Only [`Heap::verify`](crate::Heap::verify) nests them, taking every
//! central lock in ascending class order and then the page-heap lock.
//!
//! Debug builds check the order on every acquisition: a lock may only be
//! taken while every lock already held by the thread is strictly lower.

use std::cell::RefCell;
use std::fmt;
use std::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard};

/// Position of a lock in the global order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum LockLevel {
    /// Central free list of one size class.
    Central(u8),
    /// The page heap.
    PageHeap,
}

thread_local!(static HELD: RefCell<Vec<LockLevel>> = const { RefCell::new(Vec::new()) });

fn acquire(level: LockLevel) {
    // Destructors of thread-locals (thread caches flushing on exit) may run
    // after HELD is gone; skip validation there.
    let _ = HELD.try_with(|held| {
        let mut held = held.borrow_mut();
        if let Some(top) = held.iter().max() {
            assert!(
                level > *top,
                "lock order violation: acquiring {level:?} while holding {top:?}"
            );
        }
        held.push(level);
    });
}

fn release(level: LockLevel) {
    let _ = HELD.try_with(|held| {
        let mut held = held.borrow_mut();
        if let Some(pos) = held.iter().rposition(|l| *l == level) {
            held.remove(pos);
        }
    });
}

/// A `parking_lot` mutex that knows its place in the lock order.
pub(crate) struct OrderedMutex<T> {
    level: LockLevel,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    pub(crate) const fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: Mutex::new(value),
        }
    }

    pub(crate) fn lock(&self) -> OrderedGuard<'_, T> {
        if cfg!(debug_assertions) {
            acquire(self.level);
        }
        OrderedGuard {
            guard: self.inner.lock(),
            level: self.level,
        }
    }
}

impl<T> fmt::Debug for OrderedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedMutex")
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

pub(crate) struct OrderedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    level: LockLevel,
}

impl<T> Deref for OrderedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedGuard<'_, T> {
    fn drop(&mut self) {
        if cfg!(debug_assertions) {
            release(self.level);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_ordered() {
        assert!(LockLevel::Central(1) < LockLevel::Central(2));
        assert!(LockLevel::Central(66) < LockLevel::PageHeap);
    }

    #[test]
    fn test_ascending_acquisition() {
        let a = OrderedMutex::new(LockLevel::Central(3), ());
        let b = OrderedMutex::new(LockLevel::Central(9), ());
        let heap = OrderedMutex::new(LockLevel::PageHeap, ());
        let _a = a.lock();
        let _b = b.lock();
        let _h = heap.lock();
    }

    #[test]
    fn test_release_out_of_order() {
        let a = OrderedMutex::new(LockLevel::Central(3), ());
        let heap = OrderedMutex::new(LockLevel::PageHeap, ());
        let ga = a.lock();
        let gh = heap.lock();
        drop(ga);
        drop(gh);
        let _again = a.lock();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock order violation")]
    fn test_central_after_page_heap_panics() {
        let heap = OrderedMutex::new(LockLevel::PageHeap, ());
        let central = OrderedMutex::new(LockLevel::Central(1), ());
        let _h = heap.lock();
        let _c = central.lock();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock order violation")]
    fn test_descending_centrals_panic() {
        let high = OrderedMutex::new(LockLevel::Central(10), ());
        let low = OrderedMutex::new(LockLevel::Central(2), ());
        let _h = high.lock();
        let _l = low.lock();
    }
}
