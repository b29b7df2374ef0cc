//! Recycled span records.
//!
//! Records are boxed once and never freed while the page heap lives, so a
//! stale page-map entry always points at *some* record. Callers recognise
//! stale entries by the record's state and page range.

use std::ptr;

use crate::span::{Residence, Span, SpanState};

pub(crate) struct SpanPool {
    records: Vec<*mut Span>,
    free: Vec<*mut Span>,
}

// SAFETY: the pool is only touched under the page-heap lock.
unsafe impl Send for SpanPool {}

impl SpanPool {
    pub(crate) const fn new() -> Self {
        Self {
            records: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Hands out a record with every field reset.
    pub(crate) fn alloc(&mut self) -> *mut Span {
        let Some(span) = self.free.pop() else {
            let span = Box::into_raw(Box::new(Span::dead()));
            self.records.push(span);
            return span;
        };
        // SAFETY: dead records are owned by the pool. Other threads may
        // still read `state` through stale page-map entries, so the record
        // is reset field by field instead of overwritten.
        unsafe {
            (*span).next = ptr::null_mut();
            (*span).prev = ptr::null_mut();
            (*span).residence = Residence::Unlinked;
            (*span).start = 0;
            (*span).npages = 0;
            (*span).freelist = ptr::null_mut();
            (*span).allocated = 0;
            (*span).size_class = 0;
            (*span).elem_size = 0;
            (*span).objects = 0;
            (*span).limit = 0;
            (*span).magic = Default::default();
            (*span).needzero = false;
            (*span).released = 0;
            (*span).deferred.take();
            (*span).sweep.store(0);
            Span::set_descriptor(span, 0);
        }
        span
    }

    /// Returns a record to the pool.
    ///
    /// # Safety
    ///
    /// `span` must come from this pool and be referenced by no list.
    pub(crate) unsafe fn release(&mut self, span: *mut Span) {
        unsafe {
            debug_assert_eq!((*span).residence, Residence::Unlinked);
            Span::set_state(span, SpanState::Dead);
        }
        self.free.push(span);
    }

    /// Every record ever created, live or dead.
    pub(crate) fn records(&self) -> &[*mut Span] {
        &self.records
    }

    pub(crate) fn live(&self) -> usize {
        self.records.len() - self.free.len()
    }
}

impl Drop for SpanPool {
    fn drop(&mut self) {
        for &span in &self.records {
            // SAFETY: every record came from `Box::into_raw` and the heap is gone.
            drop(unsafe { Box::from_raw(span) });
        }
    }
}
