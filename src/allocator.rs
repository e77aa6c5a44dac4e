//! Thread-local allocation.
//!
//! Each mutator thread owns a `ThreadAllocator` holding one cached region
//! per size class. The allocation fast path is a bump or freelist pop into
//! the cached region; the slow path trades the exhausted region for a fresh
//! one through the heap. Every allocation begins with a safepoint check,
//! which is the only place a mutator reports its roots or parks for a
//! stop-the-world pause. A mutator that never allocates never pauses.

use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::null_mut;
use std::sync::Arc;

use crate::cell::{construct_object, CellHeader, Gc, GcRef, HeapObject};
use crate::error::HeapError;
use crate::heap::Heap;
use crate::region::Region;
use crate::roots;

/// Reports the calling thread's roots through the provided emit function.
pub type ReportRoots<'a> = &'a mut dyn FnMut(&mut dyn FnMut(GcRef));

pub struct ThreadAllocator {
    heap: Arc<Heap>,
    pool: Box<[*mut Region]>,
    reported_round: usize,
    active: bool,
    stack_base: usize,
    // Tied to its thread: it holds the running lock shared.
    _not_send: PhantomData<*mut u8>,
}

impl ThreadAllocator {
    /// Attaches the calling thread to the heap as a mutator. The current
    /// stack position becomes the base for conservative stack scans.
    pub fn new(heap: Arc<Heap>) -> ThreadAllocator {
        heap.attach_mutator();
        let level_nr = heap.geometry().level_nr();
        ThreadAllocator {
            stack_base: roots::approximate_stack_pointer(),
            pool: vec![null_mut(); level_nr].into_boxed_slice(),
            reported_round: 0,
            active: true,
            heap,
            _not_send: PhantomData,
        }
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Allocates a managed `T`, calling `report` to surface this thread's
    /// roots when the collector asks for them. Oversized values go to the
    /// large-object set transparently.
    pub fn allocate<T: HeapObject>(
        &mut self,
        value: T,
        report: ReportRoots<'_>,
    ) -> Result<Gc<T>, HeapError> {
        self.allocate_with_extra(value, 0, report)
    }

    /// As [`ThreadAllocator::allocate`], with `extra` trailing payload bytes
    /// for types carrying an inline variable-length tail.
    pub fn allocate_with_extra<T: HeapObject>(
        &mut self,
        value: T,
        extra: usize,
        report: ReportRoots<'_>,
    ) -> Result<Gc<T>, HeapError> {
        self.checkpoint(report);

        let size = size_of::<CellHeader>() + size_of::<T>() + extra;
        if size > self.heap.geometry().max_cell_size() {
            return match self.heap.large_set().allocate(value, extra) {
                Some(object) => Ok(object),
                None => Err(HeapError::Exhausted {
                    live_regions: self.heap.total_region_count(),
                }),
            };
        }

        let level = self.heap.geometry().level_from_size(size);
        if self.pool[level].is_null() {
            self.pool[level] = self.heap.get_free_region(level)?;
        }

        let cell = loop {
            let region = self.pool[level];
            if let Some(cell) = unsafe { (*region).allocate_raw() } {
                break cell;
            }
            match self.heap.commit_full_region(region) {
                Ok(next) => self.pool[level] = next,
                Err(error) => {
                    // The exhausted region is on the full list already; do
                    // not keep a second reference to it.
                    self.pool[level] = null_mut();
                    return Err(error);
                }
            }
        };

        let object = unsafe { construct_object(cell.as_ptr(), false, value) };
        Ok(unsafe { Gc::from_ref(object) })
    }

    /// Allocates with the conservative stack scan as the root report.
    pub fn allocate_auto<T: HeapObject>(&mut self, value: T) -> Result<Gc<T>, HeapError> {
        let heap = self.heap.clone();
        let stack_base = self.stack_base;
        self.allocate(value, &mut |emit| {
            roots::scan_thread_stack(&heap, stack_base, emit)
        })
    }

    /// Explicit safepoint: reports roots when a collection round started
    /// since the last check, or parks for a pause. Mutators that go long
    /// without allocating can call this directly.
    pub fn safepoint(&mut self, report: ReportRoots<'_>) {
        self.checkpoint(report)
    }

    /// Conservative-scan variant of [`ThreadAllocator::safepoint`].
    pub fn safepoint_auto(&mut self) {
        let heap = self.heap.clone();
        let stack_base = self.stack_base;
        self.checkpoint(&mut |emit| roots::scan_thread_stack(&heap, stack_base, emit));
    }

    #[inline]
    fn checkpoint(&mut self, report: ReportRoots<'_>) {
        assert!(self.active, "inactive mutator used its allocator");
        let round = self.heap.gc_round();
        if self.reported_round != round {
            self.reported_round = round;
            let heap = &self.heap;
            report(&mut |object| heap.remember(object));
            heap.note_thread_reported();
        } else if self.heap.pause_requested() {
            self.checkpoint_slow(report);
        }
    }

    #[cold]
    #[inline(never)]
    fn checkpoint_slow(&mut self, report: ReportRoots<'_>) {
        let heap = &self.heap;
        report(&mut |object| heap.remember(object));
        heap.wait_for_resume();
    }

    /// Leaves the mutator population, e.g. around blocking I/O. The thread's
    /// roots are reported one last time; collections proceed without it.
    pub fn set_inactive(&mut self, report: ReportRoots<'_>) {
        if self.active {
            self.active = false;
            let heap = &self.heap;
            report(&mut |object| heap.remember(object));
            heap.detach_mutator();
        }
    }

    /// Re-enters the mutator population. Blocks while a pause is in effect.
    pub fn set_active(&mut self) {
        if !self.active {
            self.active = true;
            self.heap.attach_mutator();
            // The roots reported at deactivation stand in for this round.
            self.reported_round = self.heap.gc_round();
            self.heap.note_thread_attached_reported();
        }
    }
}

impl Drop for ThreadAllocator {
    fn drop(&mut self) {
        // Cached regions go back under collector control; otherwise they
        // would be on no list at all.
        for region in self.pool.iter() {
            if !region.is_null() {
                self.heap.surrender_region(*region);
            }
        }
        if self.active {
            self.heap.detach_mutator();
        }
    }
}
