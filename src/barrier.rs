//! Write-barrier entry points.
//!
//! The barrier keeps the strong tri-color invariant across reference
//! stores: no DARK or BLACK object may hold a reference to a WHITE object
//! where the collector could miss it. Three entry points cover the shapes a
//! hosted runtime stores through; all of them funnel into
//! [`Heap::write_barrier`], which re-greys the target after the slot has
//! been updated.

use std::ptr::NonNull;

use crate::cell::GcRef;
use crate::heap::Heap;

/// The caller identifies both objects: `target` just had a slot overwritten
/// with `reference`.
#[inline]
pub fn barrier_static(heap: &Heap, target: GcRef, reference: Option<GcRef>) {
    heap.write_barrier(target, reference);
}

/// The caller only has the address of the updated slot; the enclosing
/// object is derived by region lookup and cell alignment. The slot must be
/// inside a live object in a registered region.
pub fn barrier_in_region(heap: &Heap, slot: *const (), reference: Option<GcRef>) {
    let cell = heap
        .find_cell(slot as usize)
        .expect("barrier slot is not inside any region's cell area");
    let header = unsafe { &*cell };
    assert!(header.is_in_use(), "barrier slot is inside a dead cell");
    let target = GcRef::from_header(unsafe { NonNull::new_unchecked(cell) });
    heap.write_barrier(target, reference);
}

/// As [`barrier_in_region`], but a slot outside any region (or inside a
/// cell that is not in use) is a legal no-op. Used for stores through
/// pointers that may or may not refer into the managed heap.
pub fn barrier_if_in_heap(heap: &Heap, slot: *const (), reference: Option<GcRef>) {
    if let Some(cell) = heap.find_cell(slot as usize) {
        let header = unsafe { &*cell };
        if header.is_in_use() {
            let target = GcRef::from_header(unsafe { NonNull::new_unchecked(cell) });
            heap.write_barrier(target, reference);
        }
    }
}
