//! Root discovery.
//!
//! Two sources feed the initial grey set: callbacks registered by the
//! runtime for its own root tables (globals, interned strings), and the
//! conservative scan each mutator performs over its own stack when it
//! reports at a safepoint. The conservative scan treats every word-aligned
//! stack slot both as a possibly-tagged value and as a raw pointer; anything
//! that resolves to a live cell or a tracked large object is a root. False
//! positives only over-retain, never corrupt.

use std::mem::size_of;

use parking_lot::Mutex;

use crate::cell::GcRef;
use crate::heap::Heap;

pub type RootScanFn = Box<dyn Fn(&mut dyn FnMut(GcRef)) + Send + Sync>;

/// Registered root-scan callbacks. Each receives an emit function and must
/// invoke it once per root it owns; callbacks are re-run during the
/// stop-the-world re-scan and must tolerate being called twice per cycle.
pub struct RootScanRegistry {
    scans: Mutex<Vec<RootScanFn>>,
}

impl RootScanRegistry {
    pub fn new() -> Self {
        Self {
            scans: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, scan: RootScanFn) {
        self.scans.lock().push(scan);
    }

    pub fn for_each(&self, emit: &mut dyn FnMut(GcRef)) {
        let scans = self.scans.lock();
        for scan in scans.iter() {
            scan(emit);
        }
    }
}

/// An address on the caller's stack frame, used to bound stack walks.
#[inline(never)]
pub fn approximate_stack_pointer() -> usize {
    let mut slot = 0usize;
    &mut slot as *mut usize as usize
}

/// Walks the calling thread's stack from the current frame up to
/// `stack_base` (captured when the thread attached) and emits every word
/// that resolves to a managed object, decoding tagged values through the
/// configured decoder on the way.
pub fn scan_thread_stack(heap: &Heap, stack_base: usize, emit: &mut dyn FnMut(GcRef)) {
    let word = size_of::<usize>();
    let top = (approximate_stack_pointer() + word - 1) & !(word - 1);
    if top >= stack_base {
        return;
    }

    let decoder = heap.value_decoder();
    let mut addr = top;
    while addr < stack_base {
        let value = unsafe { std::ptr::read_volatile(addr as *const usize) };
        if let Some(decoder) = decoder {
            if let Some(decoded) = decoder(value) {
                consider(heap, decoded, emit);
            }
        }
        consider(heap, value, emit);
        addr += word;
    }
}

/// Tries one pointer candidate against the region registry and the
/// large-object set.
pub fn consider(heap: &Heap, ptr: usize, emit: &mut dyn FnMut(GcRef)) {
    if ptr == 0 {
        return;
    }
    if let Some(cell) = heap.find_cell(ptr) {
        let header = unsafe { &*cell };
        if header.is_in_use() {
            emit(unsafe { GcRef::from_addr(cell as usize) });
        }
    } else if heap.is_large_object(ptr) {
        emit(unsafe { GcRef::from_addr(ptr) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn callbacks_run_in_registration_order_and_repeat() {
        let registry = RootScanRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            registry.register(Box::new(move |_emit| {
                calls.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let mut sink = |_r: GcRef| {};
        registry.for_each(&mut sink);
        registry.for_each(&mut sink);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn stack_pointer_moves_down_the_stack() {
        fn deeper() -> usize {
            approximate_stack_pointer()
        }
        let here = approximate_stack_pointer();
        let there = deeper();
        assert_ne!(here, 0);
        assert_ne!(there, 0);
    }
}
