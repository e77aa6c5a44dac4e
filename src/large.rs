//! Objects too big for the largest cell class.
//!
//! Each large object owns a malloc'd block holding its cell header and
//! payload, and is tracked in a process-wide set. The set is read on every
//! barrier address classification and conservative scan word, and written
//! only on allocation and during the sweep phases, so it sits behind a
//! read/write lock.

use std::mem::size_of;

use hashbrown::HashSet;
use parking_lot::RwLock;

use crate::cell::{construct_object, CellHeader, Color, Gc, GcRef, HeapObject};

pub struct LargeObjectSet {
    set: RwLock<HashSet<usize>>,
}

impl LargeObjectSet {
    pub fn new() -> Self {
        Self {
            set: RwLock::new(HashSet::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.set.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.read().is_empty()
    }

    /// Whether `ptr` is the cell address of a tracked large object.
    #[inline]
    pub fn contains(&self, ptr: usize) -> bool {
        self.set.read().contains(&ptr)
    }

    /// Tracks an externally allocated large object.
    pub fn register(&self, object: GcRef) {
        assert!(object.is_in_use(), "can only register a live object");
        assert!(object.is_large(), "object is not flagged large");
        self.set.write().insert(object.addr());
    }

    /// Allocates and tracks a large `T` with `extra` trailing payload bytes.
    ///
    /// Large objects are born DARK: unlike region cells, which stay sheltered
    /// in their allocating thread's cached region, a fresh WHITE large object
    /// would be visible to a young sweep racing the mutator's next root
    /// report. The next full mark re-examines it like any other DARK object.
    pub fn allocate<T: HeapObject>(&self, value: T, extra: usize) -> Option<Gc<T>> {
        let size = size_of::<CellHeader>() + size_of::<T>() + extra;
        unsafe {
            let block = libc::malloc(size as _) as *mut CellHeader;
            if block.is_null() {
                return None;
            }
            let object = construct_object(block, true, value);
            object.set_color(Color::Dark);
            self.set.write().insert(object.addr());
            Some(Gc::from_ref(object))
        }
    }

    /// Young sweep: destroys WHITE large objects.
    pub fn sweep_young(&self) {
        let mut set = self.set.write();
        set.retain(|&addr| unsafe {
            let object = GcRef::from_addr(addr);
            if object.color() == Color::White {
                destroy_block(object);
                false
            } else {
                true
            }
        });
    }

    /// Full sweep: destroys WHITE and DARK large objects, folds BLACK back
    /// to DARK.
    pub fn sweep_full(&self) {
        let mut set = self.set.write();
        set.retain(|&addr| unsafe {
            let object = GcRef::from_addr(addr);
            match object.color() {
                Color::White | Color::Dark => {
                    destroy_block(object);
                    false
                }
                _ => {
                    let mut expected = Color::Black;
                    while expected == Color::Black
                        && !object.header().try_set_color(&mut expected, Color::Dark)
                    {}
                    true
                }
            }
        });
    }

    /// Destroys every tracked object. Used on heap teardown.
    pub fn free_all(&self) {
        let mut set = self.set.write();
        for &addr in set.iter() {
            unsafe { destroy_block(GcRef::from_addr(addr)) };
        }
        set.clear();
    }
}

unsafe fn destroy_block(object: GcRef) {
    object.destroy();
    libc::free(object.addr() as *mut _);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Big {
        dropped: Arc<AtomicUsize>,
    }

    impl HeapObject for Big {}

    impl Drop for Big {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn lifecycle_through_full_sweep() {
        let set = LargeObjectSet::new();
        let dropped = Arc::new(AtomicUsize::new(0));
        let object = set
            .allocate(
                Big {
                    dropped: dropped.clone(),
                },
                0,
            )
            .unwrap();

        let r = object.as_ref();
        assert!(set.contains(r.addr()));
        assert!(r.is_large());
        assert_eq!(r.color(), Color::Dark);

        // Young sweep only takes WHITE large objects.
        set.sweep_young();
        assert!(set.contains(r.addr()));

        // Survives a full cycle when marked BLACK, folded back to DARK.
        r.set_color(Color::Black);
        set.sweep_full();
        assert!(set.contains(r.addr()));
        assert_eq!(r.color(), Color::Dark);

        // Unreached (DARK) at the next full sweep: reclaimed.
        set.sweep_full();
        assert!(!set.contains(r.addr()));
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn young_sweep_takes_white() {
        let set = LargeObjectSet::new();
        let dropped = Arc::new(AtomicUsize::new(0));
        let object = set
            .allocate(
                Big {
                    dropped: dropped.clone(),
                },
                0,
            )
            .unwrap();
        object.as_ref().set_color(Color::White);
        set.sweep_young();
        assert!(set.is_empty());
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }
}
