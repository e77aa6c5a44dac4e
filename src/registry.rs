//! The global region registry.
//!
//! Two pieces: a lock-free level-hash set answering "is this address a live
//! region base" for the conservative scans and the slot barriers, and the
//! region factory with its bounded free-block cache. The set tolerates
//! concurrent insert and removal; a lookup racing a removal may miss, which
//! only makes a dying region invisible to a conservative root scan.

use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::cell::CellHeader;
use crate::config::Geometry;
use crate::error::HeapError;
use crate::list::{ForwardList, ForwardNode};
use crate::mmap;
use crate::region::Region;

const LEVEL_SIZE: usize = 512;
const LEVEL_WIDTH: u32 = 9;
const LEVEL_COUNT: usize = ((usize::BITS + LEVEL_WIDTH - 1) / LEVEL_WIDTH) as usize;

struct LevelTable {
    slots: [AtomicUsize; LEVEL_SIZE],
}

impl LevelTable {
    fn new_boxed() -> Box<LevelTable> {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicUsize = AtomicUsize::new(0);
        Box::new(LevelTable {
            slots: [ZERO; LEVEL_SIZE],
        })
    }
}

#[inline(always)]
fn is_table(value: usize) -> bool {
    value & 1 != 0
}

#[inline(always)]
fn table_of(value: usize) -> *mut LevelTable {
    (value & !1) as *mut LevelTable
}

#[inline(always)]
fn sub_hash(hash: usize, level: usize) -> usize {
    if level == LEVEL_COUNT - 1 {
        // The final level indexes by the top bits; continuing the
        // bottom-up walk would reach it with a single live bit.
        hash >> (usize::BITS - LEVEL_WIDTH)
    } else {
        (hash >> (level as u32 * LEVEL_WIDTH)) & (LEVEL_SIZE - 1)
    }
}

/// Lock-free hash set of region base addresses. Never shrinks: emptied
/// sub-tables stay in place for the lifetime of the set.
pub struct LevelHashSet {
    root: Box<LevelTable>,
    region_size_log2: u32,
}

impl LevelHashSet {
    pub fn new(geometry: &Geometry) -> Self {
        Self {
            root: LevelTable::new_boxed(),
            region_size_log2: geometry.region_size_log2(),
        }
    }

    /// Region bases have their low bits clear, so fold the top bits down to
    /// keep the first levels of the walk meaningful. The fold is injective
    /// on aligned addresses.
    #[inline(always)]
    fn hash(&self, addr: usize) -> usize {
        addr | (addr >> (usize::BITS - self.region_size_log2))
    }

    pub fn add(&self, addr: usize) -> bool {
        assert!(addr != 0 && !is_table(addr), "unusable region address");
        self.insert(&self.root, 0, addr, self.hash(addr))
    }

    fn insert(&self, table: &LevelTable, level: usize, addr: usize, hash: usize) -> bool {
        let slot = &table.slots[sub_hash(hash, level)];
        if level == LEVEL_COUNT - 1 {
            let prev = slot.swap(addr, Ordering::SeqCst);
            assert!(prev == 0 || prev == addr, "region hash is not unique");
            return prev == 0;
        }

        let mut current = slot.load(Ordering::Acquire);
        loop {
            if is_table(current) {
                return self.insert(unsafe { &*table_of(current) }, level + 1, addr, hash);
            }
            if current == addr {
                return false;
            }
            if current == 0 {
                match slot.compare_exchange(0, addr, Ordering::SeqCst, Ordering::Acquire) {
                    Ok(_) => return true,
                    Err(found) => {
                        current = found;
                        continue;
                    }
                }
            }

            // Slot taken by a different region: push both one level down.
            let sub = LevelTable::new_boxed();
            self.insert(&sub, level + 1, current, self.hash(current));
            self.insert(&sub, level + 1, addr, hash);
            let sub_ptr = Box::into_raw(sub);
            match slot.compare_exchange(
                current,
                sub_ptr as usize | 1,
                Ordering::SeqCst,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(found) => {
                    unsafe { free_table(sub_ptr) };
                    current = found;
                }
            }
        }
    }

    pub fn remove(&self, addr: usize) -> bool {
        let hash = self.hash(addr);
        let mut table: &LevelTable = &self.root;
        let mut level = 0;
        loop {
            let slot = &table.slots[sub_hash(hash, level)];
            let current = slot.load(Ordering::Acquire);
            if is_table(current) {
                table = unsafe { &*table_of(current) };
                level += 1;
                continue;
            }
            if current != addr {
                return false;
            }
            if slot
                .compare_exchange(addr, 0, Ordering::SeqCst, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
            // The slot changed under us; re-examine it.
        }
    }

    pub fn has(&self, addr: usize) -> bool {
        if addr == 0 || is_table(addr) {
            return false;
        }
        let hash = self.hash(addr);
        let mut table: &LevelTable = &self.root;
        for level in 0..LEVEL_COUNT {
            let current = table.slots[sub_hash(hash, level)].load(Ordering::Acquire);
            if is_table(current) {
                table = unsafe { &*table_of(current) };
                continue;
            }
            return current == addr;
        }
        false
    }
}

unsafe fn free_table(table: *mut LevelTable) {
    for slot in &(*table).slots {
        let value = slot.load(Ordering::Relaxed);
        if is_table(value) {
            free_table(table_of(value));
        }
    }
    drop(Box::from_raw(table));
}

impl Drop for LevelHashSet {
    fn drop(&mut self) {
        for slot in &self.root.slots {
            let value = slot.load(Ordering::Relaxed);
            if is_table(value) {
                unsafe { free_table(table_of(value)) };
            }
        }
    }
}

/// A region-sized block parked in the free-region cache. Overlaid at the
/// block base between uses.
pub struct CachedBlock {
    next: AtomicPtr<CachedBlock>,
}

impl ForwardNode for CachedBlock {
    fn next_link(&self) -> &AtomicPtr<CachedBlock> {
        &self.next
    }
}

/// Region factory and membership authority.
pub struct RegionRegistry {
    set: LevelHashSet,
    geometry: Geometry,
    max_region_count: usize,
    cache_bound: usize,
    cache: ForwardList<CachedBlock>,
    total: AtomicUsize,
}

impl RegionRegistry {
    pub fn new(geometry: Geometry, max_region_count: usize, cache_bound: usize) -> Self {
        Self {
            set: LevelHashSet::new(&geometry),
            geometry,
            max_region_count,
            cache_bound,
            cache: ForwardList::new(),
            total: AtomicUsize::new(0),
        }
    }

    pub fn total_region_count(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Creates (or recycles) a zeroed region of the requested level and
    /// registers it. Fails once the configured region cap is reached.
    pub fn region_new(&self, level: usize) -> Result<*mut Region, HeapError> {
        let live = self.total.fetch_add(1, Ordering::SeqCst);
        if live >= self.max_region_count {
            self.total.fetch_sub(1, Ordering::SeqCst);
            return Err(HeapError::Exhausted { live_regions: live });
        }

        let size = self.geometry.region_size();
        let base = match self.cache.pop() {
            Some(block) => {
                let base = block as *mut u8;
                // Dead cells keep their property bytes; a recycled block
                // must look untouched at any level.
                unsafe { std::ptr::write_bytes(base, 0, size) };
                base
            }
            None => mmap::alloc_aligned(size, size),
        };
        if base.is_null() {
            self.total.fetch_sub(1, Ordering::SeqCst);
            return Err(HeapError::Exhausted { live_regions: live });
        }

        let region = unsafe { Region::init(base, level, &self.geometry) };
        self.set.add(base as usize);
        Ok(region)
    }

    /// Unregisters and destroys a region, caching the block when the cache
    /// has room.
    ///
    /// # Safety
    /// `region` must be off every list with no mutator references into it.
    pub unsafe fn region_delete(&self, region: *mut Region) {
        let base = (*region).base();
        self.set.remove(base);
        self.total.fetch_sub(1, Ordering::SeqCst);
        (*region).free_all();

        if self.cache.count() >= self.cache_bound {
            mmap::free_aligned(base as *mut u8, self.geometry.region_size());
        } else {
            let block = base as *mut CachedBlock;
            block.write(CachedBlock {
                next: AtomicPtr::new(null_mut()),
            });
            self.cache.push(block);
        }
    }

    /// Resolves an arbitrary pointer to its region and enclosing cell, when
    /// the pointer falls inside a registered region's cell area.
    pub fn find_cell(&self, ptr: usize) -> Option<*mut CellHeader> {
        let region = self.find_region(ptr)?;
        unsafe { (*region).cell_containing(ptr) }
    }

    /// Resolves an arbitrary pointer to its registered region.
    pub fn find_region(&self, ptr: usize) -> Option<*mut Region> {
        let base = self.geometry.region_of_pointer(ptr);
        if self.set.has(base) {
            Some(base as *mut Region)
        } else {
            None
        }
    }
}

impl Drop for RegionRegistry {
    fn drop(&mut self) {
        while let Some(block) = self.cache.pop() {
            mmap::free_aligned(block as *mut u8, self.geometry.region_size());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn set() -> LevelHashSet {
        LevelHashSet::new(&Geometry::new(&Config::default()))
    }

    #[test]
    fn add_has_remove() {
        let set = set();
        let a = 0x7f00_0020_0000usize;
        let b = 0x7f00_0040_0000usize;
        assert!(!set.has(a));
        assert!(set.add(a));
        assert!(!set.add(a));
        assert!(set.has(a));
        assert!(!set.has(b));
        assert!(set.add(b));
        assert!(set.remove(a));
        assert!(!set.has(a));
        assert!(set.has(b));
        assert!(!set.remove(a));
    }

    #[test]
    fn colliding_addresses_split_levels() {
        let set = set();
        // Same low bits after the region shift for the first levels.
        let addrs: Vec<usize> = (1..64).map(|i| i << 21).collect();
        for &addr in &addrs {
            assert!(set.add(addr));
        }
        for &addr in &addrs {
            assert!(set.has(addr), "lost {addr:#x}");
        }
        for &addr in &addrs {
            assert!(set.remove(addr));
            assert!(!set.has(addr));
        }
    }

    #[test]
    fn last_level_indexes_by_the_top_bits() {
        // The sequential formula would leave the final level one live bit.
        assert_eq!(sub_hash(1 << 63, LEVEL_COUNT - 1), 256);
        assert_eq!(sub_hash(1 << 62, LEVEL_COUNT - 1), 128);
        assert_ne!(
            sub_hash(1 << 62, LEVEL_COUNT - 1),
            sub_hash(0, LEVEL_COUNT - 1)
        );

        // Addresses agreeing on bits 0..=53 and differing only in their top
        // bits must stay distinct members.
        let shared = 0x2aaa_aaa0_0000usize;
        let high_a = shared | (1 << 63);
        let high_b = shared | (1 << 62);
        let set = set();
        assert!(set.add(shared));
        assert!(set.add(high_a));
        assert!(set.add(high_b));
        assert!(set.has(shared) && set.has(high_a) && set.has(high_b));
        assert!(set.remove(high_a));
        assert!(!set.has(high_a));
        assert!(set.has(shared) && set.has(high_b));
        assert!(set.remove(shared));
        assert!(set.remove(high_b));
    }

    #[test]
    fn concurrent_membership_is_stable() {
        use std::sync::Arc;
        let set = Arc::new(set());
        let mut handles = vec![];
        for t in 0..4usize {
            let set = set.clone();
            handles.push(std::thread::spawn(move || {
                let base = (t + 1) << 40;
                for i in 0..256usize {
                    let addr = base + (i << 21);
                    assert!(set.add(addr));
                    assert!(set.has(addr));
                }
                for i in 0..256usize {
                    let addr = base + (i << 21);
                    assert!(set.remove(addr));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn registry_recycles_blocks_through_the_cache() {
        let geometry = Geometry::new(&Config::default());
        let registry = RegionRegistry::new(geometry, 8, 4);
        let region = registry.region_new(3).unwrap();
        let base = unsafe { (*region).base() };
        assert_eq!(registry.total_region_count(), 1);
        assert!(registry.find_region(base + 100).is_some());

        unsafe { registry.region_delete(region) };
        assert_eq!(registry.total_region_count(), 0);
        assert!(registry.find_region(base + 100).is_none());

        // The cached block comes back, reinitialized for a new level.
        let again = registry.region_new(0).unwrap();
        assert_eq!(unsafe { (*again).base() }, base);
        assert_eq!(unsafe { (*again).level() }, 0);
        unsafe { registry.region_delete(again) };
    }

    #[test]
    fn region_cap_reports_exhaustion() {
        let geometry = Geometry::new(&Config::default());
        let registry = RegionRegistry::new(geometry, 2, 2);
        let a = registry.region_new(0).unwrap();
        let b = registry.region_new(0).unwrap();
        assert!(matches!(
            registry.region_new(0),
            Err(HeapError::Exhausted { live_regions: 2 })
        ));
        unsafe {
            registry.region_delete(a);
            registry.region_delete(b);
        }
    }
}
