//! Cells, the object property word, and the managed object model.
//!
//! Every allocation unit inside a region is a cell. A cell starts with a
//! one-byte atomic property word encoding `in_use`, `is_large` and the
//! tri-color state; the collector only ever touches the color bits and does
//! so with CAS loops that preserve the rest of the byte.

use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};

pub const IS_IN_USE: u8 = 1 << 7;
pub const IS_LARGE: u8 = 1 << 6;
pub const COLOR_MASK: u8 = 0b11;

/// Tri-color state of a cell.
///
/// DARK is the resting color of survivors between collections; BLACK only
/// appears transiently while a full mark is running and is folded back to
/// DARK by the full sweep.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Color {
    White = 0,
    Grey = 1,
    Dark = 2,
    Black = 3,
}

impl Color {
    #[inline(always)]
    fn from_bits(bits: u8) -> Color {
        match bits & COLOR_MASK {
            0 => Color::White,
            1 => Color::Grey,
            2 => Color::Dark,
            _ => Color::Black,
        }
    }
}

/// Scans the payload at `data`, emitting every outgoing reference.
pub type ScanFn = unsafe fn(data: *const u8, emit: &mut dyn FnMut(GcRef));
/// Drops the payload at `data` in place.
pub type DropFn = unsafe fn(data: *mut u8);

/// Header prepended to every live heap object.
///
/// The scan and drop entry points are monomorphized per managed type and
/// written once at allocation; carrying them inline keeps the collector free
/// of any per-type registry.
#[repr(C)]
pub struct CellHeader {
    property: AtomicU8,
    scan_fn: ScanFn,
    drop_fn: DropFn,
}

/// A free slot in a region, linked through a single forward pointer into the
/// region's embedded freelist. Only the region's current owner walks it.
#[repr(C)]
pub struct EmptyCell {
    pub(crate) property: u8,
    pub(crate) next: *mut EmptyCell,
}

impl CellHeader {
    /// Writes a fresh in-use header in place. The color starts WHITE.
    ///
    /// # Safety
    /// `at` must point at writable cell memory not currently in use.
    pub unsafe fn construct(at: *mut CellHeader, large: bool, scan_fn: ScanFn, drop_fn: DropFn) {
        let property = if large { IS_IN_USE | IS_LARGE } else { IS_IN_USE };
        at.write(CellHeader {
            property: AtomicU8::new(property),
            scan_fn,
            drop_fn,
        });
    }

    #[inline(always)]
    pub fn is_in_use(&self) -> bool {
        self.property.load(Ordering::SeqCst) & IS_IN_USE != 0
    }

    #[inline(always)]
    pub fn is_large(&self) -> bool {
        self.property.load(Ordering::SeqCst) & IS_LARGE != 0
    }

    #[inline(always)]
    pub fn color(&self) -> Color {
        Color::from_bits(self.property.load(Ordering::SeqCst))
    }

    /// CAS the color from `expected` to `desired`, preserving the other
    /// property bits. On failure `expected` is updated to the color found.
    pub fn try_set_color(&self, expected: &mut Color, desired: Color) -> bool {
        let mut current = self.property.load(Ordering::SeqCst);
        loop {
            if Color::from_bits(current) != *expected {
                *expected = Color::from_bits(current);
                return false;
            }
            let wanted = (current & !COLOR_MASK) | desired as u8;
            match self
                .property
                .compare_exchange_weak(current, wanted, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(found) => current = found,
            }
        }
    }

    /// Sets the color unconditionally and returns the prior one.
    pub fn set_color(&self, desired: Color) -> Color {
        let mut expected = self.color();
        while !self.try_set_color(&mut expected, desired) {}
        expected
    }

    /// Clears the in-use bit, preserving everything else.
    pub fn set_not_in_use(&self) {
        let mut current = self.property.load(Ordering::SeqCst);
        loop {
            if current & IS_IN_USE == 0 {
                return;
            }
            match self.property.compare_exchange_weak(
                current,
                current & !IS_IN_USE,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(found) => current = found,
            }
        }
    }

    #[inline(always)]
    pub fn payload(&self) -> *mut u8 {
        (self as *const CellHeader as usize + size_of::<CellHeader>()) as *mut u8
    }
}

/// A managed heap object.
///
/// `scan` must emit every outgoing managed reference and nothing else. It is
/// invoked concurrently with mutator activity and may run on any collector
/// worker, but never twice concurrently for the same object. It must not
/// allocate.
///
/// Destructors run when the object is reclaimed; they may release only
/// untracked, non-GC resources and must not touch other managed objects.
pub trait HeapObject: Send + 'static {
    fn scan(&self, _emit: &mut dyn FnMut(GcRef)) {}
}

unsafe fn scan_shim<T: HeapObject>(data: *const u8, emit: &mut dyn FnMut(GcRef)) {
    (*(data as *const T)).scan(emit)
}

unsafe fn drop_shim<T: HeapObject>(data: *mut u8) {
    std::ptr::drop_in_place(data as *mut T)
}

pub(crate) fn scan_fn_of<T: HeapObject>() -> ScanFn {
    scan_shim::<T>
}

pub(crate) fn drop_fn_of<T: HeapObject>() -> DropFn {
    drop_shim::<T>
}

/// Writes a header and payload into raw cell memory and hands back the
/// object. Shared by the thread allocator and the large-object path.
///
/// # Safety
/// `cell` must point at writable memory of at least header + `T` bytes that
/// no live object occupies.
pub(crate) unsafe fn construct_object<T: HeapObject>(
    cell: *mut CellHeader,
    large: bool,
    value: T,
) -> GcRef {
    assert!(
        std::mem::align_of::<T>() <= std::mem::align_of::<CellHeader>(),
        "over-aligned managed types are not supported"
    );
    CellHeader::construct(cell, large, scan_fn_of::<T>(), drop_fn_of::<T>());
    std::ptr::write((*cell).payload() as *mut T, value);
    GcRef(NonNull::new_unchecked(cell))
}

/// Untyped handle to a live heap object; what the work queue, the barriers
/// and the root scans traffic in.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct GcRef(NonNull<CellHeader>);

unsafe impl Send for GcRef {}

impl GcRef {
    #[inline(always)]
    pub fn from_header(header: NonNull<CellHeader>) -> GcRef {
        GcRef(header)
    }

    /// # Safety
    /// `addr` must point at a constructed [`CellHeader`].
    #[inline(always)]
    pub unsafe fn from_addr(addr: usize) -> GcRef {
        GcRef(NonNull::new_unchecked(addr as *mut CellHeader))
    }

    #[inline(always)]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline(always)]
    pub fn header(&self) -> &CellHeader {
        unsafe { self.0.as_ref() }
    }

    #[inline(always)]
    pub fn color(self) -> Color {
        self.header().color()
    }

    #[inline(always)]
    pub fn set_color(self, desired: Color) -> Color {
        self.header().set_color(desired)
    }

    #[inline(always)]
    pub fn is_in_use(self) -> bool {
        self.header().is_in_use()
    }

    #[inline(always)]
    pub fn is_large(self) -> bool {
        self.header().is_large()
    }

    /// Enumerates the object's outgoing references.
    ///
    /// # Safety
    /// The object must be in use and no other scan of it may be running.
    pub unsafe fn scan(self, emit: &mut dyn FnMut(GcRef)) {
        let header = self.0.as_ref();
        (header.scan_fn)(header.payload(), emit)
    }

    /// Runs the payload destructor and clears the in-use bit. The cell
    /// memory itself is reclaimed by whoever owns it.
    ///
    /// # Safety
    /// The object must be in use and unreachable by any mutator.
    pub unsafe fn destroy(self) {
        let header = self.0.as_ref();
        (header.drop_fn)(header.payload());
        header.set_not_in_use();
    }
}

/// Typed handle to a managed `T`. Copyable; validity is guaranteed by the
/// collector as long as the object is reachable (objects never move).
pub struct Gc<T: HeapObject> {
    cell: NonNull<CellHeader>,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T: HeapObject> Send for Gc<T> {}

impl<T: HeapObject> Gc<T> {
    #[inline(always)]
    pub(crate) fn from_cell(cell: NonNull<CellHeader>) -> Gc<T> {
        Gc {
            cell,
            _marker: PhantomData,
        }
    }

    /// Reinterprets an untyped handle.
    ///
    /// # Safety
    /// The referent's payload must actually be a `T`.
    #[inline(always)]
    pub unsafe fn from_ref(r: GcRef) -> Gc<T> {
        Gc::from_cell(NonNull::new_unchecked(r.addr() as *mut CellHeader))
    }

    #[inline(always)]
    pub fn as_ref(self) -> GcRef {
        GcRef(self.cell)
    }
}

impl<T: HeapObject> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: HeapObject> Copy for Gc<T> {}

impl<T: HeapObject> Deref for Gc<T> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &T {
        unsafe { &*(self.cell.as_ref().payload() as *const T) }
    }
}

impl<T: HeapObject> DerefMut for Gc<T> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *(self.cell.as_ref().payload() as *mut T) }
    }
}

impl<T: HeapObject> std::fmt::Pointer for Gc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:p}", self.cell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_header() -> Box<CellHeader> {
        unsafe fn nop_scan(_: *const u8, _: &mut dyn FnMut(GcRef)) {}
        unsafe fn nop_drop(_: *mut u8) {}
        Box::new(CellHeader {
            property: AtomicU8::new(IS_IN_USE),
            scan_fn: nop_scan,
            drop_fn: nop_drop,
        })
    }

    #[test]
    fn color_transitions_preserve_flags() {
        let header = fresh_header();
        assert!(header.is_in_use());
        assert_eq!(header.color(), Color::White);

        assert_eq!(header.set_color(Color::Grey), Color::White);
        assert!(header.is_in_use());
        assert!(!header.is_large());
        assert_eq!(header.color(), Color::Grey);

        // Setting the same color again is a no-op returning that color.
        assert_eq!(header.set_color(Color::Grey), Color::Grey);
    }

    #[test]
    fn try_set_color_reports_the_actual_color() {
        let header = fresh_header();
        let mut expected = Color::Dark;
        assert!(!header.try_set_color(&mut expected, Color::Black));
        assert_eq!(expected, Color::White);
        assert!(header.try_set_color(&mut expected, Color::Black));
        assert_eq!(header.color(), Color::Black);
    }

    #[test]
    fn not_in_use_keeps_color() {
        let header = fresh_header();
        header.set_color(Color::Dark);
        header.set_not_in_use();
        assert!(!header.is_in_use());
        assert_eq!(header.color(), Color::Dark);
        // Idempotent.
        header.set_not_in_use();
        assert!(!header.is_in_use());
    }
}
