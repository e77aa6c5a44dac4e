//! # meteor
//!
//! A concurrent, generational, region-based garbage collection library for
//! implementing VMs in Rust.
//!
//! The heap is carved into self-aligned power-of-two regions, each serving
//! one cell size class. Mutator threads bump-allocate out of thread-cached
//! regions and hand exhausted regions to the collector. Collection is
//! tri-color and mostly concurrent:
//!
//! - **Young cycles** promote reachable young (WHITE) objects to DARK and
//!   recycle the rest, pausing the mutators only to re-scan roots and drain
//!   the grey queue.
//! - **Full cycles** re-examine the DARK survivors as well, so garbage that
//!   aged out of the young set is eventually found.
//!
//! Mutators cooperate through a safepoint inside the allocation fast path
//! and through write barriers on reference stores; a scheduler thread
//! watches allocation pressure and drives cycles.
//!
//! ```no_run
//! use meteor::{Config, Gc, GcRef, Heap, HeapObject, ThreadAllocator};
//!
//! struct Node {
//!     next: Option<Gc<Node>>,
//! }
//!
//! impl HeapObject for Node {
//!     fn scan(&self, emit: &mut dyn FnMut(GcRef)) {
//!         if let Some(next) = self.next {
//!             emit(next.as_ref());
//!         }
//!     }
//! }
//!
//! let heap = Heap::new(Config::default());
//! let mut allocator = ThreadAllocator::new(heap.clone());
//! let node = allocator.allocate_auto(Node { next: None }).unwrap();
//! let head = allocator.allocate_auto(Node { next: Some(node) }).unwrap();
//! meteor::barrier::barrier_static(&heap, head.as_ref(), Some(node.as_ref()));
//! ```

pub mod allocator;
pub mod barrier;
pub mod cell;
pub mod config;
pub mod error;
pub mod heap;
pub mod large;
pub mod list;
pub mod mmap;
pub mod pool;
pub mod queue;
pub mod region;
pub mod registry;
pub mod roots;
pub mod scheduler;

pub use allocator::ThreadAllocator;
pub use cell::{Color, Gc, GcRef, HeapObject};
pub use config::Config;
pub use error::HeapError;
pub use heap::{GcPhase, Heap};
