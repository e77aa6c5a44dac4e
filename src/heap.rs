//! # The collector core
//!
//! Tri-color, generational, region-based concurrent collection. Mutators
//! bump-allocate WHITE objects out of thread-cached regions; full regions
//! accumulate on the full list. Two cycles share one marking machinery:
//!
//! ## Young collection
//! Marking promotes reachable WHITE objects to DARK, concurrently with the
//! mutators; every mutator reports its roots at its next safepoint. A short
//! stop-the-world re-scans registered roots and drains the grey queue, the
//! full list is stolen onto the cleaning list, and sweeping reclaims WHITE
//! cells concurrently while the world runs again.
//!
//! ## Full collection
//! Marking re-examines DARK survivors as well (DARK and WHITE both go GREY,
//! scanned objects turn BLACK), so garbage that aged into the old set is
//! found. The sweep reclaims everything not BLACK, folds BLACK back to DARK,
//! and rebuilds the freelists of regions that crossed the cycle on a free
//! list.
//!
//! The write barrier keeps the strong invariant: a DARK or BLACK object is
//! re-greyed when a WHITE reference (or, during full mark, a DARK one) is
//! stored into it.
//!
//! Marking is given a bounded tolerance; if the concurrent phase does not
//! finish in time, the collector escalates to stop-the-world and completes
//! the drain under exclusive access. This keeps the pause short in the
//! common case without risking an unbounded concurrent phase.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use atomic::Atomic;
use parking_lot::{lock_api::RawRwLock as RawRwLockApi, Condvar, Mutex, RawRwLock};

use crate::cell::{CellHeader, Color, GcRef};
use crate::config::{Config, Geometry, MARK_TOLERANCE, WORKER_BALANCE_FACTOR, WORK_QUEUE_CAPACITY};
use crate::error::HeapError;
use crate::large::LargeObjectSet;
use crate::list::ForwardList;
use crate::pool::{Task, ThreadPool};
use crate::queue::BoundedQueue;
use crate::region::Region;
use crate::registry::RegionRegistry;
use crate::roots::RootScanRegistry;
use crate::scheduler::GcScheduler;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum GcPhase {
    Idle,
    YoungMark,
    YoungFinishMark,
    YoungSweep,
    FullMark,
    FullFinishMark,
    FullSweep,
    Exit,
}

pub struct Heap {
    config: Config,
    geometry: Geometry,
    registry: RegionRegistry,

    free_lists: Box<[ForwardList<Region>]>,
    remarking_lists: Box<[ForwardList<Region>]>,
    full_list: ForwardList<Region>,
    cleaning_list: ForwardList<Region>,
    full_cleaning_list: ForwardList<Region>,

    roots: RootScanRegistry,
    large: LargeObjectSet,

    work_queue: BoundedQueue<GcRef>,
    gathering_workers: AtomicUsize,

    total_threads: AtomicUsize,
    reported_threads: AtomicUsize,
    waiting_threads: AtomicUsize,
    gc_round: AtomicUsize,

    // Stop-the-world. Mutators hold `running` shared while active; the
    // collector holds `waiting` exclusively while the world runs and trades
    // it for `running` across a pause.
    pause_requested: AtomicBool,
    running: RawRwLock,
    waiting: RawRwLock,
    wakeup_mutex: Mutex<()>,
    wakeup_cv: Condvar,
    world_stopped: Mutex<Option<Instant>>,

    should_gc_mutex: Mutex<()>,
    should_gc_cv: Condvar,
    young_requested: AtomicBool,
    full_requested: AtomicBool,

    phase: Atomic<GcPhase>,
    should_exit: AtomicBool,
    // Keeps finish-mark workers alive until the stop-the-world root
    // re-scan has finished feeding the queue.
    stw_rescan_pending: AtomicBool,

    scheduler: Mutex<GcScheduler>,
    pool: ThreadPool,
    management: Mutex<Option<JoinHandle<()>>>,
}

unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    pub fn new(config: Config) -> Arc<Heap> {
        let geometry = Geometry::new(&config);
        let level_nr = geometry.level_nr();
        let make_lists = || {
            (0..level_nr)
                .map(|_| ForwardList::new())
                .collect::<Vec<_>>()
                .into_boxed_slice()
        };

        let heap = Arc::new(Heap {
            geometry,
            registry: RegionRegistry::new(geometry, config.max_region_count, config.free_region_cache),
            free_lists: make_lists(),
            remarking_lists: make_lists(),
            full_list: ForwardList::new(),
            cleaning_list: ForwardList::new(),
            full_cleaning_list: ForwardList::new(),
            roots: RootScanRegistry::new(),
            large: LargeObjectSet::new(),
            work_queue: BoundedQueue::new(WORK_QUEUE_CAPACITY),
            gathering_workers: AtomicUsize::new(0),
            total_threads: AtomicUsize::new(0),
            reported_threads: AtomicUsize::new(0),
            waiting_threads: AtomicUsize::new(0),
            gc_round: AtomicUsize::new(0),
            pause_requested: AtomicBool::new(false),
            running: RawRwLock::INIT,
            waiting: RawRwLock::INIT,
            wakeup_mutex: Mutex::new(()),
            wakeup_cv: Condvar::new(),
            world_stopped: Mutex::new(None),
            should_gc_mutex: Mutex::new(()),
            should_gc_cv: Condvar::new(),
            young_requested: AtomicBool::new(false),
            full_requested: AtomicBool::new(false),
            phase: Atomic::new(GcPhase::Idle),
            should_exit: AtomicBool::new(false),
            stw_rescan_pending: AtomicBool::new(false),
            scheduler: Mutex::new(GcScheduler::new(&config)),
            pool: ThreadPool::new(config.worker_count),
            management: Mutex::new(None),
            config,
        });

        let management = {
            // Holding an Arc here would keep the heap alive forever. The
            // raw pointer stays valid because dropping the heap joins this
            // thread before the allocation is released.
            struct HeapPtr(*const Heap);
            unsafe impl Send for HeapPtr {}
            let ptr = HeapPtr(Arc::as_ptr(&heap));
            std::thread::Builder::new()
                .name("gc-management".into())
                .spawn(move || {
                    let ptr = ptr;
                    unsafe { (*ptr.0).management_loop() }
                })
                .expect("failed to spawn gc management thread")
        };
        *heap.management.lock() = Some(management);
        heap
    }

    // ---- observation --------------------------------------------------

    #[inline(always)]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn total_region_count(&self) -> usize {
        self.registry.total_region_count()
    }

    pub fn full_list_count(&self) -> usize {
        self.full_list.count()
    }

    pub fn young_cleaning_count(&self) -> usize {
        self.cleaning_list.count()
    }

    pub fn full_cleaning_count(&self) -> usize {
        self.full_cleaning_list.count()
    }

    pub fn large_object_count(&self) -> usize {
        self.large.len()
    }

    pub fn current_phase(&self) -> GcPhase {
        self.phase.load(Ordering::SeqCst)
    }

    pub fn gc_round(&self) -> usize {
        self.gc_round.load(Ordering::Acquire)
    }

    pub fn total_mutator_count(&self) -> usize {
        self.total_threads.load(Ordering::SeqCst)
    }

    pub fn waiting_mutator_count(&self) -> usize {
        self.waiting_threads.load(Ordering::SeqCst)
    }

    pub fn work_queue_count(&self) -> usize {
        self.work_queue.count()
    }

    /// Resolves a pointer to the cell it falls in, if it lands inside a
    /// registered region's cell area.
    pub(crate) fn find_cell(&self, ptr: usize) -> Option<*mut CellHeader> {
        self.registry.find_cell(ptr)
    }

    /// Whether `ptr` is the address of a tracked large object.
    pub fn is_large_object(&self, ptr: usize) -> bool {
        self.large.contains(ptr)
    }

    pub(crate) fn large_set(&self) -> &LargeObjectSet {
        &self.large
    }

    pub(crate) fn value_decoder(&self) -> Option<crate::config::ValueDecoder> {
        self.config.value_decoder
    }

    /// Takes custody of a region that lost its owner (a detaching thread's
    /// cached region). It joins the full list and is collected normally.
    pub(crate) fn surrender_region(&self, region: *mut Region) {
        unsafe { self.full_list.push(region) };
    }

    /// Tracks an oversized object the runtime allocated on its own.
    pub fn register_large(&self, object: GcRef) {
        self.large.register(object);
    }

    // ---- region supply ------------------------------------------------

    /// Hands out a region of the requested level: a remarked leftover from
    /// the last full cycle, a free-list region, or a fresh one. Requests a
    /// young collection when supply runs low.
    pub(crate) fn get_free_region(&self, level: usize) -> Result<*mut Region, HeapError> {
        if let Some(region) = self.remarking_lists[level].pop() {
            unsafe {
                (*region).remark();
                self.free_lists[level].push(region);
            }
        }

        let region = match self.free_lists[level].pop() {
            Some(region) => {
                if self.free_lists[level].count() < 2 {
                    self.request_young_gc();
                }
                region
            }
            None => {
                self.request_young_gc();
                match self.registry.region_new(level) {
                    Ok(region) => region,
                    Err(error) => {
                        // At the cap; only a full collection can help now.
                        self.request_full_gc();
                        return Err(error);
                    }
                }
            }
        };

        assert_eq!(
            unsafe { (*region).level() },
            level,
            "free-list region has the wrong level"
        );
        Ok(region)
    }

    /// Publishes an exhausted region to the full list and replaces it.
    pub(crate) fn commit_full_region(&self, region: *mut Region) -> Result<*mut Region, HeapError> {
        log::trace!("commit full region {:p}", region);
        let level = unsafe { (*region).level() };
        unsafe { self.full_list.push(region) };
        self.get_free_region(level)
    }

    // ---- marking entry points -----------------------------------------

    /// Forces `object` onto the grey set. The entry point for root
    /// reporting and for barrier re-greying.
    pub fn remember(&self, object: GcRef) {
        assert!(object.is_in_use(), "can only remember a live object");
        self.mark_grey_and_enqueue(object);
    }

    fn mark_grey_and_enqueue(&self, object: GcRef) {
        let queue_count = self.work_queue.count();
        if queue_count as f64
            > self.work_queue.capacity() as f64 * self.config.young_queue_high_watermark
        {
            self.request_young_gc();
        }

        let prior = object.set_color(Color::Grey);
        if prior == Color::White {
            if !object.is_large() {
                unsafe {
                    (*self.region_of(object)).increase_old_object_count();
                }
            }
            self.work_queue.enqueue(object);
        } else if prior != Color::Grey {
            // DARK or BLACK: enqueue anyway so a full mark re-examines it.
            self.work_queue.enqueue(object);
        }
    }

    #[inline(always)]
    fn region_of(&self, object: GcRef) -> *mut Region {
        self.geometry.region_of_pointer(object.addr()) as *mut Region
    }

    /// The write barrier proper; see [`crate::barrier`] for the slot-address
    /// entry points.
    pub fn write_barrier(&self, target: GcRef, reference: Option<GcRef>) {
        let reference = match reference {
            Some(r) => r,
            None => return,
        };
        assert!(target.is_in_use(), "barrier target must be in use");
        assert!(reference.is_in_use(), "barrier reference must be in use");

        if reference.color() == Color::White {
            let target_color = target.color();
            if target_color == Color::Dark || target_color == Color::Black {
                self.mark_grey_and_enqueue(target);
            }
            return;
        }

        // During full mark an unscanned DARK subgraph can end up reachable
        // only through an already-scanned target; re-grey the target so the
        // subgraph is re-examined instead of reclaimed.
        if self.phase.load(Ordering::SeqCst) == GcPhase::FullMark
            && reference.color() == Color::Dark
        {
            let target_color = target.color();
            if target_color == Color::Dark || target_color == Color::Black {
                self.mark_grey_and_enqueue(target);
            }
        }
    }

    // ---- roots --------------------------------------------------------

    /// Registers a root-scan callback. It receives an emit function and must
    /// invoke it once per root reference it owns; it may be called twice in
    /// one cycle (concurrent mark and the stop-the-world re-scan).
    pub fn register_root_scan(
        &self,
        scan: impl Fn(&mut dyn FnMut(GcRef)) + Send + Sync + 'static,
    ) {
        self.roots.register(Box::new(scan));
    }

    // ---- gc requests --------------------------------------------------

    pub fn request_young_gc(&self) {
        if self.full_list.count() == 0 {
            return;
        }
        self.young_requested.store(true, Ordering::Relaxed);
        self.should_gc_cv.notify_one();
    }

    pub fn request_full_gc(&self) {
        if self.full_list.count() == 0 {
            return;
        }
        self.full_requested.store(true, Ordering::Relaxed);
        self.should_gc_cv.notify_one();
    }

    // ---- mutator attach / safepoint support ----------------------------

    pub(crate) fn attach_mutator(&self) {
        self.running.lock_shared();
        self.total_threads.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn detach_mutator(&self) {
        self.total_threads.fetch_sub(1, Ordering::SeqCst);
        unsafe { self.running.unlock_shared() };
    }

    #[inline(always)]
    pub(crate) fn pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::Acquire)
    }

    pub(crate) fn note_thread_reported(&self) {
        self.reported_threads.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn note_thread_attached_reported(&self) {
        // A thread re-entering the mutator population mid-cycle reported its
        // roots when it left; count it so the mark phase can terminate.
        self.reported_threads.fetch_add(1, Ordering::SeqCst);
    }

    fn all_mutators_reported(&self) -> bool {
        self.reported_threads.load(Ordering::SeqCst) >= self.total_threads.load(Ordering::SeqCst)
    }

    /// Parks the calling mutator until the collector resumes the world. The
    /// caller must hold the running lock shared and have reported its roots.
    pub(crate) fn wait_for_resume(&self) {
        self.waiting_threads.fetch_add(1, Ordering::SeqCst);
        unsafe { self.running.unlock_shared() };
        {
            let mut guard = self.wakeup_mutex.lock();
            while self.pause_requested.load(Ordering::SeqCst) {
                self.wakeup_cv.wait(&mut guard);
            }
        }
        self.waiting_threads.fetch_sub(1, Ordering::SeqCst);
        self.running.lock_shared();
    }

    // ---- stop the world -----------------------------------------------

    pub(crate) fn stop_the_world(&self) {
        if !self.pause_requested.swap(true, Ordering::SeqCst) {
            // Stragglers from the previous resume may still be waking up.
            while self.waiting_threads.load(Ordering::SeqCst) != 0 {
                std::thread::yield_now();
            }

            let begin = Instant::now();
            unsafe { self.waiting.unlock_exclusive() };
            self.running.lock_exclusive();
            *self.world_stopped.lock() = Some(Instant::now());
            log::debug!("world stopped in {:?}", begin.elapsed());

            assert_eq!(
                self.waiting_threads.load(Ordering::SeqCst),
                self.total_threads.load(Ordering::SeqCst),
                "a mutator is unaccounted for at the pause"
            );
        }
    }

    pub(crate) fn resume_the_world(&self) {
        if self.pause_requested.load(Ordering::SeqCst) {
            assert_eq!(
                self.waiting_threads.load(Ordering::SeqCst),
                self.total_threads.load(Ordering::SeqCst),
                "a mutator is unaccounted for at resume"
            );
            {
                let _guard = self.wakeup_mutex.lock();
                self.pause_requested.store(false, Ordering::SeqCst);
                self.wakeup_cv.notify_all();
            }
            unsafe { self.running.unlock_exclusive() };
            if let Some(stopped_at) = self.world_stopped.lock().take() {
                log::debug!("world resumed after {:?}", stopped_at.elapsed());
            }
            self.waiting.lock_exclusive();
        }
    }

    // ---- cycle driver -------------------------------------------------

    fn management_loop(&self) {
        self.waiting.lock_exclusive();

        let mut young = false;
        let mut full = false;
        while !self.should_exit.load(Ordering::SeqCst) {
            {
                let mut guard = self.should_gc_mutex.lock();
                self.should_gc_cv
                    .wait_for(&mut guard, self.config.monitor_interval);
            }
            self.evaluate_triggers(&mut young, &mut full);

            while !self.should_exit.load(Ordering::SeqCst) && (young || full) {
                let ran = if full { self.full_gc() } else { self.young_gc() };
                self.phase.store(GcPhase::Idle, Ordering::SeqCst);
                if !ran {
                    // Triggered but nothing to collect yet; go back to the
                    // tick instead of spinning on the same verdict.
                    break;
                }
                self.evaluate_triggers(&mut young, &mut full);
            }
        }

        self.phase.store(GcPhase::Exit, Ordering::SeqCst);
        unsafe { self.waiting.unlock_exclusive() };
        log::debug!("gc management shutdown");
    }

    fn evaluate_triggers(&self, young: &mut bool, full: &mut bool) {
        let mut scheduler = self.scheduler.lock();
        let region_count = self.total_region_count();
        scheduler.on_monitor(region_count);

        *young = self.young_requested.swap(false, Ordering::AcqRel)
            || scheduler.should_young_gc(
                region_count,
                self.work_queue.count(),
                self.work_queue.capacity(),
            );
        *full = self.full_requested.swap(false, Ordering::AcqRel)
            || scheduler.should_full_gc(region_count);

        self.reported_threads.store(0, Ordering::SeqCst);
    }

    /// Runs one young cycle. Returns false when there was nothing to
    /// collect (no full regions): no pause, no state change.
    fn young_gc(&self) -> bool {
        if self.full_list.count() == 0 {
            return false;
        }

        log::debug!(
            "young gc: total={} full={} old_cleaning={} queue={}",
            self.total_region_count(),
            self.full_list.count(),
            self.full_cleaning_list.count(),
            self.work_queue.count()
        );
        self.scheduler.lock().on_young_gc_start();
        self.gc_round.fetch_add(1, Ordering::SeqCst);

        let scan_ok = Cell::new(true);
        let ok = self.fire_phase_and_wait(GcPhase::YoungMark, true, || {
            scan_ok.set(self.scan_registered_roots(|heap, object| {
                if object.color() == Color::White {
                    heap.mark_grey_and_enqueue(object);
                }
            }));
        });
        if !ok || !scan_ok.get() {
            return self.abort_cycle("young mark");
        }

        self.stop_the_world();
        // The re-scan runs while the finish workers consume, so a large
        // root set cannot wedge on a full queue.
        self.stw_rescan_pending.store(true, Ordering::SeqCst);
        let ok = self.fire_phase_and_wait(GcPhase::YoungFinishMark, false, || {
            scan_ok.set(self.scan_registered_roots(|heap, object| heap.remember(object)));
            self.stw_rescan_pending.store(false, Ordering::SeqCst);
        });
        if !ok || !scan_ok.get() {
            return self.abort_cycle("young finish-mark");
        }
        assert_eq!(
            self.work_queue.count(),
            0,
            "grey queue must be drained at the end of marking"
        );

        self.cleaning_list.steal(&self.full_list);
        self.resume_the_world();

        let ok = self.fire_phase_and_wait(GcPhase::YoungSweep, false, || {
            self.large.sweep_young();
        });
        if !ok {
            return self.abort_cycle("young sweep");
        }

        self.scheduler
            .lock()
            .on_young_gc_end(self.total_region_count());
        log::debug!(
            "young gc done: total={} full={} old_cleaning={}",
            self.total_region_count(),
            self.full_list.count(),
            self.full_cleaning_list.count()
        );
        true
    }

    /// Runs one full cycle. Returns false when there was nothing to
    /// collect.
    fn full_gc(&self) -> bool {
        if self.full_list.count() == 0 {
            return false;
        }

        log::debug!(
            "full gc: total={} full={} old_cleaning={}",
            self.total_region_count(),
            self.full_list.count(),
            self.full_cleaning_list.count()
        );
        self.scheduler
            .lock()
            .on_full_gc_start(self.total_region_count());
        self.gc_round.fetch_add(1, Ordering::SeqCst);

        let scan_ok = Cell::new(true);
        let ok = self.fire_phase_and_wait(GcPhase::FullMark, true, || {
            scan_ok.set(self.scan_registered_roots(|heap, object| heap.remember(object)));
        });
        if !ok || !scan_ok.get() {
            return self.abort_cycle("full mark");
        }

        self.stop_the_world();
        self.stw_rescan_pending.store(true, Ordering::SeqCst);
        let ok = self.fire_phase_and_wait(GcPhase::FullFinishMark, false, || {
            scan_ok.set(self.scan_registered_roots(|heap, object| heap.remember(object)));
            self.stw_rescan_pending.store(false, Ordering::SeqCst);
        });
        if !ok || !scan_ok.get() {
            return self.abort_cycle("full finish-mark");
        }
        assert_eq!(
            self.work_queue.count(),
            0,
            "grey queue must be drained at the end of marking"
        );

        self.full_cleaning_list.steal(&self.full_list);
        for level in 0..self.geometry.level_nr() {
            assert_eq!(
                self.remarking_lists[level].count(),
                0,
                "remarking list should be empty between full cycles"
            );
            self.remarking_lists[level].steal(&self.free_lists[level]);
        }
        self.resume_the_world();

        let ok = self.fire_phase_and_wait(GcPhase::FullSweep, false, || {
            self.large.sweep_full();
        });
        if !ok {
            return self.abort_cycle("full sweep");
        }

        self.scheduler
            .lock()
            .on_full_gc_end(self.total_region_count());
        log::debug!(
            "full gc done: total={} full={} old_cleaning={}",
            self.total_region_count(),
            self.full_list.count(),
            self.full_cleaning_list.count()
        );
        true
    }

    fn abort_cycle(&self, during: &str) -> bool {
        log::error!("collection aborted: a worker or root callback failed during {during}");
        self.resume_the_world();
        true
    }

    /// Runs every registered root callback, containing panics so a
    /// misbehaving collaborator aborts the cycle instead of killing the
    /// management thread. Returns false on failure.
    fn scan_registered_roots(&self, visit: fn(&Heap, GcRef)) -> bool {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.roots.for_each(&mut |object| visit(self, object));
        }));
        result.is_ok()
    }

    fn fire_phase_and_wait(
        &self,
        phase: GcPhase,
        cannot_wait: bool,
        when_waiting: impl FnOnce(),
    ) -> bool {
        self.phase.store(phase, Ordering::SeqCst);
        // Workers never outlive this call: both wait branches below join
        // every task before returning.
        struct HeapPtr(*const Heap);
        unsafe impl Send for HeapPtr {}
        let tasks: Vec<Task> = (0..self.config.worker_count)
            .map(|_| {
                let heap = HeapPtr(self as *const Heap);
                self.pool.dispatch(move || {
                    let heap = heap;
                    unsafe { (*heap.0).run_worker(phase) }
                })
            })
            .collect();

        when_waiting();

        let mut ok = true;
        if cannot_wait {
            let mut escalated = false;
            for task in &tasks {
                if escalated {
                    ok &= task.wait().is_ok();
                    continue;
                }
                match task.wait_for(MARK_TOLERANCE) {
                    Some(result) => ok &= result.is_ok(),
                    None => {
                        log::debug!("mark tolerance exceeded, escalating to stop-the-world");
                        self.stop_the_world();
                        escalated = true;
                        ok &= task.wait().is_ok();
                    }
                }
            }
        } else {
            for task in &tasks {
                ok &= task.wait().is_ok();
            }
        }
        ok
    }

    fn run_worker(&self, phase: GcPhase) {
        match phase {
            GcPhase::YoungMark | GcPhase::YoungFinishMark => self.worker_mark(phase, false),
            GcPhase::FullMark | GcPhase::FullFinishMark => self.worker_mark(phase, true),
            GcPhase::YoungSweep => self.worker_young_sweep(),
            GcPhase::FullSweep => self.worker_full_sweep(),
            _ => unreachable!("no worker for phase {:?}", phase),
        }
    }

    // ---- workers ------------------------------------------------------

    /// One marking worker: gather a fair batch from the global queue,
    /// process locally, feed half back to keep the other workers busy.
    /// During the initial mark the phase also waits for every mutator to
    /// report its roots.
    fn worker_mark(&self, phase: GcPhase, full: bool) {
        let initial = matches!(phase, GcPhase::YoungMark | GcPhase::FullMark);
        let scanned = if full { Color::Black } else { Color::Dark };
        let mut local: VecDeque<GcRef> = VecDeque::new();

        loop {
            let queue_count = self.work_queue.count();
            if queue_count == 0
                && local.is_empty()
                && (!initial || self.all_mutators_reported())
                && !self.stw_rescan_pending.load(Ordering::SeqCst)
            {
                break;
            }

            let gathering = self.gathering_workers.fetch_add(1, Ordering::SeqCst);
            let mut batch = (queue_count + gathering) / (gathering + 1);
            while batch > 0 {
                match self.work_queue.try_dequeue() {
                    Some(object) => local.push_back(object),
                    None => break,
                }
                batch -= 1;
            }
            self.gathering_workers.fetch_sub(1, Ordering::SeqCst);

            if local.is_empty() {
                std::thread::yield_now();
                continue;
            }

            while !local.is_empty() {
                let mut to_process = WORKER_BALANCE_FACTOR;
                while to_process > 0 {
                    let object = match local.pop_front() {
                        Some(object) => object,
                        None => break,
                    };
                    to_process -= 1;

                    if object.set_color(scanned) == scanned {
                        continue;
                    }
                    unsafe {
                        object.scan(&mut |reference| {
                            self.visit_reference(reference, full, &mut local)
                        });
                    }
                }

                let mut feed_back = local.len() / 2;
                while feed_back > 0 {
                    let object = local.pop_front().expect("half of a non-empty queue");
                    if self.work_queue.try_enqueue(object).is_err() {
                        local.push_front(object);
                        break;
                    }
                    feed_back -= 1;
                }
            }
        }

        assert!(local.is_empty(), "worker exited with grey objects in hand");
    }

    fn visit_reference(&self, reference: GcRef, full: bool, local: &mut VecDeque<GcRef>) {
        assert!(reference.is_in_use(), "scanned a reference to a dead object");

        if full {
            let color = reference.color();
            if color != Color::White && color != Color::Dark {
                return;
            }
            let prior = reference.set_color(Color::Grey);
            match prior {
                Color::White => {
                    if !reference.is_large() {
                        unsafe {
                            (*self.region_of(reference)).increase_old_object_count();
                        }
                    }
                    local.push_back(reference);
                }
                Color::Grey => {}
                _ => local.push_back(reference),
            }
        } else {
            let mut color = reference.color();
            while color == Color::White {
                if reference.header().try_set_color(&mut color, Color::Grey) {
                    if !reference.is_large() {
                        unsafe {
                            (*self.region_of(reference)).increase_old_object_count();
                        }
                    }
                    local.push_back(reference);
                    break;
                }
            }
        }
    }

    fn worker_young_sweep(&self) {
        while let Some(region) = self.cleaning_list.pop() {
            unsafe {
                let survivors = (*region).young_sweep();
                if survivors == (*region).cell_count() {
                    // Completely old: only a full cycle can free anything
                    // here.
                    self.full_cleaning_list.push(region);
                } else {
                    self.free_lists[(*region).level()].push(region);
                }
            }
        }
    }

    fn worker_full_sweep(&self) {
        while let Some(region) = self.full_cleaning_list.pop() {
            unsafe {
                let survivors = (*region).full_sweep();
                if survivors == 0 {
                    self.registry.region_delete(region);
                } else {
                    self.remarking_lists[(*region).level()].push(region);
                }
            }
        }

        for level in 0..self.geometry.level_nr() {
            while let Some(region) = self.remarking_lists[level].pop() {
                unsafe {
                    (*region).remark();
                    self.free_lists[level].push(region);
                }
            }
        }
    }

    // ---- teardown -----------------------------------------------------

    /// Stops the management thread. The heap remains readable but collects
    /// nothing afterwards.
    pub fn shutdown(&self) {
        if !self.should_exit.swap(true, Ordering::SeqCst) {
            self.should_gc_cv.notify_all();
            if let Some(handle) = self.management.lock().take() {
                let _ = handle.join();
            }
            log::debug!("heap shutdown");
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.shutdown();
        unsafe {
            for level in 0..self.geometry.level_nr() {
                while let Some(region) = self.free_lists[level].pop() {
                    self.registry.region_delete(region);
                }
                while let Some(region) = self.remarking_lists[level].pop() {
                    self.registry.region_delete(region);
                }
            }
            while let Some(region) = self.full_list.pop() {
                self.registry.region_delete(region);
            }
            while let Some(region) = self.cleaning_list.pop() {
                self.registry.region_delete(region);
            }
            while let Some(region) = self.full_cleaning_list.pop() {
                self.registry.region_delete(region);
            }
        }
        self.large.free_all();
    }
}
