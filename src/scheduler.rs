//! Collection scheduling.
//!
//! Keeps a short history of cycle events and two EWMA rate estimators: how
//! fast the mutators consume regions and how fast a full mark processes
//! them. The full-GC trigger compares the predicted time until the heap
//! grows to its next trigger point against the predicted duration of a full
//! collection, with a small advance so collection finishes before the
//! growth lands.

use std::time::Instant;

use crate::config::Config;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EventKind {
    FullGcStart,
    FullGcEnd,
    YoungGcStart,
    YoungGcEnd,
}

#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub kind: EventKind,
    pub at: Instant,
}

/// Fixed-size ring of the most recent scheduler events.
pub struct EventHistory {
    ring: Vec<Option<Event>>,
    counter: usize,
}

impl EventHistory {
    fn new(size: usize) -> Self {
        Self {
            ring: vec![None; size.max(1)],
            counter: 0,
        }
    }

    fn push(&mut self, kind: EventKind) {
        let size = self.ring.len();
        self.ring[self.counter % size] = Some(Event {
            kind,
            at: Instant::now(),
        });
        self.counter += 1;
    }

    pub fn len(&self) -> usize {
        self.counter.min(self.ring.len())
    }

    pub fn is_empty(&self) -> bool {
        self.counter == 0
    }

    /// Recorded events, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        let size = self.ring.len();
        let start = self.counter.saturating_sub(size);
        (start..self.counter).filter_map(move |i| self.ring[i % size].as_ref())
    }
}

pub struct GcScheduler {
    history: EventHistory,
    ewma_factor: f64,
    max_region_count: usize,
    full_trigger_increment: f64,
    full_gc_advance: f64,
    queue_high_watermark: f64,

    region_count_after_last_young: usize,
    region_count_before_full: usize,
    region_count_after_full: usize,
    region_count_last_monitor: usize,
    last_monitor: Instant,
    full_start: Instant,

    /// Regions newly consumed per second, smoothed.
    alloc_rate: f64,
    /// Regions processed per second by a full collection, smoothed.
    full_mark_rate: f64,
}

impl GcScheduler {
    pub fn new(config: &Config) -> Self {
        let now = Instant::now();
        Self {
            history: EventHistory::new(config.scheduler_history),
            ewma_factor: config.ewma_factor,
            max_region_count: config.max_region_count,
            full_trigger_increment: config.full_trigger_increment,
            full_gc_advance: config.full_gc_advance,
            queue_high_watermark: config.young_queue_high_watermark,
            region_count_after_last_young: 0,
            region_count_before_full: 0,
            region_count_after_full: 0,
            region_count_last_monitor: 0,
            last_monitor: now,
            full_start: now,
            alloc_rate: 0.0,
            full_mark_rate: 0.0,
        }
    }

    fn update(value: &mut f64, sample: f64, factor: f64) {
        *value = *value * (1.0 - factor) + sample * factor;
    }

    pub fn history(&self) -> &EventHistory {
        &self.history
    }

    pub fn on_monitor(&mut self, region_count: usize) {
        let now = Instant::now();
        if self.region_count_last_monitor < region_count {
            let elapsed = now.duration_since(self.last_monitor).as_secs_f64();
            if elapsed > 0.0 {
                let sample = (region_count - self.region_count_last_monitor) as f64 / elapsed;
                Self::update(&mut self.alloc_rate, sample, self.ewma_factor);
            }
        }
        self.region_count_last_monitor = region_count;
        self.last_monitor = now;
    }

    pub fn on_young_gc_start(&mut self) {
        self.history.push(EventKind::YoungGcStart);
    }

    pub fn on_young_gc_end(&mut self, region_count: usize) {
        self.history.push(EventKind::YoungGcEnd);
        self.region_count_after_last_young = region_count;
    }

    pub fn on_full_gc_start(&mut self, region_count: usize) {
        self.history.push(EventKind::FullGcStart);
        self.region_count_before_full = region_count;
        self.full_start = Instant::now();
    }

    pub fn on_full_gc_end(&mut self, region_count: usize) {
        self.history.push(EventKind::FullGcEnd);
        self.region_count_after_full = region_count;

        let elapsed = self.full_start.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            let sample = self.region_count_before_full as f64 / elapsed;
            Self::update(&mut self.full_mark_rate, sample, self.ewma_factor);
        }
    }

    /// Young collection is due when the grey backlog crosses the queue
    /// watermark or the heap grew since the last young cycle.
    pub fn should_young_gc(
        &self,
        region_count: usize,
        queue_count: usize,
        queue_capacity: usize,
    ) -> bool {
        queue_count as f64 > queue_capacity as f64 * self.queue_high_watermark
            || region_count > self.region_count_after_last_young
    }

    /// Full collection is due at the region cap, or when the predicted time
    /// to reach the next trigger point is inside the predicted duration of
    /// the collection itself (plus the configured advance).
    pub fn should_full_gc(&self, region_count: usize) -> bool {
        if region_count > self.max_region_count {
            return true;
        }
        if self.alloc_rate <= 0.0 || self.full_mark_rate <= 0.0 {
            // No samples yet; nothing to predict from.
            return false;
        }

        let trigger = self.region_count_after_full as f64 * self.full_trigger_increment;
        let seconds_to_trigger = (trigger - region_count as f64) / self.alloc_rate;
        let seconds_for_full_gc = region_count as f64 / self.full_mark_rate;

        seconds_for_full_gc + self.full_gc_advance >= seconds_to_trigger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scheduler() -> GcScheduler {
        GcScheduler::new(&Config::default())
    }

    #[test]
    fn young_trigger_on_queue_backlog() {
        let s = scheduler();
        assert!(!s.should_young_gc(0, 100, 8192));
        assert!(s.should_young_gc(0, 6000, 8192));
    }

    #[test]
    fn young_trigger_on_region_growth() {
        let mut s = scheduler();
        s.on_young_gc_end(10);
        assert!(!s.should_young_gc(10, 0, 8192));
        assert!(s.should_young_gc(11, 0, 8192));
    }

    #[test]
    fn full_trigger_at_the_region_cap() {
        let s = scheduler();
        assert!(s.should_full_gc(Config::default().max_region_count + 1));
    }

    #[test]
    fn full_trigger_waits_for_rate_samples() {
        let s = scheduler();
        assert!(!s.should_full_gc(100));
    }

    #[test]
    fn full_trigger_predicts_from_rates() {
        let mut s = scheduler();
        // One full cycle and two monitor ticks seed both estimators.
        s.on_full_gc_start(64);
        std::thread::sleep(Duration::from_millis(5));
        s.on_full_gc_end(32);

        s.on_monitor(32);
        std::thread::sleep(Duration::from_millis(5));
        s.on_monitor(40);

        assert!(s.alloc_rate > 0.0);
        assert!(s.full_mark_rate > 0.0);
        // Just below the doubled post-full live set, prediction fires.
        assert!(s.should_full_gc(63));
    }

    #[test]
    fn history_ring_keeps_the_tail() {
        let mut s = GcScheduler::new(&Config {
            scheduler_history: 4,
            ..Config::default()
        });
        for _ in 0..3 {
            s.on_young_gc_start();
            s.on_young_gc_end(0);
        }
        assert_eq!(s.history().len(), 4);
        let kinds: Vec<_> = s.history().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::YoungGcStart,
                EventKind::YoungGcEnd,
                EventKind::YoungGcStart,
                EventKind::YoungGcEnd,
            ]
        );
    }
}
