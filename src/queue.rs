//! Bounded multi-producer multi-consumer queue.
//!
//! The collector's grey set. A fixed ring of slots, each stamped with a
//! sequence number that tells producers and consumers whose turn the slot
//! is; both sides advance their cursor with a CAS and never touch a slot
//! they have not claimed. The blocking variants back off from spinning to
//! yielding to short condvar waits.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

const SPIN_COUNT: usize = 8;

struct Slot<T> {
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

pub struct BoundedQueue<T> {
    buffer: Box<[Slot<T>]>,
    head: AtomicUsize,
    tail: AtomicUsize,
    wait_mutex: Mutex<()>,
    read_cv: Condvar,
    write_cv: Condvar,
}

unsafe impl<T: Send> Send for BoundedQueue<T> {}
unsafe impl<T: Send> Sync for BoundedQueue<T> {}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");
        let buffer = (0..capacity)
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buffer,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            wait_mutex: Mutex::new(()),
            read_cv: Condvar::new(),
            write_cv: Condvar::new(),
        }
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Current occupancy. Racy by nature; used only for heuristics and
    /// termination checks that re-validate.
    pub fn count(&self) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        tail.saturating_sub(head)
    }

    pub fn try_enqueue(&self, value: T) -> Result<(), T> {
        let mask = self.buffer.len() - 1;
        let mut tail = self.tail.load(Ordering::Acquire);
        let slot = loop {
            let slot = &self.buffer[tail & mask];
            let seq = slot.seq.load(Ordering::Acquire);
            if seq == tail {
                if self
                    .tail
                    .compare_exchange_weak(tail, tail + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    break slot;
                }
                tail = self.tail.load(Ordering::Relaxed);
            } else if seq < tail {
                return Err(value);
            } else {
                tail = self.tail.load(Ordering::Relaxed);
            }
        };
        unsafe {
            (*slot.value.get()).write(value);
        }
        slot.seq.store(tail + 1, Ordering::Release);
        self.read_cv.notify_one();
        Ok(())
    }

    pub fn try_dequeue(&self) -> Option<T> {
        let mask = self.buffer.len() - 1;
        let mut head = self.head.load(Ordering::Relaxed);
        let slot = loop {
            let slot = &self.buffer[head & mask];
            let seq = slot.seq.load(Ordering::Acquire);
            if seq == head + 1 {
                if self
                    .head
                    .compare_exchange_weak(head, head + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    break slot;
                }
                head = self.head.load(Ordering::Relaxed);
            } else if seq < head + 1 {
                return None;
            } else {
                head = self.head.load(Ordering::Relaxed);
            }
        };
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.seq.store(head + self.buffer.len(), Ordering::Release);
        self.write_cv.notify_one();
        Some(value)
    }

    /// Blocking enqueue with adaptive backoff.
    pub fn enqueue(&self, mut value: T) {
        let mut retry = Backoff::new();
        loop {
            for _ in 0..SPIN_COUNT {
                match self.try_enqueue(value) {
                    Ok(()) => return,
                    Err(rejected) => value = rejected,
                }
            }
            retry.wait(&self.wait_mutex, &self.write_cv);
        }
    }

    /// Blocking dequeue with adaptive backoff.
    pub fn dequeue(&self) -> T {
        let mut retry = Backoff::new();
        loop {
            for _ in 0..SPIN_COUNT {
                if let Some(value) = self.try_dequeue() {
                    return value;
                }
            }
            retry.wait(&self.wait_mutex, &self.read_cv);
        }
    }
}

struct Backoff {
    retries: usize,
}

impl Backoff {
    fn new() -> Self {
        Self { retries: 0 }
    }

    fn wait(&mut self, mutex: &Mutex<()>, cv: &Condvar) {
        let retry = self.retries;
        self.retries += 1;
        if retry < 5 {
            std::thread::yield_now();
        } else if retry < 10 {
            let mut guard = mutex.lock();
            cv.wait_for(&mut guard, Duration::from_millis(3));
        } else {
            let mut guard = mutex.lock();
            cv.wait_for(&mut guard, Duration::from_millis(10));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fifo_roundtrip() {
        let queue = BoundedQueue::new(8);
        for i in 0..8 {
            assert!(queue.try_enqueue(i).is_ok());
        }
        assert_eq!(queue.count(), 8);
        assert!(queue.try_enqueue(99).is_err());
        for i in 0..8 {
            assert_eq!(queue.try_dequeue(), Some(i));
        }
        assert_eq!(queue.try_dequeue(), None);
        assert_eq!(queue.count(), 0);
    }

    #[test]
    fn wraps_around() {
        let queue = BoundedQueue::new(4);
        for round in 0..10 {
            for i in 0..4 {
                assert!(queue.try_enqueue(round * 4 + i).is_ok());
            }
            for i in 0..4 {
                assert_eq!(queue.try_dequeue(), Some(round * 4 + i));
            }
        }
    }

    #[test]
    fn many_producers_many_consumers() {
        const PER_THREAD: usize = 10_000;
        let queue = Arc::new(BoundedQueue::new(1024));
        let mut producers = vec![];
        for t in 0..4usize {
            let queue = queue.clone();
            producers.push(std::thread::spawn(move || {
                for i in 0..PER_THREAD {
                    queue.enqueue(t * PER_THREAD + i);
                }
            }));
        }
        let mut consumers = vec![];
        for _ in 0..4 {
            let queue = queue.clone();
            consumers.push(std::thread::spawn(move || {
                let mut sum = 0usize;
                for _ in 0..PER_THREAD {
                    sum += queue.dequeue();
                }
                sum
            }));
        }
        for producer in producers {
            producer.join().unwrap();
        }
        let total: usize = consumers.into_iter().map(|c| c.join().unwrap()).sum();
        let expected = (0..4 * PER_THREAD).sum::<usize>();
        assert_eq!(total, expected);
        assert_eq!(queue.count(), 0);
    }
}
