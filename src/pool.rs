//! Worker pool for collection phases.
//!
//! Phase workers are dispatched as jobs and waited on through per-job
//! handles. The handle supports a timed wait, which is what lets the
//! collector give the concurrent mark a bounded tolerance before escalating
//! to a stop-the-world pause. A job that panics (a scan or root callback
//! misbehaving) reports failure instead of poisoning the pool.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TaskState {
    Running,
    Done,
    Panicked,
}

struct TaskInner {
    state: Mutex<TaskState>,
    cv: Condvar,
}

/// Completion handle for one dispatched job.
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    /// Blocks until the job finishes. `Err` means the job panicked.
    pub fn wait(&self) -> Result<(), ()> {
        let mut state = self.inner.state.lock();
        while *state == TaskState::Running {
            self.inner.cv.wait(&mut state);
        }
        if *state == TaskState::Done {
            Ok(())
        } else {
            Err(())
        }
    }

    /// Waits up to `timeout`. `None` means the job is still running.
    pub fn wait_for(&self, timeout: Duration) -> Option<Result<(), ()>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while *state == TaskState::Running {
            if self.inner.cv.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        match *state {
            TaskState::Running => None,
            TaskState::Done => Some(Ok(())),
            TaskState::Panicked => Some(Err(())),
        }
    }
}

pub struct ThreadPool {
    sender: Option<Sender<(Job, Arc<TaskInner>)>>,
    threads: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(thread_count: usize) -> Self {
        let (sender, receiver) = unbounded::<(Job, Arc<TaskInner>)>();
        let threads = (0..thread_count.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("gc-worker-{i}"))
                    .spawn(move || {
                        while let Ok((job, inner)) = receiver.recv() {
                            let result = catch_unwind(AssertUnwindSafe(job));
                            let mut state = inner.state.lock();
                            *state = if result.is_ok() {
                                TaskState::Done
                            } else {
                                TaskState::Panicked
                            };
                            inner.cv.notify_all();
                        }
                    })
                    .expect("failed to spawn gc worker")
            })
            .collect();
        Self {
            sender: Some(sender),
            threads,
        }
    }

    pub fn dispatch<F: FnOnce() + Send + 'static>(&self, job: F) -> Task {
        let inner = Arc::new(TaskInner {
            state: Mutex::new(TaskState::Running),
            cv: Condvar::new(),
        });
        self.sender
            .as_ref()
            .expect("pool is shut down")
            .send((Box::new(job), inner.clone()))
            .expect("gc workers are gone");
        Task { inner }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Closing the channel lets the workers drain and exit.
        self.sender.take();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dispatch_and_wait() {
        let pool = ThreadPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<Task> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                pool.dispatch(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for task in &tasks {
            assert_eq!(task.wait(), Ok(()));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn timed_wait_sees_a_slow_job() {
        let pool = ThreadPool::new(1);
        let task = pool.dispatch(|| std::thread::sleep(Duration::from_millis(50)));
        assert_eq!(task.wait_for(Duration::from_millis(1)), None);
        assert_eq!(task.wait(), Ok(()));
    }

    #[test]
    fn a_panicking_job_reports_failure() {
        let pool = ThreadPool::new(1);
        let bad = pool.dispatch(|| panic!("scan callback failure"));
        assert_eq!(bad.wait(), Err(()));
        // The worker survives for the next job.
        let good = pool.dispatch(|| {});
        assert_eq!(good.wait(), Ok(()));
    }
}
