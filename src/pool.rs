//! Worker pool
//!
//! A fixed set of worker threads draining a bounded FIFO queue. `submit`
//! never blocks: a full queue is reported to the caller, which re-arms
//! reactor interest so the event is redelivered later instead of being
//! lost. That refusal is the only backpressure mechanism between the
//! reactor and the workers.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::warn;

/// A unit of work accepted by the pool.
pub trait Task: Send + 'static {
    fn execute(self);
}

struct PoolState<T> {
    tasks: VecDeque<T>,
    shutdown: bool,
}

struct Shared<T> {
    state: Mutex<PoolState<T>>,
    available: Condvar,
}

pub struct WorkerPool<T: Task> {
    shared: Arc<Shared<T>>,
    max_queue: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Task> WorkerPool<T> {
    pub fn new(max_queue: usize, workers: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                tasks: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        });
        let handles = (0..workers)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || worker_loop(shared))
            })
            .collect();
        Self {
            shared,
            max_queue,
            workers: Mutex::new(handles),
        }
    }

    /// Queues a task unless the pool is full or shut down. Never blocks;
    /// wakes one worker on success.
    pub fn submit(&self, task: T) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if state.shutdown || state.tasks.len() >= self.max_queue {
            return false;
        }
        state.tasks.push_back(task);
        drop(state);
        self.shared.available.notify_one();
        true
    }

    /// Signals shutdown and joins every worker. Tasks already queued are
    /// executed before the workers exit.
    pub fn shutdown(&self) {
        self.shared.state.lock().unwrap().shutdown = true;
        self.shared.available.notify_all();
        let handles = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

impl<T: Task> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<T: Task>(shared: Arc<Shared<T>>) {
    loop {
        let task = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if let Some(task) = state.tasks.pop_front() {
                    break task;
                }
                if state.shutdown {
                    return;
                }
                state = shared.available.wait(state).unwrap();
            }
        };
        task.execute();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    struct TestTask(Box<dyn FnOnce() + Send>);

    impl Task for TestTask {
        fn execute(self) {
            (self.0)()
        }
    }

    #[test]
    fn test_tasks_run_before_shutdown_completes() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(16, 1);
        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            assert!(pool.submit(TestTask(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))));
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_submit_refuses_when_queue_full() {
        let pool = WorkerPool::new(2, 1);
        let (started_tx, started_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();

        // Occupy the single worker so queued tasks stay queued.
        assert!(pool.submit(TestTask(Box::new(move || {
            started_tx.send(()).unwrap();
            gate_rx.recv().unwrap();
        }))));
        started_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("worker never started");

        assert!(pool.submit(TestTask(Box::new(|| {}))));
        assert!(pool.submit(TestTask(Box::new(|| {}))));
        // Queue is at capacity now.
        assert!(!pool.submit(TestTask(Box::new(|| {}))));

        gate_tx.send(()).unwrap();
        pool.shutdown();
    }

    #[test]
    fn test_submit_refuses_after_shutdown() {
        let pool = WorkerPool::new(4, 1);
        pool.shutdown();
        assert!(!pool.submit(TestTask(Box::new(|| {}))));
    }
}
