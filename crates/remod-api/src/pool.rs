//! Shared worker pool for ad-hoc background tasks.
//!
//! Host service, not part of the host's correctness contract: modules use
//! it for blocking side work so they don't stall their own event loop.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    jobs: VecDeque<Job>,
    stopping: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    signal: Condvar,
}

/// Fixed-size blocking thread pool.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(workers: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                jobs: VecDeque::new(),
                stopping: false,
            }),
            signal: Condvar::new(),
        });
        let workers = (0..workers.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("pool/{i}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn pool worker")
            })
            .collect();
        Self { shared, workers }
    }

    /// Queue a job for execution on some pool worker.
    pub fn spawn<F: FnOnce() + Send + 'static>(&self, job: F) {
        let mut state = self.shared.state.lock().unwrap();
        state.jobs.push_back(Box::new(job));
        drop(state);
        self.shared.signal.notify_one();
    }

    /// Jobs queued but not yet picked up.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().unwrap().jobs.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().stopping = true;
        self.shared.signal.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    break job;
                }
                if state.stopping {
                    return;
                }
                state = shared.signal.wait(state).unwrap();
            }
        };
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            eprintln!("[pool] job panicked");
        }
    }
}
