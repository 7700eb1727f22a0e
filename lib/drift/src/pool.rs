//! A fixed-size pool of worker threads draining a FIFO of control-plane
//! jobs. Whoever enqueues a job transfers ownership of everything the
//! closure captures; the worker releases it after running, and shutdown
//! releases it for jobs that never ran.

use frost::logging::{self, Logger};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

pub const DEFAULT_WORKERS: usize = 8;

type Work = Box<dyn FnOnce() + Send + 'static>;

/// Outcome of [`WorkerPool::add_job`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Enqueue {
    Queued,
    /// The pool has stopped; the job was dropped without running.
    Stopped,
}

struct PoolState {
    queue: VecDeque<Work>,
    stopped: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    job_ready: Condvar,
    drained: Condvar,
    log: Logger,
}

pub struct WorkerPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(worker_count: usize, log: &Logger) -> io::Result<WorkerPool> {
        assert!(worker_count > 0);

        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                stopped: false,
            }),
            job_ready: Condvar::new(),
            drained: Condvar::new(),
            log: log.new(logging::o!()),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let inner = inner.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("worker-{}", id))
                    .spawn(move || work_loop(inner))?,
            );
        }

        Ok(WorkerPool {
            inner,
            workers: Mutex::new(workers),
        })
    }

    /// Appends a job to the queue and wakes one worker. A stopped pool
    /// rejects the job, dropping it (and whatever it captured) on the spot.
    pub fn add_job<F: FnOnce() + Send + 'static>(&self, work: F) -> Enqueue {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return Enqueue::Stopped;
        }
        state.queue.push_back(Box::new(work));
        self.inner.job_ready.notify_one();
        Enqueue::Queued
    }

    /// Blocks until the queue is empty or the pool has stopped.
    pub fn wait_idle(&self) {
        let mut state = self.inner.state.lock();
        while !state.queue.is_empty() && !state.stopped {
            self.inner.drained.wait(&mut state);
        }
    }

    /// Stops the pool: every worker exits once its current job finishes,
    /// and jobs still queued are destroyed without running.
    pub fn shutdown(&self) {
        let leftover = {
            let mut state = self.inner.state.lock();
            state.stopped = true;
            self.inner.job_ready.notify_all();
            self.inner.drained.notify_all();
            std::mem::take(&mut state.queue)
        };

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }

        drop(leftover);
    }
}

fn work_loop(inner: Arc<PoolInner>) {
    loop {
        let work = {
            let mut state = inner.state.lock();
            while state.queue.is_empty() && !state.stopped {
                inner.job_ready.wait(&mut state);
            }
            if state.stopped {
                return;
            }
            state.queue.pop_front().expect("Woken with an empty queue")
        };

        // A misbehaving job must not take the worker down with it.
        if panic::catch_unwind(AssertUnwindSafe(work)).is_err() {
            logging::error!(inner.log, "job panicked; worker continues");
        }

        let state = inner.state.lock();
        if state.queue.is_empty() {
            inner.drained.notify_all();
        }
    }
}
