//! Deferred-operation submission.
//!
//! `Dispatcher::submit` stamps every operation with an event ID, registers
//! it with the ordering engine, and either runs it on the calling thread or
//! hands it to the worker pool, acknowledging the caller immediately. The
//! event ID is drawn before the defer branch so even eagerly executed
//! operations are visible to readers as in-flight.
//!
//! Deferred work outlives the caller's stack, so the path-taking helpers
//! copy their paths into the task before queueing it.

use std::ffi::{OsStr, OsString};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};
use nix::errno::Errno;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::order::OrderEngine;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of worker threads executing deferred operations.
///
/// Tasks are fire-and-forget: their errno results are logged by the
/// dispatcher wrapper and otherwise discarded. `drain` closes the queue and
/// joins the workers, guaranteeing every queued task has completed.
pub struct WorkerPool {
    queue: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn spawn(threads: usize) -> std::io::Result<Self> {
        let (queue, feed) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads.max(1));
        for index in 0..threads.max(1) {
            let feed: Receiver<Job> = feed.clone();
            let worker = std::thread::Builder::new()
                .name(format!("hastefs-worker-{index}"))
                .spawn(move || {
                    for job in feed.iter() {
                        job();
                    }
                })?;
            workers.push(worker);
        }
        Ok(Self {
            queue: Mutex::new(Some(queue)),
            workers: Mutex::new(workers),
        })
    }

    fn run(&self, job: Job) {
        match self.queue.lock().as_ref() {
            Some(queue) => {
                // Send only fails when every receiver is gone, which drain
                // prevents by taking the sender first.
                let _ = queue.send(job);
            }
            None => debug!("worker pool already drained; dropping task"),
        }
    }

    /// Close the queue and wait for every queued task to finish.
    pub fn drain(&self) {
        self.queue.lock().take();
        let mut workers = self.workers.lock();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.drain();
    }
}

/// Decides where a submitted operation runs and wires it to the ordering
/// engine.
pub struct Dispatcher {
    engine: Arc<OrderEngine>,
    pool: WorkerPool,
}

impl Dispatcher {
    pub fn new(engine: Arc<OrderEngine>, worker_threads: usize) -> std::io::Result<Self> {
        Ok(Self {
            engine,
            pool: WorkerPool::spawn(worker_threads)?,
        })
    }

    /// Submit an operation touching one path.
    ///
    /// When `defer` is false the operation runs on the calling thread and
    /// its result is returned. When `defer` is true the caller receives
    /// success immediately; the eventual errno is logged and discarded.
    pub fn submit<F>(&self, defer: bool, path: &OsStr, work: F) -> Result<(), Errno>
    where
        F: FnOnce(&OsStr) -> Result<(), Errno> + Send + 'static,
    {
        let event = self.engine.next_event();
        let guard = self.engine.begin_write(path, event);
        let path = path.to_os_string();
        self.dispatch(defer, move || {
            guard.wait_turn();
            let result = work(&path);
            (result, path)
        })
    }

    /// Submit an operation touching two paths (link-shaped). Guards are
    /// registered in argument order.
    pub fn submit_pair<F>(
        &self,
        defer: bool,
        first: &OsStr,
        second: &OsStr,
        work: F,
    ) -> Result<(), Errno>
    where
        F: FnOnce(&OsStr, &OsStr) -> Result<(), Errno> + Send + 'static,
    {
        let event = self.engine.next_event();
        let guard = self.engine.begin_write_pair(first, second, event);
        let first = first.to_os_string();
        let second = second.to_os_string();
        self.dispatch(defer, move || {
            guard.wait_turn();
            let result = work(&first, &second);
            (result, first)
        })
    }

    fn dispatch<T>(&self, defer: bool, task: T) -> Result<(), Errno>
    where
        T: FnOnce() -> (Result<(), Errno>, OsString) + Send + 'static,
    {
        if defer {
            self.pool.run(Box::new(move || {
                if let (Err(errno), path) = task() {
                    error!(path = %path.to_string_lossy(), %errno, "deferred operation failed");
                }
            }));
            Ok(())
        } else {
            task().0
        }
    }

    /// Close the worker queue and wait for all deferred operations.
    pub fn drain(&self) {
        self.pool.drain();
    }
}
