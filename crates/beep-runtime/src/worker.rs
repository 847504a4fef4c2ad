//! `WorkerPool` - threads that run application code off the reader.
//!
//! Spawns N OS threads at context creation. Workers block on a shared
//! `BlockingQueue<Task>` and run profile-level frame delivery, channel 0
//! request processing and generic jobs (asynchronous channel and pool
//! creation). One `Stop` per worker ends the pool.
//!
//! No dynamic scaling.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};

use beep_core::{BeepError, BlockingQueue, Frame, LockExt, Result};

use crate::channel::Channel;
use crate::connection::Connection;
use crate::control;
use crate::profiles::FrameReceivedHandler;

/// Who consumes a delivered frame.
pub(crate) enum DeliveryTarget {
    /// A profile's received handler
    Handler(FrameReceivedHandler),
    /// Management request on channel 0
    Control,
}

/// A frame on its way to application code. Owns the connection and
/// channel references for the duration of the call.
pub(crate) struct Delivery {
    pub(crate) connection: Connection,
    pub(crate) channel: Channel,
    pub(crate) frame: Frame,
    pub(crate) target: DeliveryTarget,
    /// Position in the channel's serialized order, if it has one
    pub(crate) ticket: Option<u64>,
}

impl Delivery {
    pub(crate) fn run(self) {
        match self.ticket {
            Some(_) => {
                let channel = self.channel.clone();
                channel.deliver_in_order(self);
            }
            None => self.invoke(),
        }
    }

    pub(crate) fn invoke(self) {
        let Delivery { connection, channel, frame, target, .. } = self;
        let (number, msgno) = (channel.number(), frame.msgno());
        let outcome = catch_unwind(AssertUnwindSafe(|| match target {
            DeliveryTarget::Handler(handler) => handler(&channel, &connection, frame),
            DeliveryTarget::Control => control::process_request(&connection, &channel, frame),
        }));
        if outcome.is_err() {
            warn!(conn = connection.id(), channel = number, msgno, "frame handler panicked, frame not delivered");
        }
    }
}

pub(crate) enum Task {
    Deliver(Delivery),
    Job(Box<dyn FnOnce() + Send>),
    Stop,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Deliver(d) => write!(f, "Deliver(channel={}, msgno={})", d.channel.number(), d.frame.msgno()),
            Task::Job(_) => f.write_str("Job"),
            Task::Stop => f.write_str("Stop"),
        }
    }
}

/// Shared state between submitters and workers.
struct PoolInner {
    queue: BlockingQueue<Task>,
    /// Workers currently running a task
    active: AtomicUsize,
    stopped: AtomicBool,
    total: usize,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

/// Fixed-size thread pool fed by a blocking queue.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool with `n` workers.
    pub fn new(n: usize) -> Result<Self> {
        let n = n.max(1);
        let inner = Arc::new(PoolInner {
            queue: BlockingQueue::new(),
            active: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            total: n,
            handles: Mutex::new(Vec::with_capacity(n)),
        });

        for worker_id in 0..n {
            let worker = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("beep-worker-{}", worker_id))
                .spawn(move || worker_loop(worker, worker_id))
                .map_err(|e| BeepError::MemoryFail(format!("cannot spawn worker thread: {}", e)))?;
            inner.handles.locked().push(handle);
        }
        debug!(workers = n, "worker pool started");
        Ok(WorkerPool { inner })
    }

    /// The stopped check and the push happen under the queue lock, so no
    /// task can land behind the `Stop` markers.
    pub(crate) fn submit(&self, task: Task) -> std::result::Result<(), Task> {
        let mut queue = self.inner.queue.lock();
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(task);
        }
        queue.unlocked_push(task);
        Ok(())
    }

    /// Queue a delivery; hands it back if the pool is stopped.
    pub(crate) fn deliver(&self, delivery: Delivery) -> std::result::Result<(), Delivery> {
        match self.submit(Task::Deliver(delivery)) {
            Ok(()) => Ok(()),
            Err(Task::Deliver(d)) => Err(d),
            Err(_) => Ok(()),
        }
    }

    /// Run `job` on a worker thread.
    pub fn spawn<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Task::Job(Box::new(job))).map_err(|_| BeepError::Stopped)
    }

    /// Run `job` on a worker and get its result through a `Completion`.
    pub fn spawn_with<T, F>(&self, job: F) -> Result<Completion<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let completion = Completion::new();
        let slot = completion.clone();
        self.spawn(move || slot.complete(job()))?;
        Ok(completion)
    }

    /// Tasks queued and not yet picked up
    pub fn pending(&self) -> usize {
        self.inner.queue.items()
    }

    pub fn active_workers(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    pub fn total_workers(&self) -> usize {
        self.inner.total
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Stop accepting tasks, let workers finish what is queued, join them.
    ///
    /// A worker calling this is not joined (it cannot join itself).
    pub fn stop(&self) {
        {
            let mut queue = self.inner.queue.lock();
            if self.inner.stopped.swap(true, Ordering::AcqRel) {
                return;
            }
            for _ in 0..self.inner.total {
                queue.unlocked_push(Task::Stop);
            }
        }
        let me = thread::current().id();
        let handles = std::mem::take(&mut *self.inner.handles.locked());
        for handle in handles {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                warn!("worker thread ended with a panic");
            }
        }
        debug!("worker pool stopped");
    }
}

/// Worker thread main loop.
fn worker_loop(inner: Arc<PoolInner>, worker_id: usize) {
    loop {
        let task = inner.queue.pop();
        trace!(worker = worker_id, ?task, "task");
        inner.active.fetch_add(1, Ordering::Relaxed);
        match task {
            Task::Deliver(delivery) => delivery.run(),
            Task::Job(job) => {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    warn!(worker = worker_id, "job panicked");
                }
            }
            Task::Stop => {
                inner.active.fetch_sub(1, Ordering::Relaxed);
                break;
            }
        }
        inner.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// One-shot result slot filled by a worker.
pub struct Completion<T> {
    queue: BlockingQueue<T>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self { queue: self.queue.clone() }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").field("ready", &(self.queue.items() > 0)).finish()
    }
}

impl<T> Completion<T> {
    pub(crate) fn new() -> Self {
        Self { queue: BlockingQueue::new() }
    }

    pub(crate) fn complete(&self, value: T) {
        self.queue.push(value);
    }

    /// Block until the result is available.
    pub fn wait(self) -> T {
        self.queue.pop()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        self.queue.timed_pop(timeout)
    }

    pub fn try_take(&self) -> Option<T> {
        self.queue.try_pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jobs_run_on_named_workers() {
        let pool = WorkerPool::new(2).unwrap();
        let names = BlockingQueue::new();
        for _ in 0..4 {
            let names = names.clone();
            pool.spawn(move || names.push(thread::current().name().unwrap_or("").to_string()))
                .unwrap();
        }
        for _ in 0..4 {
            let name = names.timed_pop(Duration::from_secs(2)).unwrap();
            assert!(name.starts_with("beep-worker-"), "{}", name);
        }
        pool.stop();
        assert!(pool.is_stopped());
    }

    #[test]
    fn test_completion_carries_result() {
        let pool = WorkerPool::new(1).unwrap();
        let done = pool.spawn_with(|| 6 * 7).unwrap();
        assert_eq!(done.wait_timeout(Duration::from_secs(2)), Some(42));
        pool.stop();
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(1).unwrap();
        pool.spawn(|| panic!("boom")).unwrap();
        let done = pool.spawn_with(|| "still alive").unwrap();
        assert_eq!(done.wait_timeout(Duration::from_secs(2)), Some("still alive"));
        pool.stop();
    }

    #[test]
    fn test_jobs_accepted_during_stop_all_run() {
        let pool = WorkerPool::new(2).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let submitters: Vec<_> = (0..4)
            .map(|_| {
                let (pool, ran) = (pool.clone(), Arc::clone(&ran));
                thread::spawn(move || {
                    let mut accepted = 0;
                    for _ in 0..500 {
                        let ran = Arc::clone(&ran);
                        if pool.spawn(move || {
                            ran.fetch_add(1, Ordering::SeqCst);
                        })
                        .is_ok()
                        {
                            accepted += 1;
                        }
                    }
                    accepted
                })
            })
            .collect();
        thread::sleep(Duration::from_millis(1));
        pool.stop();
        let accepted: usize = submitters.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(ran.load(Ordering::SeqCst), accepted);
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn test_submit_after_stop_fails() {
        let pool = WorkerPool::new(1).unwrap();
        pool.stop();
        pool.stop();
        assert!(matches!(pool.spawn(|| {}), Err(BeepError::Stopped)));
        assert_eq!(pool.total_workers(), 1);
    }
}
