//! Blocking FIFO queue with waiter accounting
//!
//! The glue between the reader loop, the worker pool and application
//! threads. A `BlockingQueue` is a cloneable handle: cloning takes a
//! reference, dropping releases it, and the storage goes away with the
//! last handle. Items are owned values, so "pushing nothing" cannot be
//! expressed and a non-empty queue always holds real work.
//!
//! Ordering: `push` appends at the tail, `pop` takes from the head.
//! `priority_push` inserts at the head, so the item is the next one
//! popped.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::sync::LockExt;

struct QueueState<T> {
    items: VecDeque<T>,
    /// Threads currently blocked in `pop`/`timed_pop`
    waiters: usize,
}

struct QueueInner<T> {
    state: Mutex<QueueState<T>>,
    cond: Condvar,
}

/// Thread-safe blocking queue.
pub struct BlockingQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for BlockingQueue<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for BlockingQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state.locked();
        f.debug_struct("BlockingQueue")
            .field("items", &st.items.len())
            .field("waiters", &st.waiters)
            .finish()
    }
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState { items: VecDeque::new(), waiters: 0 }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Append an item. Never blocks beyond the internal lock.
    pub fn push(&self, item: T) {
        let mut st = self.inner.state.locked();
        st.items.push_back(item);
        if st.waiters > 0 {
            self.inner.cond.notify_one();
        }
    }

    /// Insert an item so it is the next one popped.
    pub fn priority_push(&self, item: T) {
        let mut st = self.inner.state.locked();
        st.items.push_front(item);
        if st.waiters > 0 {
            self.inner.cond.notify_one();
        }
    }

    /// Block until an item is available and take it.
    pub fn pop(&self) -> T {
        let mut st = self.inner.state.locked();
        loop {
            if let Some(item) = st.items.pop_front() {
                return item;
            }
            st.waiters += 1;
            st = self
                .inner
                .cond
                .wait(st)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            st.waiters -= 1;
        }
    }

    /// Like `pop`, bounded by `timeout`. `None` means the wait expired;
    /// nothing is changed in that case.
    pub fn timed_pop(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut st = self.inner.state.locked();
        loop {
            if let Some(item) = st.items.pop_front() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            st.waiters += 1;
            let (guard, _) = self
                .inner
                .cond
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            st = guard;
            st.waiters -= 1;
        }
    }

    /// Take an item if one is queued, without blocking.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.state.locked().items.pop_front()
    }

    /// Unclaimed work: queued items minus blocked consumers.
    ///
    /// Negative when more threads wait than items exist.
    pub fn length(&self) -> isize {
        let st = self.inner.state.locked();
        st.items.len() as isize - st.waiters as isize
    }

    /// Raw number of queued items.
    pub fn items(&self) -> usize {
        self.inner.state.locked().items.len()
    }

    /// Raw number of blocked consumers.
    pub fn waiters(&self) -> usize {
        self.inner.state.locked().waiters
    }

    /// Number of live handles to this queue.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Visit every item in pop order while holding the lock.
    pub fn foreach<F: FnMut(&T)>(&self, mut f: F) {
        let st = self.inner.state.locked();
        for item in st.items.iter() {
            f(item);
        }
    }

    /// First item (in pop order) matching `pred`, left in place.
    pub fn lookup<F, R>(&self, mut pred: F) -> Option<R>
    where
        F: FnMut(&T) -> Option<R>,
    {
        let st = self.inner.state.locked();
        st.items.iter().find_map(|item| pred(item))
    }

    /// Take the queue lock for a multi-step atomic sequence.
    ///
    /// Items pushed through the guard become visible to consumers when the
    /// guard is dropped.
    pub fn lock(&self) -> QueueGuard<'_, T> {
        QueueGuard {
            state: self.inner.state.locked(),
            cond: &self.inner.cond,
            pushed: 0,
        }
    }
}

/// Held lock on a [`BlockingQueue`].
pub struct QueueGuard<'a, T> {
    state: MutexGuard<'a, QueueState<T>>,
    cond: &'a Condvar,
    pushed: usize,
}

impl<T> QueueGuard<'_, T> {
    /// Push while the caller already holds the lock.
    pub fn unlocked_push(&mut self, item: T) {
        self.state.items.push_back(item);
        self.pushed += 1;
    }

    pub fn unlocked_priority_push(&mut self, item: T) {
        self.state.items.push_front(item);
        self.pushed += 1;
    }

    pub fn items(&self) -> usize {
        self.state.items.len()
    }

    pub fn waiters(&self) -> usize {
        self.state.waiters
    }

    /// Remove the first item matching `pred`.
    pub fn remove_first<F: FnMut(&T) -> bool>(&mut self, pred: F) -> Option<T> {
        let idx = self.state.items.iter().position(pred)?;
        self.state.items.remove(idx)
    }
}

impl<T> Drop for QueueGuard<'_, T> {
    fn drop(&mut self) {
        if self.pushed > 0 && self.state.waiters > 0 {
            if self.pushed == 1 {
                self.cond.notify_one();
            } else {
                self.cond.notify_all();
            }
        }
    }
}
