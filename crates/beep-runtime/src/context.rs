//! Execution context
//!
//! Owns everything a BEEP engine instance needs: configuration, the
//! profile registry, the worker pool and the reader thread. Nothing is
//! process-global; two contexts in one process share nothing.
//!
//! The reader thread and every connection hold a clone of the context,
//! so it lives until `exit` stops the threads and connections go away.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use beep_core::{BeepError, Result, RwLockExt};

use crate::config::ContextConfig;
use crate::connection::Connection;
use crate::io::{new_io_wait, IoWaitType};
use crate::profiles::{FrameReceivedHandler, ProfileRegistry};
use crate::reader::{Reader, ReaderState};
use crate::worker::WorkerPool;

/// Runs after a peer's greeting on every accepted connection; `false`
/// rejects the connection.
pub type AcceptedHandler = Arc<dyn Fn(&Connection) -> bool + Send + Sync>;

/// Called once per idle period on connections quiet for `idle_timeout`.
pub type IdleHandler = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Called by the reader whenever it has nothing left to watch.
pub type FinishHandler = Arc<dyn Fn(&Context) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    frame_received: Option<FrameReceivedHandler>,
    idle: Option<IdleHandler>,
    on_finish: Option<FinishHandler>,
    accepted: Vec<AcceptedHandler>,
}

struct ContextInner {
    config: ContextConfig,
    profiles: ProfileRegistry,
    workers: WorkerPool,
    reader: Reader,
    hooks: RwLock<Hooks>,
    next_conn_id: AtomicU64,
    next_frame_id: AtomicU64,
    exited: AtomicBool,
}

/// Handle to an engine instance. Cheap to clone.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("workers", &self.inner.workers.total_workers())
            .field("reader", &self.inner.reader)
            .field("profiles", &self.inner.profiles.len())
            .field("exited", &self.is_exited())
            .finish()
    }
}

impl Context {
    /// Validate `config`, start the worker pool and the reader.
    pub fn new(config: ContextConfig) -> Result<Self> {
        config.validate().map_err(|e| BeepError::InvalidArgument(e.to_string()))?;
        let workers = WorkerPool::new(config.worker_threads)?;
        let reader = match Reader::new() {
            Ok(r) => r,
            Err(e) => {
                workers.stop();
                return Err(e);
            }
        };
        let ctx = Context {
            inner: Arc::new(ContextInner {
                config,
                profiles: ProfileRegistry::new(),
                workers,
                reader,
                hooks: RwLock::new(Hooks::default()),
                next_conn_id: AtomicU64::new(1),
                next_frame_id: AtomicU64::new(1),
                exited: AtomicBool::new(false),
            }),
        };
        if let Err(e) = ctx.inner.reader.start(&ctx) {
            ctx.inner.workers.stop();
            return Err(e);
        }
        info!(
            workers = ctx.inner.config.worker_threads,
            backend = %ctx.inner.config.io_backend,
            "context started"
        );
        Ok(ctx)
    }

    /// Context configured from `BEEP_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(ContextConfig::from_env())
    }

    pub fn config(&self) -> &ContextConfig {
        &self.inner.config
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.inner.profiles
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.inner.workers
    }

    pub fn reader(&self) -> &Reader {
        &self.inner.reader
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_frame_id(&self) -> u64 {
        self.inner.next_frame_id.fetch_add(1, Ordering::Relaxed)
    }

    // ── hooks ──

    /// Install a handler that sees every frame of every channel before
    /// channel and profile handlers. Runs on the reader thread.
    pub fn set_frame_received_hook(&self, hook: Option<FrameReceivedHandler>) {
        self.inner.hooks.write_locked().frame_received = hook;
    }

    pub(crate) fn frame_received_hook(&self) -> Option<FrameReceivedHandler> {
        self.inner.hooks.read_locked().frame_received.clone()
    }

    /// Idle handler; only active when `idle_timeout` is configured.
    pub fn set_idle_handler(&self, handler: Option<IdleHandler>) {
        self.inner.hooks.write_locked().idle = handler;
    }

    pub(crate) fn idle_check(&self) -> Option<(Duration, IdleHandler)> {
        let timeout = self.inner.config.idle_timeout?;
        let handler = self.inner.hooks.read_locked().idle.clone()?;
        Some((timeout, handler))
    }

    pub fn set_on_finish(&self, handler: Option<FinishHandler>) {
        self.inner.hooks.write_locked().on_finish = handler;
    }

    pub(crate) fn run_on_finish(&self) {
        let handler = self.inner.hooks.read_locked().on_finish.clone();
        if let Some(handler) = handler {
            if catch_unwind(AssertUnwindSafe(|| handler(self))).is_err() {
                warn!("on-finish handler panicked");
            }
        }
    }

    pub fn add_accept_handler(&self, handler: AcceptedHandler) {
        self.inner.hooks.write_locked().accepted.push(handler);
    }

    /// Every accept handler must agree. A panicking handler rejects.
    pub(crate) fn run_accept_handlers(&self, conn: &Connection) -> bool {
        let handlers = self.inner.hooks.read_locked().accepted.clone();
        handlers.iter().all(|h| match catch_unwind(AssertUnwindSafe(|| h(conn))) {
            Ok(accepted) => accepted,
            Err(_) => {
                warn!(conn = conn.id(), "accept handler panicked");
                false
            }
        })
    }

    // ── lifecycle ──

    /// Swap the reader's multiplexing backend at runtime.
    pub fn set_io_backend(&self, kind: IoWaitType) -> Result<()> {
        let backend = new_io_wait(kind)?;
        self.inner.reader.notify_change_io_backend()?;
        self.inner.reader.notify_change_done(Some(backend))
    }

    pub fn is_exited(&self) -> bool {
        self.inner.exited.load(Ordering::Acquire)
    }

    /// Shut down every watched connection, stop the reader and the
    /// worker pool. Idempotent.
    pub fn exit(&self) -> Result<()> {
        if self.inner.exited.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("context exiting");
        let reader = &self.inner.reader;
        let timeout = self.inner.config.stop_timeout;
        if reader.state() != ReaderState::Stopped {
            match reader.foreach(Some(Box::new(|conn: &Connection| conn.shutdown()))) {
                Ok(done) if !reader.is_reader_thread() => {
                    if done.timed_pop(timeout).is_none() {
                        warn!("connections not shut down before reader stop");
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "reader already stopped"),
            }
        }
        let stopped = reader.stop(timeout);
        self.inner.workers.stop();
        debug!(profiles = self.inner.profiles.len(), "context exited");
        stopped
    }
}
