//! # Reader - the per-context event loop
//!
//! One dedicated thread per context multiplexes every watched connection
//! and listener:
//!
//! ```text
//! loop {
//!     1. Nothing watched?     -> on-finish hook, block on the command queue
//!     2. Rebuild the set      -> evict failed / unwatched, idle checks,
//!                                skip blocked, add the wake-up descriptor
//!     3. Wait                 -> backend wait with `wait_timeout`
//!     4. Dispatch             -> backend dispatch, or scan listeners then
//!                                connections with is_set
//!          listener ready   : accept, greet, watch
//!          connection ready : read, validate, deliver
//!     5. Drain commands       -> without blocking
//! }
//! ```
//!
//! Everything other threads ask of the loop travels as a `ReaderCommand`
//! through a `BlockingQueue`, followed by a poke on the wake-up notifier.
//! Commands that expect an answer carry a private reply queue.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use beep_core::{BeepError, BlockingQueue, Frame, Incoming, LockExt, Result, Status};

use crate::channel::Channel;
use crate::connection::{Connection, ReadEnd, Role};
use crate::context::Context;
use crate::control;
use crate::io::notifier::Notifier;
use crate::io::{new_io_wait, AddOutcome, IoWait, WaitOutcome, WatchTarget};
use crate::listener;

const SWAP_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a parked loop waits for the new backend before resuming with
/// the old one.
const SWAP_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Visitor run on the reader thread for every watched connection.
pub type ForeachVisitor = Box<dyn FnMut(&Connection) + Send>;

/// Requests queued to the reader thread.
pub enum ReaderCommand {
    /// Watch a peer connection
    Connection(Connection),
    /// Watch a listening socket
    Listener(Connection),
    /// Drop all state and end the loop
    Terminate,
    /// Backend swap: acknowledge, then block until `IoWaitReady`
    IoWaitChanged,
    /// New backend, or `None` to keep the current one
    IoWaitReady(Option<Box<dyn IoWait>>),
    Foreach {
        visitor: Option<ForeachVisitor>,
        done: BlockingQueue<()>,
    },
}

impl fmt::Debug for ReaderCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReaderCommand::Connection(c) => write!(f, "Connection({})", c.id()),
            ReaderCommand::Listener(c) => write!(f, "Listener({})", c.id()),
            ReaderCommand::Terminate => f.write_str("Terminate"),
            ReaderCommand::IoWaitChanged => f.write_str("IoWaitChanged"),
            ReaderCommand::IoWaitReady(b) => write!(f, "IoWaitReady({:?})", b.as_ref().map(|b| b.kind())),
            ReaderCommand::Foreach { visitor, .. } => write!(f, "Foreach(visitor={})", visitor.is_some()),
        }
    }
}

/// Where the loop is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReaderState {
    AwaitingFirstWatch = 0,
    Polling = 1,
    Dispatching = 2,
    DrainingCommands = 3,
    Stopped = 4,
}

impl ReaderState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ReaderState::AwaitingFirstWatch,
            1 => ReaderState::Polling,
            2 => ReaderState::Dispatching,
            3 => ReaderState::DrainingCommands,
            _ => ReaderState::Stopped,
        }
    }
}

struct ReaderShared {
    commands: BlockingQueue<ReaderCommand>,
    /// Loop exit acknowledgements
    stopped: BlockingQueue<()>,
    /// Backend swap acknowledgements
    swap_ack: BlockingQueue<()>,
    notifier: Notifier,
    state: AtomicU8,
    /// Connections and listeners currently in the watch lists
    watched: AtomicUsize,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: Mutex<Option<ThreadId>>,
}

impl ReaderShared {
    fn set_state(&self, state: ReaderState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> ReaderState {
        ReaderState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Handle on a context's reader thread.
#[derive(Clone)]
pub struct Reader {
    shared: Arc<ReaderShared>,
}

impl fmt::Debug for Reader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("state", &self.state())
            .field("watched", &self.watched())
            .finish()
    }
}

impl Reader {
    pub(crate) fn new() -> Result<Self> {
        Ok(Reader {
            shared: Arc::new(ReaderShared {
                commands: BlockingQueue::new(),
                stopped: BlockingQueue::new(),
                swap_ack: BlockingQueue::new(),
                notifier: Notifier::create()?,
                state: AtomicU8::new(ReaderState::Stopped as u8),
                watched: AtomicUsize::new(0),
                thread: Mutex::new(None),
                thread_id: Mutex::new(None),
            }),
        })
    }

    /// Spawn the loop thread.
    pub(crate) fn start(&self, ctx: &Context) -> Result<()> {
        let mut slot = self.shared.thread.locked();
        if slot.is_some() && self.state() != ReaderState::Stopped {
            return Ok(());
        }
        // A loop that stopped on its own leaves its handle behind
        if let Some(old) = slot.take() {
            if old.join().is_err() {
                warn!("previous reader thread ended with a panic");
            }
        }
        let backend = new_io_wait(ctx.config().io_backend)?;
        self.shared.set_state(ReaderState::AwaitingFirstWatch);
        let shared = Arc::clone(&self.shared);
        let ctx = ctx.clone();
        let handle = thread::Builder::new()
            .name("beep-reader".to_string())
            .spawn(move || reader_loop(ctx, shared, backend))
            .map_err(|e| BeepError::MemoryFail(format!("cannot spawn reader thread: {}", e)))?;
        *self.shared.thread_id.locked() = Some(handle.thread().id());
        *slot = Some(handle);
        debug!("reader started");
        Ok(())
    }

    fn send(&self, cmd: ReaderCommand) -> Result<()> {
        if self.state() == ReaderState::Stopped {
            return Err(BeepError::Stopped);
        }
        trace!(?cmd, "reader command");
        self.shared.commands.push(cmd);
        self.shared.notifier.notify();
        Ok(())
    }

    pub fn state(&self) -> ReaderState {
        self.shared.state()
    }

    /// Connections and listeners in the watch lists
    pub fn watched(&self) -> usize {
        self.shared.watched.load(Ordering::Relaxed)
    }

    pub fn is_reader_thread(&self) -> bool {
        *self.shared.thread_id.locked() == Some(thread::current().id())
    }

    pub fn watch_connection(&self, conn: Connection) -> Result<()> {
        if conn.role() == Role::MasterListener {
            return self.watch_listener(conn);
        }
        self.send(ReaderCommand::Connection(conn))
    }

    pub fn watch_listener(&self, conn: Connection) -> Result<()> {
        if conn.role() != Role::MasterListener {
            return Err(BeepError::InvalidArgument("not a listener connection".into()));
        }
        self.send(ReaderCommand::Listener(conn))
    }

    /// Ask the loop to drop `conn` on its next pass. The connection stays
    /// open; the flag is checked once per pass.
    pub fn unwatch_connection(&self, conn: &Connection) {
        conn.set_reader_unwatch();
        self.shared.notifier.notify();
    }

    /// First half of a backend swap. Returns once the loop is parked
    /// waiting for `notify_change_done`.
    pub fn notify_change_io_backend(&self) -> Result<()> {
        if self.is_reader_thread() {
            return Err(BeepError::InvalidArgument("backend swap requested from the reader thread".into()));
        }
        self.send(ReaderCommand::IoWaitChanged)?;
        match self.shared.swap_ack.timed_pop(SWAP_ACK_TIMEOUT) {
            Some(()) => Ok(()),
            None => Err(BeepError::Timeout),
        }
    }

    /// Second half of a backend swap. `None` keeps the old backend.
    pub fn notify_change_done(&self, backend: Option<Box<dyn IoWait>>) -> Result<()> {
        self.send(ReaderCommand::IoWaitReady(backend))
    }

    /// Run `visitor` on the reader thread over every watched connection
    /// and listener. Wait on the returned queue for completion.
    pub fn foreach(&self, visitor: Option<ForeachVisitor>) -> Result<BlockingQueue<()>> {
        let done = BlockingQueue::new();
        self.send(ReaderCommand::Foreach { visitor, done: done.clone() })?;
        Ok(done)
    }

    /// Stop the loop and wait for its acknowledgement.
    pub fn stop(&self, timeout: Duration) -> Result<()> {
        if self.state() == ReaderState::Stopped {
            return Ok(());
        }
        self.send(ReaderCommand::Terminate)?;
        if self.is_reader_thread() {
            // The loop picks Terminate up once the current handler returns
            return Ok(());
        }
        if self.shared.stopped.timed_pop(timeout).is_none() {
            error!(?timeout, "reader did not acknowledge stop");
            return Err(BeepError::Timeout);
        }
        let handle = self.shared.thread.locked().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("reader thread ended with a panic");
            }
        }
        *self.shared.thread_id.locked() = None;
        debug!("reader stopped");
        Ok(())
    }

    /// Stop the loop, forget every watched connection and start a fresh
    /// loop with a new backend.
    pub fn restart(&self, ctx: &Context) -> Result<()> {
        self.stop(ctx.config().stop_timeout)?;
        while self.shared.commands.try_pop().is_some() {}
        self.shared.notifier.drain();
        self.start(ctx)
    }
}

/// Outcome of one command
enum Flow {
    Continue,
    Stop,
}

struct Watched {
    connections: Vec<Connection>,
    listeners: Vec<Connection>,
}

impl Watched {
    fn is_empty(&self) -> bool {
        self.connections.is_empty() && self.listeners.is_empty()
    }

    fn len(&self) -> usize {
        self.connections.len() + self.listeners.len()
    }
}

fn reader_loop(ctx: Context, shared: Arc<ReaderShared>, mut io: Box<dyn IoWait>) {
    info!(backend = %io.kind(), "reader loop running");
    let mut watched = Watched { connections: Vec::new(), listeners: Vec::new() };
    let mut stashed: VecDeque<ReaderCommand> = VecDeque::new();
    let mut consecutive_errors = 0u32;

    'main: loop {
        shared.watched.store(watched.len(), Ordering::Relaxed);

        // ── Step 1: idle until something is watched ──
        if watched.is_empty() {
            shared.set_state(ReaderState::AwaitingFirstWatch);
            ctx.run_on_finish();
            let cmd = match stashed.pop_front() {
                Some(c) => c,
                None => shared.commands.pop(),
            };
            match handle_command(&shared, cmd, &mut watched, &mut io, &mut stashed) {
                Flow::Continue => continue,
                Flow::Stop => break 'main,
            }
        }

        // ── Step 2: rebuild the descriptor set ──
        shared.set_state(ReaderState::Polling);
        io.clear();
        let mut sweep = false;
        if io.add(shared.notifier.fd(), WatchTarget::Wakeup) != AddOutcome::Added {
            error!("cannot watch the reader wake-up descriptor");
        }
        let idle = ctx.idle_check();
        watched.listeners.retain(|l| l.is_ok());
        watched.connections.retain(|c| {
            if !c.is_ok() {
                trace!(conn = c.id(), "evicting failed connection");
                return false;
            }
            if c.take_reader_unwatch() {
                debug!(conn = c.id(), "connection unwatched");
                return false;
            }
            true
        });
        if watched.is_empty() {
            continue;
        }
        for l in &watched.listeners {
            if let AddOutcome::BadDescriptor = io.add(l.raw_fd(), WatchTarget::Listener(l.clone())) {
                sweep = true;
            }
        }
        for c in &watched.connections {
            if let Some((timeout, handler)) = &idle {
                if c.check_idle(*timeout) && catch_unwind(AssertUnwindSafe(|| handler(c))).is_err() {
                    warn!(conn = c.id(), "idle handler panicked");
                }
            }
            if c.is_blocked() || !c.is_ok() {
                continue;
            }
            match io.add(c.raw_fd(), WatchTarget::Connection(c.clone())) {
                AddOutcome::Added => {}
                AddOutcome::BadDescriptor => sweep = true,
                AddOutcome::Failed(errno) => {
                    warn!(conn = c.id(), errno, "cannot add connection to the wait set")
                }
            }
        }
        if sweep {
            bad_descriptor_sweep(&watched);
            continue;
        }

        // ── Step 3: wait ──
        match io.wait(ctx.config().wait_timeout) {
            WaitOutcome::Ready(_) => {
                consecutive_errors = 0;

                // ── Step 4: dispatch ──
                shared.set_state(ReaderState::Dispatching);
                let mut ready: Vec<WatchTarget> = Vec::new();
                if io.have_dispatch() {
                    io.dispatch(&mut |t| ready.push(t.clone()));
                } else {
                    if io.is_set(shared.notifier.fd()) {
                        ready.push(WatchTarget::Wakeup);
                    }
                    for l in &watched.listeners {
                        if io.is_set(l.raw_fd()) {
                            ready.push(WatchTarget::Listener(l.clone()));
                        }
                    }
                    for c in &watched.connections {
                        if io.is_set(c.raw_fd()) {
                            ready.push(WatchTarget::Connection(c.clone()));
                        }
                    }
                }
                // Listeners first, like the manual scan
                ready.sort_by_key(|t| match t {
                    WatchTarget::Wakeup => 0,
                    WatchTarget::Listener(_) => 1,
                    WatchTarget::Connection(_) => 2,
                });
                for target in ready {
                    match target {
                        WatchTarget::Wakeup => shared.notifier.drain(),
                        WatchTarget::Listener(l) => {
                            for conn in listener::accept_pending(&ctx, &l) {
                                watched.connections.push(conn);
                            }
                        }
                        WatchTarget::Connection(c) => process_socket(&ctx, &c),
                    }
                }
            }
            WaitOutcome::Timeout | WaitOutcome::Interrupted => {}
            WaitOutcome::BadDescriptor => bad_descriptor_sweep(&watched),
            WaitOutcome::Error(errno) => {
                consecutive_errors += 1;
                warn!(errno, consecutive_errors, "multiplexing wait failed");
                if consecutive_errors >= 2 {
                    error!("multiplexing wait keeps failing, stopping reader");
                    break 'main;
                }
            }
            WaitOutcome::Fatal => {
                error!(backend = %io.kind(), "multiplexing backend unusable, stopping reader");
                break 'main;
            }
        }

        // ── Step 5: drain commands ──
        shared.set_state(ReaderState::DrainingCommands);
        loop {
            let cmd = match stashed.pop_front() {
                Some(c) => c,
                None => match shared.commands.try_pop() {
                    Some(c) => c,
                    None => break,
                },
            };
            if let Flow::Stop = handle_command(&shared, cmd, &mut watched, &mut io, &mut stashed) {
                break 'main;
            }
        }
    }

    io.clear();
    drop(watched);
    shared.watched.store(0, Ordering::Relaxed);
    shared.set_state(ReaderState::Stopped);
    info!("reader loop finished");
    shared.stopped.push(());
}

fn handle_command(
    shared: &ReaderShared,
    cmd: ReaderCommand,
    watched: &mut Watched,
    io: &mut Box<dyn IoWait>,
    stashed: &mut VecDeque<ReaderCommand>,
) -> Flow {
    match cmd {
        ReaderCommand::Connection(conn) => {
            if !watched.connections.contains(&conn) {
                debug!(conn = conn.id(), "watching connection");
                watched.connections.push(conn);
            }
        }
        ReaderCommand::Listener(conn) => {
            if !watched.listeners.contains(&conn) {
                debug!(conn = conn.id(), host = conn.host(), port = conn.port(), "watching listener");
                watched.listeners.push(conn);
            }
        }
        ReaderCommand::Terminate => {
            debug!(connections = watched.connections.len(), listeners = watched.listeners.len(), "reader terminating");
            io.clear();
            watched.connections.clear();
            watched.listeners.clear();
            return Flow::Stop;
        }
        ReaderCommand::IoWaitChanged => {
            shared.swap_ack.push(());
            loop {
                match shared.commands.timed_pop(SWAP_READY_TIMEOUT) {
                    Some(ReaderCommand::IoWaitReady(Some(backend))) => {
                        info!(from = %io.kind(), to = %backend.kind(), "multiplexing backend swapped");
                        io.clear();
                        *io = backend;
                        break;
                    }
                    Some(ReaderCommand::IoWaitReady(None)) => break,
                    Some(ReaderCommand::Terminate) => {
                        warn!("terminate received during a backend swap, keeping the current backend");
                        stashed.push_back(ReaderCommand::Terminate);
                        break;
                    }
                    Some(other) => stashed.push_back(other),
                    None => {
                        warn!(timeout = ?SWAP_READY_TIMEOUT, backend = %io.kind(), "no new backend supplied, keeping the current one");
                        break;
                    }
                }
            }
            shared.notifier.drain();
        }
        ReaderCommand::IoWaitReady(_) => {
            debug!("backend ready notification without a pending swap");
        }
        ReaderCommand::Foreach { visitor, done } => {
            if let Some(mut visit) = visitor {
                for conn in watched.listeners.iter().chain(watched.connections.iter()) {
                    if catch_unwind(AssertUnwindSafe(|| visit(conn))).is_err() {
                        warn!(conn = conn.id(), "foreach visitor panicked");
                    }
                }
            }
            done.push(());
        }
    }
    shared.watched.store(watched.len(), Ordering::Relaxed);
    Flow::Continue
}

/// A watched descriptor went bad: find who and drop them.
fn bad_descriptor_sweep(watched: &Watched) {
    use nix::errno::Errno;
    use nix::sys::socket::{recv, MsgFlags};

    let mut buf = [0u8; 1];
    for conn in watched.listeners.iter().chain(watched.connections.iter()) {
        match recv(conn.raw_fd(), &mut buf, MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT) {
            Err(Errno::EBADF) | Err(Errno::ENOTSOCK) => {
                conn.shutdown_and_record_error(Status::ConnectionError, "socket descriptor is no longer valid");
            }
            _ => {}
        }
    }
}

/// Read and deliver everything available on `conn`.
fn process_socket(ctx: &Context, conn: &Connection) {
    if let Some(preread) = conn.preread_handler() {
        if catch_unwind(AssertUnwindSafe(|| preread(conn))).is_err() {
            conn.shutdown_and_record_error(Status::Error, "pre-read handler panicked");
        }
        return;
    }

    let batch = conn.read_frames();
    if !batch.frames.is_empty() {
        conn.touch();
    }

    for item in batch.frames {
        if !conn.is_ok() {
            return;
        }
        match item {
            Incoming::Seq(seq) => match conn.channel(seq.channel) {
                Some(ch) => ch.on_seq(conn, &seq),
                None => trace!(conn = conn.id(), channel = seq.channel, "SEQ for a closed channel"),
            },
            Incoming::Frame(mut frame) => {
                frame.set_id(ctx.next_frame_id());
                if conn.is_initial_accept() {
                    control::second_step_accept(conn, frame);
                    continue;
                }
                let ch = match conn.channel(frame.channel()) {
                    Some(ch) => ch,
                    None => {
                        conn.shutdown_and_record_error(
                            Status::ProtocolError,
                            format!("frame for unknown channel {}", frame.channel()),
                        );
                        return;
                    }
                };
                match ch.receive(conn, frame) {
                    Ok(Some(frame)) => deliver(ctx, conn, &ch, frame),
                    Ok(None) => {}
                    Err(violation) => {
                        ch.protocol_violation(conn, &violation);
                        return;
                    }
                }
            }
        }
    }

    match batch.end {
        None => {}
        Some(ReadEnd::Closed) => {
            if conn.is_being_closed() {
                conn.shutdown_and_record_error(Status::Ok, "connection closed");
            } else if conn.is_initial_accept() {
                conn.shutdown_and_record_error(Status::ProtocolError, "peer closed the session during greetings");
            } else {
                conn.shutdown_and_record_error(
                    Status::UnnotifiedConnectionClose,
                    "peer closed the connection without closing the session",
                );
            }
        }
        Some(ReadEnd::Failed(status, message)) => conn.shutdown_and_record_error(status, message),
    }
}

/// Three-level delivery: global hook, channel handler, profile handler.
fn deliver(ctx: &Context, conn: &Connection, ch: &Channel, frame: Frame) {
    if ch.number() == 0 {
        control::handle_control_frame(conn, ch, frame);
        return;
    }
    trace!(conn = conn.id(), channel = ch.number(), msgno = frame.msgno(), kind = %frame.frame_type(), "deliver");

    if let Some(hook) = ctx.frame_received_hook() {
        if catch_unwind(AssertUnwindSafe(|| hook(ch, conn, frame))).is_err() {
            warn!(conn = conn.id(), channel = ch.number(), "global frame handler panicked");
        }
        return;
    }
    if let Some(handler) = ch.received_handler() {
        if catch_unwind(AssertUnwindSafe(|| handler(ch, conn, frame))).is_err() {
            warn!(conn = conn.id(), channel = ch.number(), "channel frame handler panicked");
        }
        return;
    }
    if let Err(frame) = ctx.profiles().invoke_frame_received(ch.profile(), ctx.workers(), ch, conn, frame) {
        warn!(
            conn = conn.id(),
            channel = ch.number(),
            profile = ch.profile(),
            msgno = frame.msgno(),
            "no handler took the frame, dropping it"
        );
    }
}
