//! Connections
//!
//! A `Connection` is a cheap, cloneable handle on one BEEP session (or on a
//! listening socket in the `MasterListener` role). Every clone is a counted
//! reference; the reader loop holds one while the connection is watched,
//! in-flight deliveries hold one each.
//!
//! Locking: the channel and pool tables share one short-lived mutex
//! (`tables`), which the reader takes for every lookup. Pool mutations are
//! additionally serialized on `pool_lock`, held across channel creation and
//! close round trips. Order: `pool_lock`, then `tables`, then a channel's
//! state lock.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use tracing::{debug, info, warn};

use beep_core::constants::{MAX_BUFFER_SIZE, MAX_CHANNEL_NO};
use beep_core::{BeepError, BlockingQueue, Frame, FrameDecoder, FrameKind, Incoming, LockExt, Result, RwLockExt, Status};

use crate::channel::Channel;
use crate::context::Context;
use crate::greetings;
use crate::pool::PoolSlot;
use crate::transport::{send_all, Transport};

/// Which side of the session this connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// We connected out
    Initiator,
    /// Accepted from one of our listeners
    Listener,
    /// A listening socket; owns no channels
    MasterListener,
}

pub type OnCloseHandler = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Called instead of the framing reader when installed.
pub type PrereadHandler = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Returns `true` for profiles to hide from the greeting and refuse on start.
pub type ProfileMask = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub type ConnData = Arc<dyn Any + Send + Sync>;

pub(crate) struct ConnTables {
    pub(crate) channels: BTreeMap<u32, Channel>,
    pub(crate) pools: BTreeMap<u32, PoolSlot>,
    next_pool_id: u32,
    last_channel_no: u32,
}

struct FrameReader {
    decoder: FrameDecoder,
    scratch: Vec<u8>,
    /// Consecutive readiness events that produced no data
    no_data: u32,
}

/// How a read pass ended, beyond the frames it produced.
pub(crate) enum ReadEnd {
    /// Peer closed the socket
    Closed,
    Failed(Status, String),
}

pub(crate) struct ReadBatch {
    pub(crate) frames: Vec<Incoming>,
    pub(crate) end: Option<ReadEnd>,
}

enum Socket {
    Stream(RwLock<Arc<dyn Transport>>),
    Listener(TcpListener),
}

pub(crate) struct ConnInner {
    id: u64,
    ctx: Context,
    role: Role,
    socket: Socket,
    host: String,
    port: u16,
    is_ok: AtomicBool,
    being_closed: AtomicBool,
    initial_accept: AtomicBool,
    reader_unwatch: AtomicBool,
    blocked: AtomicBool,
    idle_notified: AtomicBool,
    tables: Mutex<ConnTables>,
    pool_lock: Mutex<()>,
    errors: Mutex<VecDeque<(Status, String)>>,
    data: Mutex<HashMap<String, ConnData>>,
    profile_mask: RwLock<Option<ProfileMask>>,
    preread: RwLock<Option<PrereadHandler>>,
    on_close: Mutex<Vec<OnCloseHandler>>,
    remote_profiles: Mutex<Vec<String>>,
    framing: Mutex<FrameReader>,
    priority_out: SegQueue<Vec<u8>>,
    normal_out: SegQueue<Vec<u8>>,
    write_lock: Mutex<()>,
    last_activity: Mutex<Instant>,
    greeting: BlockingQueue<Result<()>>,
    control_waiters: Mutex<VecDeque<BlockingQueue<Option<Frame>>>>,
}

/// Counted handle on a BEEP connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("host", &self.inner.host)
            .field("port", &self.inner.port)
            .field("is_ok", &self.is_ok())
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

impl Connection {
    fn create(ctx: &Context, socket: Socket, role: Role, host: String, port: u16, initial_accept: bool) -> Connection {
        let conn = Connection {
            inner: Arc::new(ConnInner {
                id: ctx.next_connection_id(),
                ctx: ctx.clone(),
                role,
                socket,
                host,
                port,
                is_ok: AtomicBool::new(true),
                being_closed: AtomicBool::new(false),
                initial_accept: AtomicBool::new(initial_accept),
                reader_unwatch: AtomicBool::new(false),
                blocked: AtomicBool::new(false),
                idle_notified: AtomicBool::new(false),
                tables: Mutex::new(ConnTables {
                    channels: BTreeMap::new(),
                    pools: BTreeMap::new(),
                    next_pool_id: 1,
                    last_channel_no: 0,
                }),
                pool_lock: Mutex::new(()),
                errors: Mutex::new(VecDeque::new()),
                data: Mutex::new(HashMap::new()),
                profile_mask: RwLock::new(None),
                preread: RwLock::new(None),
                on_close: Mutex::new(Vec::new()),
                remote_profiles: Mutex::new(Vec::new()),
                framing: Mutex::new(FrameReader {
                    decoder: FrameDecoder::with_max_payload(MAX_BUFFER_SIZE),
                    scratch: vec![0u8; 64 * 1024],
                    no_data: 0,
                }),
                priority_out: SegQueue::new(),
                normal_out: SegQueue::new(),
                write_lock: Mutex::new(()),
                last_activity: Mutex::new(Instant::now()),
                greeting: BlockingQueue::new(),
                control_waiters: Mutex::new(VecDeque::new()),
            }),
        };
        if role != Role::MasterListener {
            let ch0 = Channel::new_control(&conn);
            conn.tables().channels.insert(0, ch0);
        }
        conn
    }

    /// Wrap an already connected stream. No greeting is sent.
    pub(crate) fn from_stream(ctx: &Context, transport: Arc<dyn Transport>, role: Role, initial_accept: bool) -> Connection {
        let (host, port) = transport.peer().unwrap_or_default();
        Self::create(ctx, Socket::Stream(RwLock::new(transport)), role, host, port, initial_accept)
    }

    pub(crate) fn new_master_listener(ctx: &Context, listener: TcpListener, host: String, port: u16) -> Connection {
        Self::create(ctx, Socket::Listener(listener), Role::MasterListener, host, port, false)
    }

    /// Open a TCP session to `host:port` and exchange greetings.
    ///
    /// Returns once the peer's greeting has been processed, bounded by the
    /// context's `connect_timeout`.
    pub fn connect(ctx: &Context, host: &str, port: u16) -> Result<Connection> {
        let timeout = ctx.config().connect_timeout;
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| BeepError::Connection(format!("cannot resolve {}:{}: {}", host, port, e)))?;

        let mut last_err = None;
        let mut stream = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let stream = match (stream, last_err) {
            (Some(s), _) => s,
            (None, Some(e)) if e.kind() == io::ErrorKind::TimedOut => return Err(BeepError::ConnectionTimeout),
            (None, Some(e)) => return Err(BeepError::Connection(format!("connect to {}:{} failed: {}", host, port, e))),
            (None, None) => return Err(BeepError::Connection(format!("no address for {}:{}", host, port))),
        };
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;

        let conn = Self::create(
            ctx,
            Socket::Stream(RwLock::new(Arc::new(stream))),
            Role::Initiator,
            host.to_string(),
            port,
            true,
        );
        conn.start_session(timeout)?;
        info!(conn = conn.id(), host, port, "connection established");
        Ok(conn)
    }

    /// Run a BEEP session over an arbitrary transport (a socket pair, a
    /// tunnel). Greetings are exchanged before returning.
    pub fn from_transport(ctx: &Context, transport: Arc<dyn Transport>, role: Role) -> Result<Connection> {
        if role == Role::MasterListener {
            return Err(BeepError::InvalidArgument("a stream cannot be a master listener".into()));
        }
        transport.set_nonblocking(true)?;
        let conn = Self::from_stream(ctx, transport, role, true);
        conn.start_session(ctx.config().connect_timeout)?;
        Ok(conn)
    }

    /// Send our greeting, hand the connection to the reader and wait until
    /// the peer's greeting went through the second-step accept.
    fn start_session(&self, timeout: Duration) -> Result<()> {
        self.send_greeting()?;
        self.context().reader().watch_connection(self.clone())?;
        match self.inner.greeting.timed_pop(timeout) {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => {
                self.shutdown();
                Err(e)
            }
            None => {
                self.shutdown_and_record_error(Status::ConnectionTimeoutError, "greeting not received in time");
                Err(BeepError::ConnectionTimeout)
            }
        }
    }

    pub(crate) fn send_greeting(&self) -> Result<()> {
        let profiles: Vec<String> = self
            .context()
            .profiles()
            .registered()
            .into_iter()
            .filter(|uri| !self.is_profile_filtered(uri))
            .collect();
        let ch0 = self.channel(0).ok_or(BeepError::NotConnected)?;
        ch0.queue_message(FrameKind::Rpy, 0, greetings::build_greeting(&profiles).as_bytes())?;
        self.flush();
        Ok(())
    }

    /// Second-step accept finished (or failed).
    pub(crate) fn greeting_done(&self, result: Result<()>) {
        if result.is_ok() {
            self.inner.initial_accept.store(false, Ordering::Release);
        }
        self.inner.greeting.push(result);
    }

    // ── identity ──

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// Live handles to this connection
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<ConnInner>) -> Option<Connection> {
        weak.upgrade().map(|inner| Connection { inner })
    }

    // ── status flags ──

    pub fn is_ok(&self) -> bool {
        self.inner.is_ok.load(Ordering::Acquire)
    }

    pub fn is_being_closed(&self) -> bool {
        self.inner.being_closed.load(Ordering::Acquire)
    }

    pub(crate) fn set_being_closed(&self, on: bool) {
        self.inner.being_closed.store(on, Ordering::Release);
    }

    /// Still waiting for the peer's greeting
    pub fn is_initial_accept(&self) -> bool {
        self.inner.initial_accept.load(Ordering::Acquire)
    }

    /// A blocked connection stays watched but is not polled for data.
    pub fn set_blocked(&self, on: bool) {
        self.inner.blocked.store(on, Ordering::Release);
    }

    pub fn is_blocked(&self) -> bool {
        self.inner.blocked.load(Ordering::Acquire)
    }

    pub(crate) fn set_reader_unwatch(&self) {
        self.inner.reader_unwatch.store(true, Ordering::Release);
    }

    /// Returns and clears the unwatch request.
    pub(crate) fn take_reader_unwatch(&self) -> bool {
        self.inner.reader_unwatch.swap(false, Ordering::AcqRel)
    }

    // ── channels ──

    pub(crate) fn tables(&self) -> MutexGuard<'_, ConnTables> {
        self.inner.tables.locked()
    }

    /// The channel-pool mutex
    pub(crate) fn pool_lock(&self) -> MutexGuard<'_, ()> {
        self.inner.pool_lock.locked()
    }

    pub fn channel(&self, number: u32) -> Option<Channel> {
        self.tables().channels.get(&number).cloned()
    }

    pub fn channel_exists(&self, number: u32) -> bool {
        self.tables().channels.contains_key(&number)
    }

    /// Channels including channel 0
    pub fn channels_count(&self) -> usize {
        self.tables().channels.len()
    }

    pub fn channel_numbers(&self) -> Vec<u32> {
        self.tables().channels.keys().copied().collect()
    }

    /// Next free channel number for our side: odd for initiators, even
    /// for listeners.
    pub(crate) fn allocate_channel_number(&self) -> Option<u32> {
        let mut t = self.tables();
        let first = if self.inner.role == Role::Initiator { 1 } else { 2 };
        let mut candidate = if t.last_channel_no == 0 { first } else { t.last_channel_no + 2 };
        for _ in 0..(MAX_CHANNEL_NO / 2) {
            if candidate > MAX_CHANNEL_NO {
                candidate = first;
            }
            if !t.channels.contains_key(&candidate) {
                t.last_channel_no = candidate;
                return Some(candidate);
            }
            candidate += 2;
        }
        None
    }

    /// Insert `channel` unless its number is taken.
    pub(crate) fn insert_channel(&self, channel: &Channel) -> bool {
        let mut t = self.tables();
        if t.channels.contains_key(&channel.number()) {
            return false;
        }
        t.channels.insert(channel.number(), channel.clone());
        true
    }

    /// Drop a channel from the table and from whatever pool lists it.
    pub(crate) fn remove_channel(&self, number: u32) -> Option<Channel> {
        let mut t = self.tables();
        let ch = t.channels.remove(&number)?;
        if let Some(pool_id) = ch.pool_id() {
            if let Some(slot) = t.pools.get_mut(&pool_id) {
                slot.channels.retain(|c| c.number() != number);
            }
            ch.set_membership(None);
        }
        Some(ch)
    }

    pub(crate) fn allocate_pool_id(&self) -> u32 {
        let mut t = self.tables();
        let id = t.next_pool_id;
        t.next_pool_id += 1;
        id
    }

    // ── remote profiles and masking ──

    /// Profiles the peer advertised in its greeting
    pub fn remote_profiles(&self) -> Vec<String> {
        self.inner.remote_profiles.locked().clone()
    }

    pub fn is_profile_supported(&self, uri: &str) -> bool {
        self.inner.remote_profiles.locked().iter().any(|p| p == uri)
    }

    pub(crate) fn set_remote_profiles(&self, profiles: Vec<String>) {
        *self.inner.remote_profiles.locked() = profiles;
    }

    pub fn set_profile_mask(&self, mask: Option<ProfileMask>) {
        *self.inner.profile_mask.write_locked() = mask;
    }

    pub fn is_profile_filtered(&self, uri: &str) -> bool {
        match &*self.inner.profile_mask.read_locked() {
            Some(mask) => mask(uri),
            None => false,
        }
    }

    // ── user data and hooks ──

    pub fn set_data(&self, key: impl Into<String>, value: ConnData) {
        self.inner.data.locked().insert(key.into(), value);
    }

    pub fn get_data<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.inner.data.locked().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn remove_data(&self, key: &str) -> Option<ConnData> {
        self.inner.data.locked().remove(key)
    }

    pub fn set_preread_handler(&self, handler: Option<PrereadHandler>) {
        *self.inner.preread.write_locked() = handler;
    }

    pub(crate) fn preread_handler(&self) -> Option<PrereadHandler> {
        self.inner.preread.read_locked().clone()
    }

    /// Called once when the connection goes down, whatever the cause.
    pub fn add_on_close(&self, handler: OnCloseHandler) {
        self.inner.on_close.locked().push(handler);
    }

    // ── errors and teardown ──

    /// Oldest recorded `(status, message)`, if any.
    pub fn pop_error(&self) -> Option<(Status, String)> {
        self.inner.errors.locked().pop_front()
    }

    pub(crate) fn record_error(&self, status: Status, message: impl Into<String>) {
        self.inner.errors.locked().push_back((status, message.into()));
    }

    /// Record why the connection dies, then shut it down.
    pub fn shutdown_and_record_error(&self, status: Status, message: impl Into<String>) {
        let message = message.into();
        if self.is_ok() {
            match status {
                Status::Ok => debug!(conn = self.id(), %message, "connection closing"),
                _ => warn!(conn = self.id(), %status, %message, "shutting connection down"),
            }
        }
        self.record_error(status, message);
        self.shutdown();
    }

    /// Drop the session immediately, without close negotiation.
    ///
    /// Idempotent; on-close handlers run exactly once.
    pub fn shutdown(&self) {
        if !self.inner.is_ok.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!(conn = self.id(), role = ?self.role(), "connection shutdown");
        if let Some(t) = self.transport() {
            if let Err(e) = t.shutdown() {
                debug!(conn = self.id(), error = %e, "transport shutdown");
            }
        }

        self.inner.greeting.push(Err(BeepError::NotConnected));
        for waiter in self.inner.control_waiters.locked().drain(..) {
            waiter.push(None);
        }

        let channels: Vec<Channel> = self.tables().channels.values().cloned().collect();
        for ch in &channels {
            ch.wake_waiters();
        }

        let handlers = std::mem::take(&mut *self.inner.on_close.locked());
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(self))).is_err() {
                warn!(conn = self.id(), "on-close handler panicked");
            }
        }

        let mut t = self.tables();
        for slot in t.pools.values() {
            for ch in &slot.channels {
                ch.set_membership(None);
            }
        }
        t.pools.clear();
        t.channels.clear();
    }

    /// Graceful close: close every channel, then channel 0.
    pub fn close(&self) -> Result<()> {
        if !self.is_ok() {
            return Ok(());
        }
        if self.inner.role == Role::MasterListener {
            self.shutdown();
            return Ok(());
        }
        self.set_being_closed(true);

        let channels: Vec<Channel> = self
            .tables()
            .channels
            .values()
            .filter(|c| c.number() != 0)
            .cloned()
            .collect();
        for ch in channels {
            if let Err(e) = ch.close() {
                debug!(conn = self.id(), channel = ch.number(), error = %e, "channel close during connection close");
            }
        }

        if self.is_ok() {
            match self.control_request(&greetings::build_close(0, 200)) {
                Ok(reply) if reply.kind() == FrameKind::Err => {
                    self.set_being_closed(false);
                    let (code, message) = greetings::parse_error(&reply.content_str());
                    return Err(BeepError::ChannelRefused { code, message });
                }
                Ok(_) => {}
                Err(e) => debug!(conn = self.id(), error = %e, "close of channel 0 got no reply"),
            }
        }
        self.shutdown_and_record_error(Status::Ok, "connection closed");
        Ok(())
    }

    // ── transport ──

    pub(crate) fn transport(&self) -> Option<Arc<dyn Transport>> {
        match &self.inner.socket {
            Socket::Stream(t) => Some(Arc::clone(&*t.read_locked())),
            Socket::Listener(_) => None,
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        match &self.inner.socket {
            Socket::Stream(t) => t.read_locked().raw_fd(),
            Socket::Listener(l) => l.as_raw_fd(),
        }
    }

    pub(crate) fn accept(&self) -> io::Result<(TcpStream, std::net::SocketAddr)> {
        match &self.inner.socket {
            Socket::Listener(l) => l.accept(),
            Socket::Stream(_) => Err(io::Error::new(io::ErrorKind::InvalidInput, "not a listener")),
        }
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match &self.inner.socket {
            Socket::Listener(l) => l.local_addr().ok(),
            Socket::Stream(_) => None,
        }
    }

    /// Swap the byte transport (after a tunnel was negotiated) and restart
    /// the session: channel 0 is reset and greetings are exchanged again.
    pub fn replace_transport(&self, transport: Arc<dyn Transport>) -> Result<()> {
        let slot = match &self.inner.socket {
            Socket::Stream(t) => t,
            Socket::Listener(_) => return Err(BeepError::InvalidArgument("listener has no stream".into())),
        };
        transport.set_nonblocking(true)?;
        *slot.write_locked() = transport;
        self.inner.framing.locked().decoder.clear();
        while self.inner.priority_out.pop().is_some() {}
        while self.inner.normal_out.pop().is_some() {}

        self.inner.initial_accept.store(true, Ordering::Release);
        while self.inner.greeting.try_pop().is_some() {}
        {
            let mut t = self.tables();
            t.channels.retain(|n, _| *n == 0);
            t.pools.clear();
            t.channels.insert(0, Channel::new_control(self));
        }
        info!(conn = self.id(), "transport replaced, restarting greeting exchange");
        self.send_greeting()?;
        match self.inner.greeting.timed_pop(self.context().config().connect_timeout) {
            Some(r) => r,
            None => Err(BeepError::ConnectionTimeout),
        }
    }

    /// One read pass: a single `recv`, then every complete frame buffered.
    pub(crate) fn read_frames(&self) -> ReadBatch {
        let mut batch = ReadBatch { frames: Vec::new(), end: None };
        let transport = match self.transport() {
            Some(t) => t,
            None => return batch,
        };
        let max_no_data = self.context().config().max_no_data_reads;
        let mut guard = self.inner.framing.locked();
        let rd = &mut *guard;

        match transport.recv(&mut rd.scratch) {
            Ok(0) => batch.end = Some(ReadEnd::Closed),
            Ok(n) => {
                rd.no_data = 0;
                rd.decoder.feed(&rd.scratch[..n]);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                rd.no_data += 1;
                if rd.no_data > max_no_data {
                    batch.end = Some(ReadEnd::Failed(
                        Status::ConnectionError,
                        format!("{} reads without data", rd.no_data),
                    ));
                }
            }
            Err(e) => {
                batch.end = Some(ReadEnd::Failed(Status::ConnectionError, format!("recv failed: {}", e)));
            }
        }

        loop {
            match rd.decoder.decode() {
                Ok(Some(item)) => batch.frames.push(item),
                Ok(None) => break,
                Err(e) => {
                    batch.end = Some(ReadEnd::Failed(Status::ProtocolError, e.to_string()));
                    break;
                }
            }
        }
        batch
    }

    /// Queue encoded bytes for sending. SEQ frames use the priority lane.
    pub(crate) fn enqueue(&self, bytes: Vec<u8>, priority: bool) {
        if priority {
            self.inner.priority_out.push(bytes);
        } else {
            self.inner.normal_out.push(bytes);
        }
    }

    /// Write out queued frames.
    ///
    /// Never blocks on another writer: whoever holds the write lock drains
    /// both lanes and re-checks after releasing it.
    pub(crate) fn flush(&self) {
        let timeout = self.context().config().write_timeout;
        loop {
            let guard = match self.inner.write_lock.try_lock() {
                Ok(g) => g,
                Err(std::sync::TryLockError::WouldBlock) => return,
                Err(std::sync::TryLockError::Poisoned(p)) => p.into_inner(),
            };
            let transport = match self.transport() {
                Some(t) => t,
                None => return,
            };
            loop {
                let next = self.inner.priority_out.pop().or_else(|| self.inner.normal_out.pop());
                let bytes = match next {
                    Some(b) => b,
                    None => break,
                };
                if !self.is_ok() {
                    continue;
                }
                if let Err(e) = send_all(transport.as_ref(), &bytes, timeout) {
                    drop(guard);
                    self.shutdown_and_record_error(Status::ConnectionError, format!("send failed: {}", e));
                    return;
                }
            }
            drop(guard);
            if self.inner.priority_out.is_empty() && self.inner.normal_out.is_empty() {
                return;
            }
        }
    }

    // ── channel 0 requests ──

    /// Send a management MSG on channel 0 and wait for its reply.
    pub(crate) fn control_request(&self, xml: &str) -> Result<Frame> {
        if self.context().reader().is_reader_thread() {
            return Err(BeepError::InvalidArgument("blocking channel 0 request on the reader thread".into()));
        }
        let ch0 = self.channel(0).ok_or(BeepError::NotConnected)?;
        let waiter = BlockingQueue::new();
        {
            let mut waiters = self.inner.control_waiters.locked();
            ch0.queue_message(FrameKind::Msg, 0, xml.as_bytes())?;
            waiters.push_back(waiter.clone());
        }
        self.flush();
        // A timed-out waiter stays queued so a late reply still lines up
        match waiter.timed_pop(self.context().config().reply_timeout) {
            Some(Some(frame)) => Ok(frame),
            Some(None) => Err(BeepError::NotConnected),
            None => Err(BeepError::Timeout),
        }
    }

    /// Route a channel 0 reply to the oldest waiting request.
    pub(crate) fn complete_control_request(&self, frame: Frame) {
        match self.inner.control_waiters.locked().pop_front() {
            Some(waiter) => waiter.push(Some(frame)),
            None => warn!(conn = self.id(), msgno = frame.msgno(), "unsolicited reply on channel 0"),
        }
    }

    // ── idle tracking ──

    pub(crate) fn touch(&self) {
        *self.inner.last_activity.locked() = Instant::now();
        self.inner.idle_notified.store(false, Ordering::Release);
    }

    /// True once per idle period longer than `timeout`.
    pub(crate) fn check_idle(&self, timeout: Duration) -> bool {
        let idle = self.inner.last_activity.locked().elapsed();
        idle >= timeout && !self.inner.idle_notified.swap(true, Ordering::AcqRel)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use std::os::unix::net::UnixStream;

    pub(crate) fn test_context() -> Context {
        Context::new(
            ContextConfig::new()
                .worker_threads(2)
                .wait_timeout(Duration::from_millis(50))
                .stop_timeout(Duration::from_secs(5))
                .connect_timeout(Duration::from_secs(5))
                .reply_timeout(Duration::from_secs(5))
                .automatic_mime(false),
        )
        .unwrap()
    }

    /// Connection over one end of a socket pair, past the greeting stage.
    pub(crate) fn raw_pair(ctx: &Context, role: Role) -> (Connection, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let conn = Connection::from_stream(ctx, Arc::new(ours), role, false);
        (conn, theirs)
    }

    #[test]
    fn test_channel_zero_exists() {
        let ctx = test_context();
        let (conn, _peer) = raw_pair(&ctx, Role::Initiator);
        assert!(conn.channel_exists(0));
        assert_eq!(conn.channels_count(), 1);
        assert!(conn.is_ok());
        ctx.exit().unwrap();
    }

    #[test]
    fn test_channel_numbers_by_role() {
        let ctx = test_context();
        let (init, _p1) = raw_pair(&ctx, Role::Initiator);
        let (lst, _p2) = raw_pair(&ctx, Role::Listener);
        assert_eq!(init.allocate_channel_number(), Some(1));
        assert_eq!(init.allocate_channel_number(), Some(3));
        assert_eq!(lst.allocate_channel_number(), Some(2));
        ctx.exit().unwrap();
    }

    #[test]
    fn test_shutdown_is_idempotent_and_fires_on_close_once() {
        let ctx = test_context();
        let (conn, _peer) = raw_pair(&ctx, Role::Initiator);
        let fired = BlockingQueue::new();
        let f2 = fired.clone();
        conn.add_on_close(Arc::new(move |_c: &Connection| f2.push(())));
        conn.shutdown_and_record_error(Status::ProtocolError, "bad frame");
        conn.shutdown();
        conn.shutdown();
        assert!(!conn.is_ok());
        assert_eq!(fired.items(), 1);
        assert_eq!(conn.pop_error(), Some((Status::ProtocolError, "bad frame".to_string())));
        assert_eq!(conn.pop_error(), None);
        assert_eq!(conn.channels_count(), 0);
        ctx.exit().unwrap();
    }

    #[test]
    fn test_data_store_and_mask() {
        let ctx = test_context();
        let (conn, _peer) = raw_pair(&ctx, Role::Listener);
        conn.set_data("answer", Arc::new(42u32));
        assert_eq!(conn.get_data::<u32>("answer").as_deref(), Some(&42));
        assert!(conn.get_data::<String>("answer").is_none());
        assert!(conn.remove_data("answer").is_some());

        assert!(!conn.is_profile_filtered("urn:x"));
        conn.set_profile_mask(Some(Arc::new(|uri: &str| uri.starts_with("urn:hidden"))));
        assert!(conn.is_profile_filtered("urn:hidden:1"));
        assert!(!conn.is_profile_filtered("urn:x"));
        ctx.exit().unwrap();
    }

    #[test]
    fn test_flush_writes_priority_lane_first() {
        let ctx = test_context();
        let (conn, peer) = raw_pair(&ctx, Role::Initiator);
        conn.enqueue(b"normal ".to_vec(), false);
        conn.enqueue(b"urgent ".to_vec(), true);
        conn.flush();
        let mut buf = [0u8; 32];
        peer.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut got = Vec::new();
        while got.len() < 14 {
            let n = peer.recv(&mut buf).unwrap();
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&got, b"urgent normal ");
        ctx.exit().unwrap();
    }

    #[test]
    fn test_read_frames_reports_close() {
        let ctx = test_context();
        let (conn, peer) = raw_pair(&ctx, Role::Initiator);
        (&peer).send(b"SEQ 0 0 4096\r\n").unwrap();
        drop(peer);
        // Data and EOF may arrive in one or two passes
        let mut frames = Vec::new();
        let mut closed = false;
        for _ in 0..50 {
            let batch = conn.read_frames();
            frames.extend(batch.frames);
            if matches!(batch.end, Some(ReadEnd::Closed)) {
                closed = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(closed);
        assert_eq!(frames.len(), 1);
        ctx.exit().unwrap();
    }

    #[test]
    fn test_idle_reads_hit_the_no_data_limit() {
        let ctx = Context::new(
            ContextConfig::new()
                .worker_threads(1)
                .wait_timeout(Duration::from_millis(50))
                .stop_timeout(Duration::from_secs(5))
                .max_no_data_reads(3),
        )
        .unwrap();
        let (conn, peer) = raw_pair(&ctx, Role::Initiator);
        for _ in 0..3 {
            assert!(conn.read_frames().end.is_none());
        }
        // Data resets the count
        (&peer).send(b"SEQ 0 0 4096\r\n").unwrap();
        assert_eq!(conn.read_frames().frames.len(), 1);
        for _ in 0..3 {
            assert!(conn.read_frames().end.is_none());
        }
        match conn.read_frames().end {
            Some(ReadEnd::Failed(status, _)) => assert_eq!(status, Status::ConnectionError),
            _ => panic!("expected the no-data limit to fail the read"),
        }
        ctx.exit().unwrap();
    }

    #[test]
    fn test_replace_transport_restarts_greeting() {
        let ctx = test_context();
        let (conn, _old_peer) = raw_pair(&ctx, Role::Initiator);
        Channel::new_local(&conn, 3, "urn:old");
        ctx.reader().watch_connection(conn.clone()).unwrap();

        let (ours, theirs) = UnixStream::pair().unwrap();
        let peer = std::thread::spawn(move || {
            theirs.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            let mut dec = FrameDecoder::new();
            let mut buf = [0u8; 4096];
            let greeting = loop {
                if let Some(Incoming::Frame(f)) = dec.decode().unwrap() {
                    break f;
                }
                let n = theirs.recv(&mut buf).unwrap();
                assert!(n > 0, "peer closed");
                dec.feed(&buf[..n]);
            };
            assert_eq!((greeting.kind(), greeting.channel(), greeting.msgno()), (FrameKind::Rpy, 0, 0));
            let body = greetings::build_greeting(&["urn:new".to_string()]);
            let frame = format!("RPY 0 0 . 0 {}\r\n{}END\r\n", body.len(), body);
            send_all(&theirs, frame.as_bytes(), Duration::from_secs(2)).unwrap();
            theirs
        });

        conn.replace_transport(Arc::new(ours)).unwrap();
        let _theirs = peer.join().unwrap();
        assert!(!conn.is_initial_accept());
        assert!(conn.is_ok());
        assert_eq!(conn.remote_profiles(), vec!["urn:new".to_string()]);
        assert_eq!(conn.channel_numbers(), vec![0]);
        ctx.exit().unwrap();
    }
}
