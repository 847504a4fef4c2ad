//! Channels
//!
//! A `Channel` is a counted handle on one numbered stream inside a
//! connection. Its `ChannelState` (from `beep-core`) sits behind a mutex
//! paired with a condition variable that close waits on for outstanding
//! replies.
//!
//! Outgoing messages are queued on the state and cut into frames while the
//! lock is held, so frames of one channel reach the connection's write
//! queue in sequence-number order whatever thread sends them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use beep_core::constants::{BEEP_XML_MIME_TYPE, DEFAULT_WINDOW_SIZE, MAX_CHANNEL_NO};
use beep_core::{
    encode_seq, Assembly, BeepError, ChannelState, Frame, FrameKind, LockExt, Result, RwLockExt, SeqFrame, Status,
    Violation,
};

use crate::connection::{ConnInner, Connection, Role};
use crate::greetings;
use crate::profiles::{CloseHandler, FrameReceivedHandler};
use crate::worker::{Completion, Delivery};

/// Pool bookkeeping carried by a member channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolMembership {
    pub(crate) pool_id: u32,
    /// Checked out by `get_next_ready`
    pub(crate) busy: bool,
}

#[derive(Default)]
struct ChannelHandlers {
    received: Option<FrameReceivedHandler>,
    close: Option<CloseHandler>,
}

#[derive(Default)]
struct Serial {
    /// Next ticket handed out by the reader
    issued: u64,
    /// Ticket allowed to run now
    next: u64,
    /// Out-of-turn deliveries; `None` marks a skipped ticket
    pending: BTreeMap<u64, Option<Delivery>>,
}

/// Options for opening a channel.
#[derive(Clone, Default)]
pub struct ChannelOptions {
    /// 0 picks the next free number for our role
    pub number: u32,
    pub received: Option<FrameReceivedHandler>,
    pub close: Option<CloseHandler>,
    /// Content piggybacked on the start request
    pub piggyback: Option<String>,
    pub encoding: Option<String>,
    pub serialize: bool,
}

struct ChanInner {
    number: u32,
    profile: String,
    connection: Weak<ConnInner>,
    state: Mutex<ChannelState>,
    replies_cond: Condvar,
    handlers: RwLock<ChannelHandlers>,
    membership: Mutex<Option<PoolMembership>>,
    opened: AtomicBool,
    being_closed: AtomicBool,
    serialize: AtomicBool,
    serial: Mutex<Serial>,
    /// Automatic MIME header block; `None` sends bare content
    mime_prefix: Option<Vec<u8>>,
    max_frame: u32,
    piggyback_reply: Mutex<Option<String>>,
}

/// Counted handle on a channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChanInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("number", &self.inner.number)
            .field("profile", &self.inner.profile)
            .field("opened", &self.is_opened())
            .finish()
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Channel {}

impl Channel {
    fn build(conn: &Connection, number: u32, profile: &str, state: ChannelState, mime_prefix: Option<Vec<u8>>) -> Channel {
        let config = conn.context().config();
        Channel {
            inner: Arc::new(ChanInner {
                number,
                profile: profile.to_string(),
                connection: conn.downgrade(),
                state: Mutex::new(state),
                replies_cond: Condvar::new(),
                handlers: RwLock::new(ChannelHandlers::default()),
                membership: Mutex::new(None),
                opened: AtomicBool::new(false),
                being_closed: AtomicBool::new(false),
                serialize: AtomicBool::new(false),
                serial: Mutex::new(Serial::default()),
                mime_prefix,
                max_frame: config.max_frame_size,
                piggyback_reply: Mutex::new(None),
            }),
        }
    }

    /// Channel 0 of a fresh session. Requests on it are served in arrival
    /// order.
    pub(crate) fn new_control(conn: &Connection) -> Channel {
        let prefix = format!("Content-Type: {}\r\n\r\n", BEEP_XML_MIME_TYPE).into_bytes();
        let ch = Self::build(conn, 0, "", ChannelState::new_control(), Some(prefix));
        ch.inner.opened.store(true, Ordering::Release);
        ch.inner.serialize.store(true, Ordering::Release);
        ch
    }

    /// Channel with local state only; no start exchange, not yet in the
    /// connection's table.
    pub(crate) fn new(conn: &Connection, number: u32, profile: &str) -> Channel {
        let ctx = conn.context();
        let config = ctx.config();
        let mut state = ChannelState::new(number);
        state.set_complete_flag(config.complete_flag);
        if config.window_size != state.window() {
            state.set_window(config.window_size);
        }
        let prefix = ctx.profiles().mime_prefix(profile, config.automatic_mime);
        Self::build(conn, number, profile, state, prefix)
    }

    /// Create, register and mark opened a channel without negotiating it.
    /// Used where the peer side is driven by hand.
    pub(crate) fn new_local(conn: &Connection, number: u32, profile: &str) -> Channel {
        let ch = Self::new(conn, number, profile);
        ch.mark_opened();
        conn.insert_channel(&ch);
        ch
    }

    /// Open a channel running `profile` with default options.
    pub fn open(conn: &Connection, profile: &str) -> Result<Channel> {
        Self::open_with(conn, profile, ChannelOptions::default())
    }

    /// Send a start request and wait for the peer's answer.
    pub fn open_with(conn: &Connection, profile: &str, options: ChannelOptions) -> Result<Channel> {
        if !conn.is_ok() {
            return Err(BeepError::NotConnected);
        }
        if conn.role() == Role::MasterListener {
            return Err(BeepError::InvalidArgument("cannot open channels on a listener".into()));
        }
        if profile.is_empty() {
            return Err(BeepError::InvalidArgument("profile uri is empty".into()));
        }
        if !conn.is_profile_supported(profile) {
            return Err(BeepError::UnknownProfile(profile.to_string()));
        }
        let number = match options.number {
            0 => conn
                .allocate_channel_number()
                .ok_or_else(|| BeepError::InvalidArgument("no free channel numbers".into()))?,
            n if n > MAX_CHANNEL_NO => return Err(BeepError::InvalidArgument(format!("channel number {} out of range", n))),
            n => n,
        };

        let ch = Self::new(conn, number, profile);
        {
            let mut h = ch.inner.handlers.write_locked();
            h.received = options.received.clone();
            h.close = options.close.clone();
        }
        ch.set_serialize(options.serialize);
        if !conn.insert_channel(&ch) {
            return Err(BeepError::InvalidArgument(format!("channel {} already exists", number)));
        }

        let server_name = conn.context().config().server_name.clone();
        let request = greetings::build_start(
            number,
            server_name.as_deref(),
            profile,
            options.encoding.as_deref(),
            options.piggyback.as_deref(),
        );
        let reply = match conn.control_request(&request) {
            Ok(r) => r,
            Err(e) => {
                conn.remove_channel(number);
                return Err(e);
            }
        };
        if reply.kind() == FrameKind::Err {
            conn.remove_channel(number);
            let (code, message) = greetings::parse_error(&reply.content_str());
            debug!(conn = conn.id(), channel = number, code, %message, "channel start refused");
            return Err(BeepError::ChannelRefused { code, message });
        }
        let (uri, piggyback) = match greetings::parse_profile_reply(&reply.content_str()) {
            Ok(r) => r,
            Err(e) => {
                conn.remove_channel(number);
                return Err(e);
            }
        };
        if uri != profile {
            conn.remove_channel(number);
            return Err(BeepError::Protocol(format!("start of {} answered with profile {}", profile, uri)));
        }
        *ch.inner.piggyback_reply.locked() = piggyback;
        ch.mark_opened();
        ch.announce_window(conn);
        debug!(conn = conn.id(), channel = number, profile, "channel opened");
        Ok(ch)
    }

    /// `open_with` on a worker thread.
    pub fn open_async(conn: &Connection, profile: &str, options: ChannelOptions) -> Result<Completion<Result<Channel>>> {
        let conn2 = conn.clone();
        let profile = profile.to_string();
        conn.context()
            .workers()
            .spawn_with(move || Channel::open_with(&conn2, &profile, options))
    }

    /// Tell the peer about a window that differs from the protocol default.
    pub(crate) fn announce_window(&self, conn: &Connection) {
        let seq = {
            let st = self.state();
            if st.window() == DEFAULT_WINDOW_SIZE {
                return;
            }
            SeqFrame { channel: self.inner.number, ackno: st.next_expected_seq_no(), window: st.window() }
        };
        conn.enqueue(encode_seq(&seq), true);
        conn.flush();
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.inner.state.locked()
    }

    // ── identity ──

    pub fn number(&self) -> u32 {
        self.inner.number
    }

    pub fn profile(&self) -> &str {
        &self.inner.profile
    }

    pub fn connection(&self) -> Option<Connection> {
        Connection::upgrade(&self.inner.connection)
    }

    pub(crate) fn belongs_to(&self, conn: &Connection) -> bool {
        self.connection().map(|c| c == *conn).unwrap_or(false)
    }

    /// Handles to this channel, the connection's table slot included
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Content the peer piggybacked on its start reply
    pub fn take_piggyback_reply(&self) -> Option<String> {
        self.inner.piggyback_reply.locked().take()
    }

    // ── status ──

    pub fn is_opened(&self) -> bool {
        self.inner.opened.load(Ordering::Acquire)
    }

    pub fn is_being_closed(&self) -> bool {
        self.inner.being_closed.load(Ordering::Acquire)
    }

    /// No MSG in either direction waits for its reply.
    pub fn is_ready(&self) -> bool {
        let st = self.state();
        st.outstanding_replies() == 0 && st.unreplied().next().is_none()
    }

    pub fn outstanding_replies(&self) -> usize {
        self.state().outstanding_replies()
    }

    pub fn next_msg_no(&self) -> u32 {
        self.state().next_msg_no()
    }

    pub fn next_expected_seq_no(&self) -> u32 {
        self.state().next_expected_seq_no()
    }

    pub fn next_seq_no(&self) -> u32 {
        self.state().next_seq_no()
    }

    pub fn next_expected_reply_no(&self) -> u32 {
        self.state().next_expected_reply_no()
    }

    pub fn last_msgno_received(&self) -> Option<u32> {
        self.state().last_msgno_received()
    }

    /// Messages waiting for the remote window to reopen
    pub fn pending_outgoing(&self) -> usize {
        self.state().pending_outgoing()
    }

    // ── configuration ──

    /// Second-level received handler; takes precedence over the profile's.
    pub fn set_received_handler(&self, handler: Option<FrameReceivedHandler>) {
        self.inner.handlers.write_locked().received = handler;
    }

    pub(crate) fn received_handler(&self) -> Option<FrameReceivedHandler> {
        self.inner.handlers.read_locked().received.clone()
    }

    /// Consulted when the peer asks to close this channel.
    pub fn set_close_handler(&self, handler: Option<CloseHandler>) {
        self.inner.handlers.write_locked().close = handler;
    }

    pub(crate) fn close_handler(&self) -> Option<CloseHandler> {
        self.inner.handlers.read_locked().close.clone()
    }

    /// Force worker-pool deliveries to run one at a time, in arrival order.
    pub fn set_serialize(&self, on: bool) {
        self.inner.serialize.store(on, Ordering::Release);
    }

    pub fn is_serialized(&self) -> bool {
        self.inner.serialize.load(Ordering::Acquire)
    }

    /// Join fragments before delivery.
    pub fn set_complete_flag(&self, on: bool) {
        self.state().set_complete_flag(on);
    }

    /// Upper bound on fragments per joined message; exceeding it is a
    /// protocol error.
    pub fn set_complete_frame_limit(&self, limit: Option<usize>) {
        self.state().set_frame_limit(limit);
    }

    /// Change the incoming window and advertise it.
    pub fn set_window_size(&self, window: u32) -> Result<()> {
        if window == 0 || window > beep_core::constants::MAX_BUFFER_SIZE as u32 {
            return Err(BeepError::InvalidArgument(format!("window size {} out of range", window)));
        }
        let conn = self.connection().ok_or(BeepError::NotConnected)?;
        let seq = self.state().set_window(window);
        conn.enqueue(encode_seq(&seq), true);
        conn.flush();
        Ok(())
    }

    pub fn window_size(&self) -> u32 {
        self.state().window()
    }

    // ── pool membership ──

    pub(crate) fn membership(&self) -> Option<PoolMembership> {
        *self.inner.membership.locked()
    }

    pub(crate) fn set_membership(&self, membership: Option<PoolMembership>) {
        *self.inner.membership.locked() = membership;
    }

    pub(crate) fn pool_id(&self) -> Option<u32> {
        self.membership().map(|m| m.pool_id)
    }

    /// Checked out of its pool
    pub fn is_busy(&self) -> bool {
        self.membership().map(|m| m.busy).unwrap_or(false)
    }

    /// Set the busy marker if it is clear; `false` otherwise.
    pub(crate) fn try_mark_busy(&self, pool_id: u32) -> bool {
        let mut m = self.inner.membership.locked();
        match m.as_mut() {
            Some(pm) if pm.pool_id == pool_id && !pm.busy => {
                pm.busy = true;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn clear_busy(&self, pool_id: u32) -> bool {
        let mut m = self.inner.membership.locked();
        match m.as_mut() {
            Some(pm) if pm.pool_id == pool_id => {
                pm.busy = false;
                true
            }
            _ => false,
        }
    }

    // ── sending ──

    fn check_sendable(&self, conn: &Connection) -> Result<()> {
        if !conn.is_ok() {
            return Err(BeepError::NotConnected);
        }
        if !self.is_opened() {
            return Err(BeepError::ChannelNotFound(self.inner.number));
        }
        Ok(())
    }

    /// Queue a message and its frames. `msgno` is ignored for `MSG`, which
    /// allocates one; the number used is returned. Does not flush.
    pub(crate) fn queue_message(&self, kind: FrameKind, msgno: u32, content: &[u8]) -> Result<u32> {
        let conn = self.connection().ok_or(BeepError::NotConnected)?;
        let mut payload = Vec::new();
        if kind != FrameKind::Nul {
            if let Some(prefix) = &self.inner.mime_prefix {
                payload.reserve(prefix.len() + content.len());
                payload.extend_from_slice(prefix);
            }
            payload.extend_from_slice(content);
        }

        let mut st = self.state();
        let msgno = match kind {
            FrameKind::Msg => st.allocate_msgno(),
            _ => msgno,
        };
        st.queue_outgoing(kind, msgno, payload);
        for frame in st.pull_frames(self.inner.max_frame) {
            conn.enqueue(frame, false);
        }
        trace!(conn = conn.id(), channel = self.inner.number, ?kind, msgno, waiting = st.pending_outgoing(), "queued");
        Ok(msgno)
    }

    fn send(&self, kind: FrameKind, msgno: u32, content: &[u8]) -> Result<u32> {
        let conn = self.connection().ok_or(BeepError::NotConnected)?;
        self.check_sendable(&conn)?;
        let msgno = self.queue_message(kind, msgno, content)?;
        conn.flush();
        if !conn.is_ok() {
            return Err(BeepError::NotConnected);
        }
        Ok(msgno)
    }

    /// Send a MSG; returns its message number.
    pub fn send_msg(&self, content: &[u8]) -> Result<u32> {
        if self.is_being_closed() {
            return Err(BeepError::InvalidArgument(format!("channel {} is being closed", self.inner.number)));
        }
        self.send(FrameKind::Msg, 0, content)
    }

    /// Send a MSG and block until its reply arrives.
    ///
    /// Installs a temporary received handler, so it cannot be mixed with
    /// another second-level handler on the same channel.
    pub fn send_msg_and_wait(&self, content: &[u8], timeout: Duration) -> Result<Frame> {
        let replies = beep_core::BlockingQueue::new();
        let sink = replies.clone();
        let previous = self.received_handler();
        self.set_received_handler(Some(Arc::new(move |_: &Channel, _: &Connection, frame: Frame| sink.push(frame))));
        let sent = self.send_msg(content);
        let reply = sent.and_then(|msgno| loop {
            match replies.timed_pop(timeout) {
                Some(frame) if frame.msgno() == msgno && frame.kind().is_reply() => break Ok(frame),
                Some(_) => continue,
                None => break Err(BeepError::Timeout),
            }
        });
        self.set_received_handler(previous);
        reply
    }

    pub fn send_rpy(&self, msgno: u32, content: &[u8]) -> Result<()> {
        self.send(FrameKind::Rpy, msgno, content).map(|_| ())
    }

    pub fn send_err(&self, msgno: u32, content: &[u8]) -> Result<()> {
        self.send(FrameKind::Err, msgno, content).map(|_| ())
    }

    /// Send one answer of a one-to-many reply; returns its answer number.
    pub fn send_ans(&self, msgno: u32, content: &[u8]) -> Result<u32> {
        let ansno = self.state().allocate_ansno(msgno);
        self.send(FrameKind::Ans { ansno }, msgno, content)?;
        Ok(ansno)
    }

    /// Close an answer series.
    pub fn send_nul(&self, msgno: u32) -> Result<()> {
        self.send(FrameKind::Nul, msgno, &[]).map(|_| ())
    }

    // ── incoming ──

    /// Run one frame through window, ordering and reassembly checks.
    ///
    /// `Ok(Some)` is a frame ready for delivery, `Ok(None)` a stored
    /// fragment. Any violation means the connection must go down.
    pub(crate) fn receive(&self, conn: &Connection, frame: Frame) -> std::result::Result<Option<Frame>, Violation> {
        let mut st = self.state();
        st.check_window(&frame)?;
        let seq = st.update_incoming_buffer(&frame);
        st.validate(&frame)?;
        st.apply(&frame);
        if st.take_reply_processed() {
            self.inner.replies_cond.notify_all();
        }
        // Incoming headers are split off whatever the outgoing MIME setting
        let parse_mime = st.complete_flag();
        let assembled = st.assemble(frame);
        drop(st);

        if let Some(seq) = seq {
            conn.enqueue(encode_seq(&seq), true);
            conn.flush();
        }
        match assembled? {
            Assembly::Pending => Ok(None),
            Assembly::Deliver(mut frame) => {
                if parse_mime && !frame.more() && frame.kind() != FrameKind::Nul {
                    if let Err(e) = frame.parse_mime() {
                        debug!(conn = conn.id(), channel = self.inner.number, error = %e, "MIME headers not parsed");
                    }
                }
                Ok(Some(frame))
            }
        }
    }

    /// The peer reopened its window: push out what was waiting.
    pub(crate) fn on_seq(&self, conn: &Connection, seq: &SeqFrame) {
        let frames = {
            let mut st = self.state();
            st.update_remote_buffer(seq);
            let frames = st.pull_frames(self.inner.max_frame);
            for frame in &frames {
                conn.enqueue(frame.clone(), false);
            }
            frames.len()
        };
        trace!(conn = conn.id(), channel = self.inner.number, ackno = seq.ackno, window = seq.window, frames, "SEQ");
        if frames > 0 {
            conn.flush();
        }
    }

    // ── serialized delivery ──

    /// Ticket for the next worker delivery, if serialized.
    pub(crate) fn next_ticket(&self) -> Option<u64> {
        if !self.is_serialized() {
            return None;
        }
        let mut s = self.inner.serial.locked();
        let ticket = s.issued;
        s.issued += 1;
        Some(ticket)
    }

    /// Give back a ticket whose delivery never reached a worker.
    ///
    /// The last ticket issued is simply reused. Any other one is marked
    /// skipped so the order moves past it; if it was the current turn the
    /// delivery waiting behind it goes back to the worker pool.
    pub(crate) fn skip_ticket(&self, ticket: Option<u64>) {
        let Some(ticket) = ticket else { return };
        let resume = {
            let mut s = self.inner.serial.locked();
            if ticket + 1 == s.issued && ticket >= s.next {
                s.issued = ticket;
                return;
            }
            if ticket != s.next {
                s.pending.insert(ticket, None);
                return;
            }
            s.next += 1;
            Self::next_pending(&mut s)
        };
        if let Some(delivery) = resume {
            let conn = delivery.connection.clone();
            if let Err(d) = conn.context().workers().deliver(delivery) {
                debug!(conn = conn.id(), channel = self.inner.number, msgno = d.frame.msgno(), "worker pool stopped, delivery dropped");
            }
        }
    }

    /// Take the delivery whose turn it is, stepping over skipped tickets.
    fn next_pending(s: &mut Serial) -> Option<Delivery> {
        loop {
            let turn = s.next;
            match s.pending.remove(&turn) {
                Some(Some(d)) => return Some(d),
                Some(None) => s.next += 1,
                None => return None,
            }
        }
    }

    /// Run deliveries in ticket order; out-of-turn ones wait in the
    /// pending map and are run by whichever worker unblocks them.
    pub(crate) fn deliver_in_order(&self, delivery: Delivery) {
        let mut next = Some(delivery);
        loop {
            let current = {
                let mut s = self.inner.serial.locked();
                match next.take() {
                    Some(d) if d.ticket == Some(s.next) => d,
                    Some(d) => {
                        let ticket = d.ticket.unwrap_or(s.next);
                        s.pending.insert(ticket, Some(d));
                        return;
                    }
                    None => match Self::next_pending(&mut s) {
                        Some(d) => d,
                        None => return,
                    },
                }
            };
            current.invoke();
            self.inner.serial.locked().next += 1;
        }
    }

    // ── teardown ──

    /// Wake threads waiting on replies and drop queued deliveries.
    pub(crate) fn wake_waiters(&self) {
        let _st = self.state();
        self.inner.replies_cond.notify_all();
        drop(_st);
        let pending = std::mem::take(&mut self.inner.serial.locked().pending);
        drop(pending);
    }

    pub(crate) fn mark_opened(&self) {
        self.inner.opened.store(true, Ordering::Release);
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.opened.store(false, Ordering::Release);
        self.wake_waiters();
    }

    /// Wait until our MSGs are answered, bounded by `timeout`.
    fn wait_replies(&self, conn: &Connection, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.state();
        while st.outstanding_replies() > 0 && conn.is_ok() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            st = match self.inner.replies_cond.wait_timeout(st, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Negotiate the close of this channel with the peer.
    ///
    /// Closing channel 0 closes the whole connection.
    pub fn close(&self) -> Result<()> {
        let conn = match self.connection() {
            Some(c) => c,
            None => return Ok(()),
        };
        if self.inner.number == 0 {
            return conn.close();
        }
        if self.inner.being_closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !conn.is_ok() || !self.is_opened() {
            conn.remove_channel(self.inner.number);
            self.mark_closed();
            return Ok(());
        }

        let reply_timeout = conn.context().config().reply_timeout;
        if !self.wait_replies(&conn, reply_timeout) {
            warn!(
                conn = conn.id(),
                channel = self.inner.number,
                outstanding = self.outstanding_replies(),
                "closing channel with replies outstanding"
            );
        }

        match conn.control_request(&greetings::build_close(self.inner.number, 200)) {
            Ok(reply) if reply.kind() == FrameKind::Err => {
                self.inner.being_closed.store(false, Ordering::Release);
                let (code, message) = greetings::parse_error(&reply.content_str());
                debug!(conn = conn.id(), channel = self.inner.number, code, %message, "close refused");
                Err(BeepError::ChannelRefused { code, message })
            }
            Ok(_) | Err(BeepError::NotConnected) => {
                conn.remove_channel(self.inner.number);
                self.mark_closed();
                debug!(conn = conn.id(), channel = self.inner.number, "channel closed");
                Ok(())
            }
            Err(e) => {
                self.inner.being_closed.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Frame-level failure on this channel: record it and drop the session.
    pub(crate) fn protocol_violation(&self, conn: &Connection, violation: &Violation) {
        conn.shutdown_and_record_error(
            Status::ProtocolError,
            format!("channel {}: {}", self.inner.number, violation),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{raw_pair, test_context};
    use beep_core::{FrameDecoder, Incoming};
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    /// Read from the raw peer until `count` items decode.
    fn read_items(peer: &mut UnixStream, count: usize) -> Vec<Incoming> {
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut dec = FrameDecoder::new();
        let mut out = Vec::new();
        let mut buf = [0u8; 8192];
        while out.len() < count {
            while let Some(item) = dec.decode().unwrap() {
                out.push(item);
            }
            if out.len() >= count {
                break;
            }
            let n = peer.read(&mut buf).unwrap();
            assert!(n > 0, "peer closed");
            dec.feed(&buf[..n]);
        }
        out
    }

    fn data_frames(items: Vec<Incoming>) -> Vec<Frame> {
        items
            .into_iter()
            .filter_map(|i| match i {
                Incoming::Frame(f) => Some(f),
                Incoming::Seq(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_send_msg_writes_frame() {
        let ctx = test_context();
        let (conn, mut peer) = raw_pair(&ctx, Role::Initiator);
        let ch = Channel::new_local(&conn, 1, "urn:t");
        assert_eq!(ch.send_msg(b"hello").unwrap(), 0);
        assert_eq!(ch.send_msg(b"again").unwrap(), 1);
        assert_eq!(ch.outstanding_replies(), 2);
        assert!(!ch.is_ready());

        let frames = data_frames(read_items(&mut peer, 2));
        assert_eq!(frames[0].kind(), FrameKind::Msg);
        assert_eq!((frames[0].channel(), frames[0].msgno(), frames[0].seqno()), (1, 0, 0));
        assert_eq!(frames[0].payload(), b"hello");
        assert_eq!(frames[1].seqno(), 5);
        ctx.exit().unwrap();
    }

    #[test]
    fn test_large_message_waits_for_window() {
        let ctx = test_context();
        let (conn, mut peer) = raw_pair(&ctx, Role::Initiator);
        let ch = Channel::new_local(&conn, 1, "urn:t");
        let body = vec![b'x'; 10_000];
        ch.send_msg(&body).unwrap();
        // 4096 octets fit the default remote window
        let first = data_frames(read_items(&mut peer, 1));
        assert_eq!(first[0].size(), 4096);
        assert!(first[0].more());
        assert_eq!(ch.pending_outgoing(), 1);

        ch.on_seq(&conn, &SeqFrame { channel: 1, ackno: 4096, window: 8192 });
        let rest = data_frames(read_items(&mut peer, 2));
        let total: u32 = rest.iter().map(|f| f.size()).sum();
        assert_eq!(total, 10_000 - 4096);
        assert!(!rest[1].more());
        assert_eq!(ch.pending_outgoing(), 0);
        ctx.exit().unwrap();
    }

    #[test]
    fn test_receive_emits_seq_after_half_window() {
        let ctx = test_context();
        let (conn, mut peer) = raw_pair(&ctx, Role::Listener);
        let ch = Channel::new_local(&conn, 2, "urn:t");
        let f = Frame::new(FrameKind::Msg, 2, 0, false, 0, vec![b'a'; 2048]);
        let delivered = ch.receive(&conn, f).unwrap().unwrap();
        assert_eq!(delivered.size(), 2048);
        match &read_items(&mut peer, 1)[0] {
            Incoming::Seq(seq) => assert_eq!((seq.channel, seq.ackno, seq.window), (2, 2048, 4096)),
            other => panic!("expected SEQ, got {:?}", other),
        }
        ctx.exit().unwrap();
    }

    #[test]
    fn test_reply_and_answers() {
        let ctx = test_context();
        let (conn, mut peer) = raw_pair(&ctx, Role::Listener);
        let ch = Channel::new_local(&conn, 2, "urn:t");
        ch.receive(&conn, Frame::new(FrameKind::Msg, 2, 7, false, 0, b"q".to_vec())).unwrap();
        assert!(!ch.is_ready());
        assert_eq!(ch.send_ans(7, b"a0").unwrap(), 0);
        assert_eq!(ch.send_ans(7, b"a1").unwrap(), 1);
        ch.send_nul(7).unwrap();
        assert!(ch.is_ready());

        let frames = data_frames(read_items(&mut peer, 3));
        assert_eq!(frames[0].kind(), FrameKind::Ans { ansno: 0 });
        assert_eq!(frames[1].kind(), FrameKind::Ans { ansno: 1 });
        assert_eq!(frames[2].kind(), FrameKind::Nul);
        assert_eq!(frames[2].size(), 0);
        ctx.exit().unwrap();
    }

    #[test]
    fn test_fragments_joined_and_mime_parsed() {
        let ctx = test_context();
        let (conn, _peer) = raw_pair(&ctx, Role::Listener);
        ctx.profiles().register("urn:m", None, None, None).unwrap();
        ctx.profiles().set_automatic_mime("urn:m", Some(true)).unwrap();
        let ch = Channel::new_local(&conn, 2, "urn:m");
        let a = Frame::new(FrameKind::Msg, 2, 0, true, 0, b"Content-Type: text/plain\r\n\r\nhel".to_vec());
        let size_a = a.size();
        let b = Frame::new(FrameKind::Msg, 2, 0, false, size_a, b"lo".to_vec());
        assert!(ch.receive(&conn, a).unwrap().is_none());
        let joined = ch.receive(&conn, b).unwrap().unwrap();
        assert_eq!(joined.content(), b"hello");
        assert_eq!(joined.content_type(), "text/plain");
        ctx.exit().unwrap();
    }

    #[test]
    fn test_mime_parsed_with_automatic_mime_off() {
        let ctx = test_context();
        let (conn, _peer) = raw_pair(&ctx, Role::Listener);
        let ch = Channel::new_local(&conn, 2, "urn:plain");
        let f = Frame::new(FrameKind::Msg, 2, 0, false, 0, b"Content-Type: text/plain\r\n\r\nhello".to_vec());
        let delivered = ch.receive(&conn, f).unwrap().unwrap();
        assert_eq!(delivered.content(), b"hello");
        assert_eq!(delivered.content_type(), "text/plain");

        // No header block: the whole payload is content
        let f = Frame::new(FrameKind::Msg, 2, 1, false, delivered.size(), b"plain".to_vec());
        let delivered = ch.receive(&conn, f).unwrap().unwrap();
        assert_eq!(delivered.content(), b"plain");
        ctx.exit().unwrap();
    }

    #[test]
    fn test_receive_rejects_unexpected_reply() {
        let ctx = test_context();
        let (conn, _peer) = raw_pair(&ctx, Role::Initiator);
        let ch = Channel::new_local(&conn, 1, "urn:t");
        let f = Frame::new(FrameKind::Rpy, 1, 3, false, 0, b"x".to_vec());
        let err = ch.receive(&conn, f).unwrap_err();
        assert_eq!(err, Violation::UnexpectedReply { expected: 0, got: 3 });
        assert_eq!(ch.next_expected_seq_no(), 0);
        ctx.exit().unwrap();
    }

    #[test]
    fn test_serialized_deliveries_run_in_ticket_order() {
        let ctx = test_context();
        let (conn, _peer) = raw_pair(&ctx, Role::Listener);
        let ch = Channel::new_local(&conn, 2, "urn:t");
        ch.set_serialize(true);
        let seen = beep_core::BlockingQueue::new();
        let mk = |msgno: u32| {
            let seen = seen.clone();
            Delivery {
                connection: conn.clone(),
                channel: ch.clone(),
                frame: Frame::new(FrameKind::Msg, 2, msgno, false, 0, Vec::new()),
                target: crate::worker::DeliveryTarget::Handler(Arc::new(move |_: &Channel, _: &Connection, f: Frame| {
                    seen.push(f.msgno())
                })),
                ticket: ch.next_ticket(),
            }
        };
        let (d0, d1, d2) = (mk(0), mk(1), mk(2));
        d2.run();
        d1.run();
        assert_eq!(seen.items(), 0);
        d0.run();
        assert_eq!(
            (0..3).map(|_| seen.try_pop().unwrap()).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        ctx.exit().unwrap();
    }

    #[test]
    fn test_skipped_ticket_does_not_stall_order() {
        let ctx = test_context();
        let (conn, _peer) = raw_pair(&ctx, Role::Listener);
        let ch = Channel::new_local(&conn, 2, "urn:t");
        ch.set_serialize(true);
        let seen = beep_core::BlockingQueue::new();
        let mk = |msgno: u32, ticket: Option<u64>| {
            let seen = seen.clone();
            Delivery {
                connection: conn.clone(),
                channel: ch.clone(),
                frame: Frame::new(FrameKind::Msg, 2, msgno, false, 0, Vec::new()),
                target: crate::worker::DeliveryTarget::Handler(Arc::new(move |_: &Channel, _: &Connection, f: Frame| {
                    seen.push(f.msgno())
                })),
                ticket,
            }
        };
        let (t0, t1, t2, t3) = (ch.next_ticket(), ch.next_ticket(), ch.next_ticket(), ch.next_ticket());

        // A skipped ticket in the middle
        mk(2, t2).run();
        ch.skip_ticket(t1);
        mk(0, t0).run();
        assert_eq!(seen.timed_pop(Duration::from_secs(2)), Some(0));
        assert_eq!(seen.timed_pop(Duration::from_secs(2)), Some(2));

        // A skipped ticket that is the current turn hands its successor
        // to the worker pool
        mk(4, ch.next_ticket()).run();
        ch.skip_ticket(t3);
        assert_eq!(seen.timed_pop(Duration::from_secs(2)), Some(4));
        ctx.exit().unwrap();
    }

    #[test]
    fn test_close_without_session_removes_channel() {
        let ctx = test_context();
        let (conn, peer) = raw_pair(&ctx, Role::Initiator);
        let ch = Channel::new_local(&conn, 1, "urn:t");
        drop(peer);
        conn.shutdown();
        ch.close().unwrap();
        assert!(!ch.is_opened());
        assert!(!conn.channel_exists(1));
        ctx.exit().unwrap();
    }
}
