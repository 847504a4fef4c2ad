//! Channel pools
//!
//! Opening and closing a BEEP channel costs a round trip each, so a pool
//! keeps channels of one profile open and hands them out one caller at a
//! time. A handed-out channel is *busy* until `release_channel`; nothing
//! reclaims a channel its caller never releases.
//!
//! Pool member lists live in the connection's tables. Every mutation holds
//! the connection's pool mutex, also across the start/close round trips,
//! so pools sharing a connection never interleave channel creation.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use beep_core::{BeepError, Result};

use crate::channel::{Channel, ChannelOptions, PoolMembership};
use crate::connection::{ConnInner, Connection};
use crate::profiles::{CloseHandler, FrameReceivedHandler};
use crate::worker::Completion;

/// Opaque user data handed to a custom channel constructor.
pub type PoolData = Arc<dyn Any + Send + Sync>;

/// Custom channel constructor: `(connection, profile, data)`. Must return
/// an opened channel on `connection`, or `None`.
pub type CreateChannelFn = Arc<dyn Fn(&Connection, &str, Option<&PoolData>) -> Option<Channel> + Send + Sync>;

/// How a pool builds and equips its channels.
#[derive(Clone, Default)]
pub struct PoolOptions {
    /// Replaces the default start request
    pub create_channel: Option<CreateChannelFn>,
    /// Installed on every channel the pool creates
    pub close: Option<CloseHandler>,
    pub received: Option<FrameReceivedHandler>,
    /// Passed to `create_channel` when a call supplies none
    pub data: Option<PoolData>,
}

pub(crate) struct PoolInner {
    id: u32,
    profile: String,
    connection: Weak<ConnInner>,
    options: PoolOptions,
    closed: AtomicBool,
}

/// Entry in the connection's pool table.
pub(crate) struct PoolSlot {
    pub(crate) inner: Arc<PoolInner>,
    pub(crate) channels: Vec<Channel>,
}

/// Handle on a pool of channels.
#[derive(Clone)]
pub struct ChannelPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelPool")
            .field("id", &self.inner.id)
            .field("profile", &self.inner.profile)
            .field("channels", &self.get_num())
            .finish()
    }
}

/// Open, not closing, no reply pending either way, not checked out.
fn is_pool_ready(ch: &Channel) -> bool {
    ch.is_opened() && !ch.is_being_closed() && ch.is_ready() && !ch.is_busy()
}

impl ChannelPool {
    pub fn new(conn: &Connection, profile: &str, init: usize) -> Result<ChannelPool> {
        Self::new_full(conn, profile, init, PoolOptions::default())
    }

    /// Create a pool and open `init` channels in it. Fewer channels than
    /// requested is not an error.
    pub fn new_full(conn: &Connection, profile: &str, init: usize, options: PoolOptions) -> Result<ChannelPool> {
        if !conn.is_ok() {
            return Err(BeepError::NotConnected);
        }
        if profile.is_empty() {
            return Err(BeepError::InvalidArgument("profile uri is empty".into()));
        }
        let pool = ChannelPool {
            inner: Arc::new(PoolInner {
                id: conn.allocate_pool_id(),
                profile: profile.to_string(),
                connection: conn.downgrade(),
                options,
                closed: AtomicBool::new(false),
            }),
        };

        let _guard = conn.pool_lock();
        conn.tables()
            .pools
            .insert(pool.inner.id, PoolSlot { inner: Arc::clone(&pool.inner), channels: Vec::new() });
        pool.add_channels(conn, init, None);
        debug!(conn = conn.id(), pool = pool.inner.id, profile, channels = pool.get_num(), "channel pool created");
        Ok(pool)
    }

    /// `new_full` on a worker thread.
    pub fn new_async(
        conn: &Connection,
        profile: &str,
        init: usize,
        options: PoolOptions,
    ) -> Result<Completion<Result<ChannelPool>>> {
        let conn2 = conn.clone();
        let profile = profile.to_string();
        conn.context()
            .workers()
            .spawn_with(move || ChannelPool::new_full(&conn2, &profile, init, options))
    }

    fn connection_checked(&self) -> Option<Connection> {
        if self.inner.closed.load(Ordering::Acquire) {
            return None;
        }
        Connection::upgrade(&self.inner.connection).filter(|c| c.is_ok())
    }

    fn members(&self, conn: &Connection) -> Vec<Channel> {
        conn.tables()
            .pools
            .get(&self.inner.id)
            .map(|s| s.channels.clone())
            .unwrap_or_default()
    }

    fn create_one(&self, conn: &Connection, data: Option<&PoolData>) -> Option<Channel> {
        let opts = &self.inner.options;
        let channel = match &opts.create_channel {
            Some(create) => {
                let data = data.or(opts.data.as_ref());
                match catch_unwind(AssertUnwindSafe(|| create(conn, &self.inner.profile, data))) {
                    Ok(Some(ch)) => {
                        if opts.received.is_some() && ch.received_handler().is_none() {
                            ch.set_received_handler(opts.received.clone());
                        }
                        if opts.close.is_some() && ch.close_handler().is_none() {
                            ch.set_close_handler(opts.close.clone());
                        }
                        Some(ch)
                    }
                    Ok(None) => None,
                    Err(_) => {
                        warn!(conn = conn.id(), pool = self.inner.id, "channel constructor panicked");
                        None
                    }
                }
            }
            None => {
                let options = ChannelOptions {
                    received: opts.received.clone(),
                    close: opts.close.clone(),
                    ..Default::default()
                };
                match Channel::open_with(conn, &self.inner.profile, options) {
                    Ok(ch) => Some(ch),
                    Err(e) => {
                        debug!(conn = conn.id(), pool = self.inner.id, error = %e, "pool channel not opened");
                        None
                    }
                }
            }
        }?;
        if !channel.belongs_to(conn) {
            warn!(pool = self.inner.id, channel = channel.number(), "constructed channel is on another connection");
            return None;
        }
        Some(channel)
    }

    /// Open up to `count` channels into the pool. Caller holds the pool
    /// mutex. Returns the last channel added.
    fn add_channels(&self, conn: &Connection, count: usize, data: Option<&PoolData>) -> Option<Channel> {
        let mut last = None;
        for created in 0..count {
            let channel = match self.create_one(conn, data) {
                Some(ch) => ch,
                None => {
                    warn!(
                        conn = conn.id(),
                        pool = self.inner.id,
                        requested = count,
                        created,
                        "unable to create a pool channel, the pool will have fewer channels than requested"
                    );
                    break;
                }
            };
            channel.set_membership(Some(PoolMembership { pool_id: self.inner.id, busy: false }));
            let mut t = conn.tables();
            match t.pools.get_mut(&self.inner.id) {
                Some(slot) => slot.channels.push(channel.clone()),
                None => {
                    channel.set_membership(None);
                    break;
                }
            }
            last = Some(channel);
        }
        last
    }

    pub fn add(&self, count: usize) {
        self.add_full(count, None);
    }

    /// Grow the pool by `count`; `data` reaches the custom constructor.
    pub fn add_full(&self, count: usize, data: Option<PoolData>) {
        let conn = match self.connection_checked() {
            Some(c) => c,
            None => return,
        };
        let _guard = conn.pool_lock();
        self.add_channels(&conn, count, data.as_ref());
    }

    /// Unlink and close up to `count` ready channels. Caller holds the
    /// pool mutex.
    fn remove_ready(&self, conn: &Connection, count: usize) -> usize {
        let victims: Vec<Channel> = self.members(conn).into_iter().filter(is_pool_ready).take(count).collect();
        let mut removed = 0;
        for ch in &victims {
            // A channel the peer refuses to close stays in the pool
            if let Err(e) = ch.close() {
                warn!(conn = conn.id(), pool = self.inner.id, channel = ch.number(), error = %e, "pool channel close failed, channel kept");
                continue;
            }
            if let Some(slot) = conn.tables().pools.get_mut(&self.inner.id) {
                slot.channels.retain(|c| c != ch);
            }
            ch.set_membership(None);
            removed += 1;
        }
        removed
    }

    /// Close up to `count` ready channels. Busy channels are skipped, so
    /// fewer may close. Returns how many were removed.
    pub fn remove(&self, count: usize) -> usize {
        let conn = match self.connection_checked() {
            Some(c) => c,
            None => return 0,
        };
        let _guard = conn.pool_lock();
        self.remove_ready(&conn, count)
    }

    /// Add a channel opened elsewhere on the same connection.
    pub fn attach(&self, channel: &Channel) -> Result<()> {
        let conn = self.connection_checked().ok_or(BeepError::NotConnected)?;
        if !channel.belongs_to(&conn) {
            return Err(BeepError::InvalidArgument(
                "channels from different connections cannot be pooled together".into(),
            ));
        }
        let _guard = conn.pool_lock();
        if channel.pool_id().is_some() {
            return Err(BeepError::InvalidArgument(format!("channel {} already belongs to a pool", channel.number())));
        }
        let mut t = conn.tables();
        let slot = t.pools.get_mut(&self.inner.id).ok_or(BeepError::NotConnected)?;
        if slot.channels.iter().any(|c| c.number() == channel.number()) {
            return Err(BeepError::InvalidArgument(format!("channel {} already in pool", channel.number())));
        }
        channel.set_membership(Some(PoolMembership { pool_id: self.inner.id, busy: false }));
        slot.channels.push(channel.clone());
        Ok(())
    }

    /// Take a channel out of the pool without closing it.
    pub fn deattach(&self, channel: &Channel) -> Result<()> {
        let conn = self.connection_checked().ok_or(BeepError::NotConnected)?;
        if !channel.belongs_to(&conn) {
            return Err(BeepError::InvalidArgument("channel is on another connection".into()));
        }
        let _guard = conn.pool_lock();
        let mut t = conn.tables();
        let slot = t.pools.get_mut(&self.inner.id).ok_or(BeepError::NotConnected)?;
        let idx = slot
            .channels
            .iter()
            .position(|c| c.number() == channel.number())
            .ok_or(BeepError::ChannelNotFound(channel.number()))?;
        slot.channels.remove(idx);
        channel.set_membership(None);
        Ok(())
    }

    pub fn get_next_ready(&self, auto_inc: bool) -> Option<Channel> {
        self.get_next_ready_full(auto_inc, None)
    }

    /// First ready channel, marked busy. On a miss with `auto_inc`, one
    /// more channel is opened and returned.
    pub fn get_next_ready_full(&self, auto_inc: bool, data: Option<PoolData>) -> Option<Channel> {
        let conn = self.connection_checked()?;
        let _guard = conn.pool_lock();
        for ch in self.members(&conn) {
            if is_pool_ready(&ch) && ch.try_mark_busy(self.inner.id) {
                return Some(ch);
            }
        }
        if !auto_inc {
            return None;
        }
        let ch = self.add_channels(&conn, 1, data.as_ref())?;
        ch.try_mark_busy(self.inner.id).then_some(ch)
    }

    /// Make a checked-out channel available again.
    pub fn release_channel(&self, channel: &Channel) -> bool {
        match Connection::upgrade(&self.inner.connection) {
            Some(conn) => {
                let _guard = conn.pool_lock();
                channel.clear_busy(self.inner.id)
            }
            None => false,
        }
    }

    /// Close every ready channel, forget the busy ones and drop the pool
    /// from its connection.
    pub fn close(&self) {
        let conn = match Connection::upgrade(&self.inner.connection) {
            Some(c) => c,
            None => return,
        };
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _guard = conn.pool_lock();
        let mut closed = 0;
        if conn.is_ok() {
            loop {
                let n = self.remove_ready(&conn, usize::MAX);
                if n == 0 {
                    break;
                }
                closed += n;
            }
        }
        let slot = conn.tables().pools.remove(&self.inner.id);
        let leftover = slot.map(|s| s.channels).unwrap_or_default();
        for ch in &leftover {
            ch.set_membership(None);
        }
        debug!(conn = conn.id(), pool = self.inner.id, closed, detached = leftover.len(), "channel pool closed");
    }

    /// Channels in the pool, busy ones included
    pub fn get_num(&self) -> usize {
        match Connection::upgrade(&self.inner.connection) {
            Some(conn) => self.members(&conn).len(),
            None => 0,
        }
    }

    /// Channels `get_next_ready` could hand out right now
    pub fn get_available_num(&self) -> usize {
        match Connection::upgrade(&self.inner.connection) {
            Some(conn) => self.members(&conn).iter().filter(|c| is_pool_ready(c)).count(),
            None => 0,
        }
    }

    pub fn get_id(&self) -> u32 {
        self.inner.id
    }

    pub fn get_connection(&self) -> Option<Connection> {
        Connection::upgrade(&self.inner.connection)
    }

    pub fn profile(&self) -> &str {
        &self.inner.profile
    }
}

impl Connection {
    /// Pool `id` on this connection
    pub fn pool(&self, id: u32) -> Option<ChannelPool> {
        self.tables().pools.get(&id).map(|s| ChannelPool { inner: Arc::clone(&s.inner) })
    }

    pub fn pools_count(&self) -> usize {
        self.tables().pools.len()
    }
}
