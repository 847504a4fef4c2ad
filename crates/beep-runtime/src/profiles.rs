//! Profile registry and first-level dispatch
//!
//! Profiles are registered per context by URI. Invocation never holds the
//! registry lock across user code: a lookup clones the profile's `Arc`
//! (failing if the profile is being unregistered), snapshots the handler
//! set under the profile's own mutex, and calls the snapshot.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use beep_core::constants::{DEFAULT_MIME_TYPE, DEFAULT_TRANSFER_ENCODING};
use beep_core::{BeepError, Frame, LockExt, MimeHeaders, Result, RwLockExt};

use crate::channel::Channel;
use crate::connection::Connection;
use crate::worker::{Delivery, DeliveryTarget, WorkerPool};

/// Accept or refuse a start request for `channel`.
pub type StartHandler = Arc<dyn Fn(u32, &Connection) -> bool + Send + Sync>;

/// Accept or refuse a close request for `channel`.
pub type CloseHandler = Arc<dyn Fn(u32, &Connection) -> bool + Send + Sync>;

/// Frame delivery, at profile or channel level.
pub type FrameReceivedHandler = Arc<dyn Fn(&Channel, &Connection, Frame) + Send + Sync>;

/// Start handler that sees the whole `<start>` request.
pub type StartExtendedHandler = Arc<dyn Fn(&StartRequest<'_>, &Connection) -> StartDecision + Send + Sync>;

/// What the peer asked for in a `<start>` element.
#[derive(Debug, Clone, Copy)]
pub struct StartRequest<'a> {
    pub channel: u32,
    pub profile: &'a str,
    pub server_name: Option<&'a str>,
    /// Piggybacked content
    pub content: Option<&'a str>,
    pub encoding: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartDecision {
    pub accept: bool,
    /// Content piggybacked on the positive reply
    pub piggyback: Option<String>,
}

impl StartDecision {
    pub fn accept() -> Self {
        Self { accept: true, piggyback: None }
    }

    pub fn refuse() -> Self {
        Self { accept: false, piggyback: None }
    }
}

#[derive(Clone, Default)]
struct ProfileHandlers {
    start: Option<StartHandler>,
    start_extended: Option<StartExtendedHandler>,
    close: Option<CloseHandler>,
    received: Option<FrameReceivedHandler>,
    mime_type: Option<String>,
    transfer_encoding: Option<String>,
    automatic_mime: Option<bool>,
}

struct Profile {
    uri: String,
    handlers: Mutex<ProfileHandlers>,
    finalizing: AtomicBool,
}

impl Profile {
    fn snapshot(&self) -> ProfileHandlers {
        self.handlers.locked().clone()
    }
}

/// Per-context set of profiles, kept in registration order.
#[derive(Default)]
pub struct ProfileRegistry {
    profiles: RwLock<Vec<Arc<Profile>>>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference on a live profile.
    fn acquire(&self, uri: &str) -> Option<Arc<Profile>> {
        self.profiles
            .read_locked()
            .iter()
            .find(|p| p.uri == uri && !p.finalizing.load(Ordering::Acquire))
            .cloned()
    }

    fn update<F: FnOnce(&mut ProfileHandlers)>(&self, uri: &str, f: F) -> Result<()> {
        let profile = self.acquire(uri).ok_or_else(|| BeepError::UnknownProfile(uri.to_string()))?;
        f(&mut profile.handlers.locked());
        Ok(())
    }

    /// Create or update a profile. Missing start/close handlers accept
    /// everything.
    pub fn register(
        &self,
        uri: &str,
        start: Option<StartHandler>,
        close: Option<CloseHandler>,
        received: Option<FrameReceivedHandler>,
    ) -> Result<()> {
        if uri.is_empty() {
            return Err(BeepError::InvalidArgument("profile uri is empty".into()));
        }
        let mut profiles = self.profiles.write_locked();
        if let Some(existing) = profiles.iter().find(|p| p.uri == uri && !p.finalizing.load(Ordering::Acquire)) {
            let mut h = existing.handlers.locked();
            h.start = start;
            h.close = close;
            h.received = received;
            debug!(uri, "profile updated");
            return Ok(());
        }
        profiles.push(Arc::new(Profile {
            uri: uri.to_string(),
            handlers: Mutex::new(ProfileHandlers { start, close, received, ..Default::default() }),
            finalizing: AtomicBool::new(false),
        }));
        debug!(uri, "profile registered");
        Ok(())
    }

    /// Install a start handler that sees server name and piggyback. It
    /// wins over the plain start handler.
    pub fn register_extended_start(&self, uri: &str, handler: StartExtendedHandler) -> Result<()> {
        self.update(uri, |h| h.start_extended = Some(handler))
    }

    /// Remove a profile. In-flight deliveries keep their handler snapshot.
    pub fn unregister(&self, uri: &str) -> Result<()> {
        let mut profiles = self.profiles.write_locked();
        let idx = profiles
            .iter()
            .position(|p| p.uri == uri)
            .ok_or_else(|| BeepError::UnknownProfile(uri.to_string()))?;
        let profile = profiles.remove(idx);
        profile.finalizing.store(true, Ordering::Release);
        debug!(uri, "profile unregistered");
        Ok(())
    }

    pub fn set_received_handler(&self, uri: &str, handler: Option<FrameReceivedHandler>) -> Result<()> {
        self.update(uri, |h| h.received = handler)
    }

    pub fn set_start_handler(&self, uri: &str, handler: Option<StartHandler>) -> Result<()> {
        self.update(uri, |h| h.start = handler)
    }

    pub fn set_close_handler(&self, uri: &str, handler: Option<CloseHandler>) -> Result<()> {
        self.update(uri, |h| h.close = handler)
    }

    /// MIME type and transfer encoding used for automatic headers.
    pub fn set_mime_type(&self, uri: &str, mime_type: Option<&str>, transfer_encoding: Option<&str>) -> Result<()> {
        self.update(uri, |h| {
            h.mime_type = mime_type.map(str::to_string);
            h.transfer_encoding = transfer_encoding.map(str::to_string);
        })
    }

    pub fn mime_type(&self, uri: &str) -> Option<String> {
        let profile = self.acquire(uri)?;
        let h = profile.handlers.locked();
        Some(h.mime_type.clone().unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()))
    }

    pub fn transfer_encoding(&self, uri: &str) -> Option<String> {
        let profile = self.acquire(uri)?;
        let h = profile.handlers.locked();
        Some(h.transfer_encoding.clone().unwrap_or_else(|| DEFAULT_TRANSFER_ENCODING.to_string()))
    }

    /// Per-profile override of the context's automatic MIME setting;
    /// `None` follows the context.
    pub fn set_automatic_mime(&self, uri: &str, on: Option<bool>) -> Result<()> {
        self.update(uri, |h| h.automatic_mime = on)
    }

    /// Header block to prefix outgoing payloads with, if automatic MIME
    /// applies to `uri`.
    pub(crate) fn mime_prefix(&self, uri: &str, context_default: bool) -> Option<Vec<u8>> {
        let h = match self.acquire(uri) {
            Some(p) => p.snapshot(),
            None => return context_default.then(|| b"\r\n".to_vec()),
        };
        if !h.automatic_mime.unwrap_or(context_default) {
            return None;
        }
        Some(MimeHeaders::encode_block(
            h.mime_type.as_deref().unwrap_or(DEFAULT_MIME_TYPE),
            h.transfer_encoding.as_deref().unwrap_or(DEFAULT_TRANSFER_ENCODING),
        ))
    }

    pub fn is_registered(&self, uri: &str) -> bool {
        self.acquire(uri).is_some()
    }

    pub fn is_defined_start(&self, uri: &str) -> bool {
        self.acquire(uri)
            .map(|p| {
                let h = p.handlers.locked();
                h.start.is_some() || h.start_extended.is_some()
            })
            .unwrap_or(false)
    }

    pub fn is_defined_close(&self, uri: &str) -> bool {
        self.acquire(uri).map(|p| p.handlers.locked().close.is_some()).unwrap_or(false)
    }

    pub fn is_defined_received(&self, uri: &str) -> bool {
        self.acquire(uri).map(|p| p.handlers.locked().received.is_some()).unwrap_or(false)
    }

    /// Registered URIs in registration order
    pub fn registered(&self) -> Vec<String> {
        self.profiles
            .read_locked()
            .iter()
            .filter(|p| !p.finalizing.load(Ordering::Acquire))
            .map(|p| p.uri.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.read_locked().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Outstanding references to a profile, registry included.
    pub fn ref_count(&self, uri: &str) -> usize {
        match self.acquire(uri) {
            Some(p) => Arc::strong_count(&p) - 1,
            None => 0,
        }
    }

    /// Plain start check. `false` for unknown profiles.
    pub fn invoke_start(&self, uri: &str, channel: u32, conn: &Connection) -> bool {
        let req = StartRequest { channel, profile: uri, server_name: None, content: None, encoding: None };
        self.invoke_start_request(&req, conn).map(|d| d.accept).unwrap_or(false)
    }

    /// Full start negotiation. `None` when the profile is not registered.
    pub fn invoke_start_request(&self, req: &StartRequest<'_>, conn: &Connection) -> Option<StartDecision> {
        let profile = self.acquire(req.profile)?;
        let h = profile.snapshot();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            if let Some(ext) = &h.start_extended {
                ext(req, conn)
            } else if let Some(start) = &h.start {
                StartDecision { accept: start(req.channel, conn), piggyback: None }
            } else {
                StartDecision::accept()
            }
        }));
        match outcome {
            Ok(decision) => Some(decision),
            Err(_) => {
                warn!(uri = req.profile, channel = req.channel, "start handler panicked, refusing");
                Some(StartDecision::refuse())
            }
        }
    }

    /// Close check. `None` when the profile is not registered.
    pub fn invoke_close(&self, uri: &str, channel: u32, conn: &Connection) -> Option<bool> {
        let profile = self.acquire(uri)?;
        let handler = profile.snapshot().close;
        let Some(handler) = handler else {
            return Some(true);
        };
        match catch_unwind(AssertUnwindSafe(|| handler(channel, conn))) {
            Ok(accept) => Some(accept),
            Err(_) => {
                warn!(uri, channel, "close handler panicked, refusing");
                Some(false)
            }
        }
    }

    /// Hand `frame` to the profile's received handler on the worker pool.
    ///
    /// Gives the frame back when nobody takes it: unknown profile, no
    /// handler, or a stopped pool.
    pub fn invoke_frame_received(
        &self,
        uri: &str,
        workers: &WorkerPool,
        channel: &Channel,
        conn: &Connection,
        frame: Frame,
    ) -> std::result::Result<(), Frame> {
        let handler = match self.acquire(uri).and_then(|p| p.snapshot().received) {
            Some(h) => h,
            None => return Err(frame),
        };
        let delivery = Delivery {
            connection: conn.clone(),
            channel: channel.clone(),
            ticket: channel.next_ticket(),
            frame,
            target: DeliveryTarget::Handler(handler),
        };
        workers.deliver(delivery).map_err(|d| {
            d.channel.skip_ticket(d.ticket);
            d.frame
        })
    }
}
