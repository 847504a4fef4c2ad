//! I/O multiplexing abstraction
//!
//! The reader loop rebuilds a descriptor set every pass, waits on it, and
//! then either lets the backend dispatch ready descriptors itself or scans
//! listeners and connections with `is_set`. Backends are swappable at
//! runtime (`Reader::notify_change_io_backend`).
//!
//! | Backend | `is_set` | `dispatch` |
//! |---------|----------|------------|
//! | poll    | yes      | no         |
//! | epoll   | no       | yes        |

use std::fmt;
use std::os::unix::io::RawFd;
use std::str::FromStr;
use std::time::Duration;

use beep_core::Result;

use crate::connection::Connection;

pub mod notifier;
mod poll;
pub use poll::PollWait;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod epoll;
        pub use epoll::EpollWait;
    }
}

/// Available multiplexing backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoWaitType {
    Poll,
    Epoll,
}

impl Default for IoWaitType {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            IoWaitType::Epoll
        } else {
            IoWaitType::Poll
        }
    }
}

impl fmt::Display for IoWaitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IoWaitType::Poll => "poll",
            IoWaitType::Epoll => "epoll",
        })
    }
}

impl FromStr for IoWaitType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "poll" => Ok(IoWaitType::Poll),
            "epoll" => Ok(IoWaitType::Epoll),
            other => Err(format!("unknown io backend '{}'", other)),
        }
    }
}

/// What a registered descriptor stands for.
#[derive(Clone)]
pub enum WatchTarget {
    /// The reader's own wake-up descriptor
    Wakeup,
    /// A `MasterListener` socket: readiness means accept
    Listener(Connection),
    /// A peer connection: readiness means frames
    Connection(Connection),
}

/// Result of registering a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// The descriptor is closed or invalid; triggers the cleanup sweep
    BadDescriptor,
    /// Backend capacity reached or other failure
    Failed(i32),
}

/// Result of one multiplexing wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Number of ready descriptors
    Ready(usize),
    Timeout,
    /// Signal interrupted the wait; treated like a timeout
    Interrupted,
    /// A watched descriptor went bad
    BadDescriptor,
    Error(i32),
    /// The backend itself is unusable; the reader stops
    Fatal,
}

/// One multiplexing backend instance.
///
/// Owned by the reader thread, so methods take `&mut self` and the trait
/// only requires `Send`. Dropping the value releases kernel resources.
pub trait IoWait: Send {
    fn kind(&self) -> IoWaitType;

    /// Forget every registered descriptor.
    fn clear(&mut self);

    /// Register `fd` for readability.
    fn add(&mut self, fd: RawFd, target: WatchTarget) -> AddOutcome;

    /// Block until something is readable or `timeout` passes.
    fn wait(&mut self, timeout: Duration) -> WaitOutcome;

    /// Readiness of `fd` after the last `wait`. Only meaningful when
    /// `have_dispatch` is false.
    fn is_set(&self, fd: RawFd) -> bool;

    /// Whether `dispatch` should be used instead of scanning with `is_set`.
    fn have_dispatch(&self) -> bool {
        false
    }

    /// Call `f` for every ready target of the last `wait`.
    fn dispatch(&mut self, _f: &mut dyn FnMut(&WatchTarget)) {}
}

/// Create a backend of the requested kind.
pub fn new_io_wait(kind: IoWaitType) -> Result<Box<dyn IoWait>> {
    match kind {
        IoWaitType::Poll => Ok(Box::new(PollWait::new())),
        #[cfg(target_os = "linux")]
        IoWaitType::Epoll => Ok(Box::new(EpollWait::new()?)),
        #[cfg(not(target_os = "linux"))]
        IoWaitType::Epoll => {
            tracing::warn!("epoll not available on this platform, using poll");
            Ok(Box::new(PollWait::new()))
        }
    }
}

/// Timeout in whole milliseconds for `poll`/`epoll_wait`, rounded up.
pub(crate) fn timeout_ms(timeout: Duration) -> libc::c_int {
    let ms = timeout.as_millis() + u128::from(timeout.subsec_nanos() % 1_000_000 != 0);
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}

pub(crate) fn last_errno() -> i32 {
    nix::errno::Errno::last() as i32
}
