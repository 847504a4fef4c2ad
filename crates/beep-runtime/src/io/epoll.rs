//! `epoll(7)` backend. Dispatches ready targets itself.

use std::os::unix::io::RawFd;
use std::time::Duration;

use beep_core::{BeepError, Result};

use super::{last_errno, timeout_ms, AddOutcome, IoWait, IoWaitType, WaitOutcome, WatchTarget};

/// Events fetched per `epoll_wait`
const MAX_EVENTS: usize = 256;

pub struct EpollWait {
    epfd: RawFd,
    registered: Vec<RawFd>,
    targets: Vec<WatchTarget>,
    events: Vec<libc::epoll_event>,
    ready: usize,
}

impl EpollWait {
    pub fn new() -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(BeepError::SocketCreation(format!("epoll_create1 failed, errno {}", last_errno())));
        }
        Ok(Self {
            epfd,
            registered: Vec::new(),
            targets: Vec::new(),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS],
            ready: 0,
        })
    }
}

impl IoWait for EpollWait {
    fn kind(&self) -> IoWaitType {
        IoWaitType::Epoll
    }

    fn clear(&mut self) {
        for fd in self.registered.drain(..) {
            // Closed descriptors are already gone from the interest list
            unsafe {
                libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
        }
        self.targets.clear();
        self.ready = 0;
    }

    fn add(&mut self, fd: RawFd, target: WatchTarget) -> AddOutcome {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: self.targets.len() as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if ret < 0 {
            return match last_errno() {
                libc::EBADF => AddOutcome::BadDescriptor,
                libc::EEXIST => AddOutcome::Added,
                errno => AddOutcome::Failed(errno),
            };
        }
        self.registered.push(fd);
        self.targets.push(target);
        AddOutcome::Added
    }

    fn wait(&mut self, timeout: Duration) -> WaitOutcome {
        let ret = unsafe {
            libc::epoll_wait(self.epfd, self.events.as_mut_ptr(), MAX_EVENTS as libc::c_int, timeout_ms(timeout))
        };
        if ret < 0 {
            self.ready = 0;
            return match last_errno() {
                libc::EINTR => WaitOutcome::Interrupted,
                libc::EBADF | libc::EINVAL => WaitOutcome::Fatal,
                errno => WaitOutcome::Error(errno),
            };
        }
        self.ready = ret as usize;
        if ret == 0 {
            WaitOutcome::Timeout
        } else {
            WaitOutcome::Ready(self.ready)
        }
    }

    fn is_set(&self, _fd: RawFd) -> bool {
        false
    }

    fn have_dispatch(&self) -> bool {
        true
    }

    fn dispatch(&mut self, f: &mut dyn FnMut(&WatchTarget)) {
        for ev in &self.events[..self.ready] {
            let idx = ev.u64 as usize;
            if let Some(target) = self.targets.get(idx) {
                f(target);
            }
        }
        self.ready = 0;
    }
}

impl Drop for EpollWait {
    fn drop(&mut self) {
        if self.epfd >= 0 {
            unsafe {
                libc::close(self.epfd);
            }
            self.epfd = -1;
        }
    }
}
