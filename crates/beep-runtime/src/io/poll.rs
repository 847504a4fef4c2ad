//! `poll(2)` backend. Scanned by the reader with `is_set`.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{last_errno, timeout_ms, AddOutcome, IoWait, IoWaitType, WaitOutcome, WatchTarget};

pub struct PollWait {
    fds: Vec<libc::pollfd>,
    targets: Vec<WatchTarget>,
    index: HashMap<RawFd, usize>,
}

impl PollWait {
    pub fn new() -> Self {
        Self { fds: Vec::new(), targets: Vec::new(), index: HashMap::new() }
    }
}

impl Default for PollWait {
    fn default() -> Self {
        Self::new()
    }
}

impl IoWait for PollWait {
    fn kind(&self) -> IoWaitType {
        IoWaitType::Poll
    }

    fn clear(&mut self) {
        self.fds.clear();
        self.targets.clear();
        self.index.clear();
    }

    fn add(&mut self, fd: RawFd, target: WatchTarget) -> AddOutcome {
        if fd < 0 {
            return AddOutcome::BadDescriptor;
        }
        if self.index.contains_key(&fd) {
            return AddOutcome::Added;
        }
        self.index.insert(fd, self.fds.len());
        self.fds.push(libc::pollfd { fd, events: libc::POLLIN, revents: 0 });
        self.targets.push(target);
        AddOutcome::Added
    }

    fn wait(&mut self, timeout: Duration) -> WaitOutcome {
        let ret = unsafe {
            libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, timeout_ms(timeout))
        };
        if ret < 0 {
            return match last_errno() {
                libc::EINTR => WaitOutcome::Interrupted,
                libc::EBADF => WaitOutcome::BadDescriptor,
                libc::EFAULT | libc::EINVAL => WaitOutcome::Fatal,
                errno => WaitOutcome::Error(errno),
            };
        }
        if ret == 0 {
            return WaitOutcome::Timeout;
        }
        if self.fds.iter().any(|p| p.revents & libc::POLLNVAL != 0) {
            return WaitOutcome::BadDescriptor;
        }
        WaitOutcome::Ready(ret as usize)
    }

    fn is_set(&self, fd: RawFd) -> bool {
        match self.index.get(&fd) {
            Some(&i) => self.fds[i].revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0,
            None => false,
        }
    }
}
