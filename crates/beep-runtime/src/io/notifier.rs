//! Reader wake-up descriptor.
//!
//! Command pushers call `notify()` so a reader blocked in the
//! multiplexing wait picks up new commands immediately instead of at
//! the next timeout. Multiple notifications before a `drain()` coalesce
//! into one wake-up.

use std::os::unix::io::RawFd;

use beep_core::{BeepError, Result};

use super::last_errno;

pub struct Notifier {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Notifier {
    #[cfg(target_os = "linux")]
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(BeepError::SocketCreation(format!("eventfd failed, errno {}", last_errno())));
        }
        Ok(Self { read_fd: fd, write_fd: fd })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn create() -> Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(BeepError::SocketCreation(format!("pipe failed, errno {}", last_errno())));
        }
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        Ok(Self { read_fd: fds[0], write_fd: fds[1] })
    }

    /// Descriptor to register with the multiplexing backend
    pub fn fd(&self) -> RawFd {
        self.read_fd
    }

    pub fn notify(&self) {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.write_fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // EAGAIN: counter (or pipe) already full, a wake-up is pending anyway
        if ret < 0 && last_errno() != libc::EAGAIN {
            tracing::warn!(errno = last_errno(), "reader wake-up write failed");
        }
    }

    /// Consume pending notifications.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 || (n as usize) < buf.len() {
                break;
            }
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            if self.write_fd != self.read_fd {
                libc::close(self.write_fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{new_io_wait, IoWaitType, WaitOutcome, WatchTarget};
    use std::time::Duration;

    #[test]
    fn test_notify_wakes_wait_and_drain_resets() {
        let n = Notifier::create().unwrap();
        let mut backend = new_io_wait(IoWaitType::Poll).unwrap();
        n.notify();
        n.notify();
        backend.add(n.fd(), WatchTarget::Wakeup);
        assert_eq!(backend.wait(Duration::from_secs(1)), WaitOutcome::Ready(1));
        n.drain();
        backend.clear();
        backend.add(n.fd(), WatchTarget::Wakeup);
        assert_eq!(backend.wait(Duration::from_millis(20)), WaitOutcome::Timeout);
    }
}
