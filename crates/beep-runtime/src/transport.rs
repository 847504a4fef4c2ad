//! Byte transports under a connection.
//!
//! The reader and writers only ever see `dyn Transport`, which is also the
//! swap point for tunnelling layers: `Connection::replace_transport`
//! installs a new one and re-runs the greeting exchange.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use crate::io::timeout_ms;

/// A connected, full-duplex byte stream.
///
/// Methods take `&self`: the reader thread receives while application
/// and worker threads send.
pub trait Transport: Send + Sync {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Descriptor handed to the multiplexing backend
    fn raw_fd(&self) -> RawFd;

    fn set_nonblocking(&self, on: bool) -> io::Result<()>;

    /// Shut both directions down. Repeated calls are harmless.
    fn shutdown(&self) -> io::Result<()>;

    /// Remote host and port, when meaningful
    fn peer(&self) -> Option<(String, u16)> {
        None
    }
}

impl Transport for TcpStream {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn raw_fd(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn set_nonblocking(&self, on: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, on)
    }

    fn shutdown(&self) -> io::Result<()> {
        match TcpStream::shutdown(self, Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn peer(&self) -> Option<(String, u16)> {
        self.peer_addr().ok().map(|a| (a.ip().to_string(), a.port()))
    }
}

impl Transport for UnixStream {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn raw_fd(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn set_nonblocking(&self, on: bool) -> io::Result<()> {
        UnixStream::set_nonblocking(self, on)
    }

    fn shutdown(&self) -> io::Result<()> {
        match UnixStream::shutdown(self, Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// Write all of `buf`, waiting for writability on `WouldBlock` until
/// `timeout` has elapsed in total.
pub(crate) fn send_all(transport: &dyn Transport, mut buf: &[u8], timeout: Duration) -> io::Result<()> {
    let deadline = Instant::now() + timeout;
    while !buf.is_empty() {
        match transport.send(buf) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "peer stopped accepting data")),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "socket not writable"));
                }
                wait_writable(transport.raw_fd(), deadline - now)?;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn wait_writable(fd: RawFd, timeout: Duration) -> io::Result<()> {
    let mut pfd = libc::pollfd { fd, events: libc::POLLOUT, revents: 0 };
    let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms(timeout)) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(());
        }
        return Err(err);
    }
    if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        return Err(io::Error::new(io::ErrorKind::BrokenPipe, "socket error while waiting to write"));
    }
    Ok(())
}
