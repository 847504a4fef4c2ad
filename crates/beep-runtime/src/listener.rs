//! Listening sockets
//!
//! A listener is a `Connection` in the `MasterListener` role watched by the
//! reader. Readiness means pending accepts: each accepted stream becomes a
//! `Listener`-role connection in the initial accept stage, gets our
//! greeting right away and joins the reader's watch list. The peer's
//! greeting completes the accept (`control::second_step_accept`).

use std::io;
use std::net::{TcpListener, ToSocketAddrs};
use std::sync::Arc;

use tracing::{debug, info, warn};

use beep_core::{BeepError, Result};

use crate::connection::{Connection, Role};
use crate::context::Context;

/// Receives the outcome of an asynchronous `Listener::new_full`.
pub type ListenerReadyHandler = Box<dyn FnOnce(Result<Connection>) + Send>;

/// Constructors for listening connections.
pub struct Listener;

impl Listener {
    /// Bind `host:port` and start accepting. Port 0 picks a free port;
    /// `Connection::local_addr` tells which.
    pub fn new(ctx: &Context, host: &str, port: u16) -> Result<Connection> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| BeepError::Bind(format!("cannot resolve {}:{}: {}", host, port, e)))?
            .next()
            .ok_or_else(|| BeepError::Bind(format!("no address for {}:{}", host, port)))?;
        let socket = TcpListener::bind(addr).map_err(|e| BeepError::Bind(format!("{}: {}", addr, e)))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| BeepError::SocketCreation(e.to_string()))?;
        let bound = socket.local_addr().map(|a| a.port()).unwrap_or(port);

        let conn = Connection::new_master_listener(ctx, socket, host.to_string(), bound);
        ctx.reader().watch_listener(conn.clone())?;
        info!(conn = conn.id(), host, port = bound, "listener ready");
        Ok(conn)
    }

    /// Like `new`, but binds on a worker thread and reports through
    /// `on_ready`.
    pub fn new_full(ctx: &Context, host: &str, port: u16, on_ready: ListenerReadyHandler) -> Result<()> {
        let job_ctx = ctx.clone();
        let host = host.to_string();
        ctx.workers().spawn(move || {
            let result = Listener::new(&job_ctx, &host, port);
            if let Err(e) = &result {
                warn!(host = %host, port, error = %e, "listener failed");
            }
            on_ready(result);
        })
    }
}

/// Accept everything pending on `master`. Runs on the reader thread.
pub(crate) fn accept_pending(ctx: &Context, master: &Connection) -> Vec<Connection> {
    let mut accepted = Vec::new();
    loop {
        let (stream, peer) = match master.accept() {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(conn = master.id(), error = %e, "accept failed");
                break;
            }
        };
        if let Err(e) = stream.set_nonblocking(true).and_then(|_| stream.set_nodelay(true)) {
            warn!(peer = %peer, error = %e, "cannot configure accepted socket");
            continue;
        }
        let conn = Connection::from_stream(ctx, Arc::new(stream), Role::Listener, true);
        if let Err(e) = conn.send_greeting() {
            warn!(conn = conn.id(), peer = %peer, error = %e, "cannot greet accepted peer");
            conn.shutdown();
            continue;
        }
        debug!(conn = conn.id(), listener = master.id(), peer = %peer, "connection accepted");
        accepted.push(conn);
    }
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::test_context;
    use beep_core::{BlockingQueue, FrameDecoder, FrameKind, Incoming};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    #[test]
    fn test_bind_failure_is_reported() {
        let ctx = test_context();
        let first = Listener::new(&ctx, "127.0.0.1", 0).unwrap();
        let port = first.local_addr().unwrap().port();
        let err = Listener::new(&ctx, "127.0.0.1", port).unwrap_err();
        assert!(matches!(err, BeepError::Bind(_)));
        ctx.exit().unwrap();
    }

    #[test]
    fn test_new_full_reports_through_callback() {
        let ctx = test_context();
        let ready = BlockingQueue::new();
        let sink = ready.clone();
        Listener::new_full(&ctx, "127.0.0.1", 0, Box::new(move |r| sink.push(r.map(|c| c.port())))).unwrap();
        let port = ready.timed_pop(Duration::from_secs(2)).unwrap().unwrap();
        assert!(port > 0);
        ctx.exit().unwrap();
    }

    #[test]
    fn test_accepted_peer_gets_greeting() {
        let ctx = test_context();
        ctx.profiles().register("urn:test:one", None, None, None).unwrap();
        let listener = Listener::new(&ctx, "127.0.0.1", 0).unwrap();
        assert_eq!(listener.role(), Role::MasterListener);

        let mut peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut dec = FrameDecoder::new();
        let mut buf = [0u8; 1024];
        let greeting = loop {
            if let Some(Incoming::Frame(f)) = dec.decode().unwrap() {
                break f;
            }
            let n = peer.read(&mut buf).unwrap();
            assert!(n > 0);
            dec.feed(&buf[..n]);
        };
        assert_eq!((greeting.kind(), greeting.channel(), greeting.msgno()), (FrameKind::Rpy, 0, 0));
        assert!(greeting.content_str().contains("urn:test:one"));

        // Garbage instead of a greeting is a protocol error
        peer.write_all(b"HELLO\r\n").unwrap();
        let mut rest = Vec::new();
        let _ = peer.read_to_end(&mut rest);
        ctx.exit().unwrap();
    }
}
