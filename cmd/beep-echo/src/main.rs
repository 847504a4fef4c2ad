//! BEEP Echo Demo
//!
//! Starts a listener with an echo profile, connects a client to it over
//! loopback, opens a few channels (plain and pooled) and bounces messages
//! off the server, one of them larger than the flow-control window.
//!
//! Usage:
//!     cargo build --release -p beep-echo
//!     ./target/release/beep-echo [port] [messages]
//!
//! Environment:
//!     RUST_LOG=debug          tracing verbosity
//!     BEEP_IO_BACKEND=poll    reader backend (poll | epoll)
//!     BEEP_WORKER_THREADS=N   worker pool size

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use beep::prelude::*;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ECHO_PROFILE: &str = "http://beep.example.org/profiles/echo";

const DEFAULT_PORT: u16 = 44017;
const DEFAULT_MESSAGES: usize = 100;

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(DEFAULT_PORT);
    let messages: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(DEFAULT_MESSAGES);

    if let Err(e) = run(port, messages) {
        error!(error = %e, "echo demo failed");
        std::process::exit(1);
    }
}

fn run(port: u16, messages: usize) -> beep::Result<()> {
    let config = ContextConfig::from_env();
    config.print();

    // ── Server side ──
    let server = Context::new(config.clone())?;
    let echoed = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&echoed);
    server.profiles().register(
        ECHO_PROFILE,
        None,
        None,
        Some(Arc::new(move |ch: &Channel, _conn: &Connection, frame: Frame| {
            counter.fetch_add(frame.content().len() as u64, Ordering::Relaxed);
            if let Err(e) = ch.send_rpy(frame.msgno(), frame.content()) {
                error!(channel = ch.number(), error = %e, "echo reply failed");
            }
        })),
    )?;
    let listener = Listener::new(&server, "127.0.0.1", port)?;
    info!(port = listener.port(), "echo server listening");

    // ── Client side ──
    let client = Context::new(config)?;
    let conn = Connection::connect(&client, "127.0.0.1", listener.port())?;
    info!(remote_profiles = ?conn.remote_profiles(), "connected");

    let timeout = client.config().reply_timeout;
    let ch = Channel::open(&conn, ECHO_PROFILE)?;
    let start = Instant::now();
    for i in 0..messages {
        let payload = format!("ping {}", i);
        let reply = ch.send_msg_and_wait(payload.as_bytes(), timeout)?;
        if reply.content() != payload.as_bytes() {
            return Err(BeepError::Protocol(format!("echo mismatch on message {}", i)));
        }
    }
    let elapsed = start.elapsed();
    info!(
        messages,
        elapsed_ms = elapsed.as_millis() as u64,
        per_msg_us = (elapsed.as_micros() as u64) / (messages.max(1) as u64),
        "round trips done"
    );

    // Bigger than one window: travels as several frames and SEQ updates
    let big = vec![b'x'; 64 * 1024];
    let reply = ch.send_msg_and_wait(&big, timeout)?;
    info!(sent = big.len(), received = reply.content().len(), "large message echoed");

    // ── Pooled channels ──
    let pool = ChannelPool::new(&conn, ECHO_PROFILE, 3)?;
    info!(pool = pool.get_id(), channels = pool.get_num(), "pool ready");
    for i in 0..6 {
        let pooled = match pool.get_next_ready(true) {
            Some(c) => c,
            None => return Err(BeepError::Connection("no pooled channel available".into())),
        };
        pooled.send_msg_and_wait(format!("pooled {}", i).as_bytes(), timeout)?;
        pool.release_channel(&pooled);
    }
    pool.close();

    ch.close()?;
    conn.close()?;
    info!(bytes = echoed.load(Ordering::Relaxed), "server echoed");

    std::thread::sleep(Duration::from_millis(50));
    client.exit()?;
    server.exit()?;
    Ok(())
}
