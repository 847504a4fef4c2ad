//! Two contexts talking BEEP over loopback TCP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use beep_core::{BeepError, BlockingQueue, Frame, FrameKind, Status};
use beep_runtime::{
    Channel, ChannelOptions, ChannelPool, Connection, Context, ContextConfig, Listener, Role, StartDecision,
    StartRequest,
};

const ECHO: &str = "urn:test:echo";
const REFUSED: &str = "urn:test:refused";

fn context() -> Context {
    Context::new(
        ContextConfig::new()
            .worker_threads(3)
            .wait_timeout(Duration::from_millis(50))
            .stop_timeout(Duration::from_secs(5))
            .connect_timeout(Duration::from_secs(5))
            .reply_timeout(Duration::from_secs(5)),
    )
    .unwrap()
}

/// Server context with an echo profile and a profile that refuses starts.
fn echo_server() -> (Context, Connection) {
    let server = context();
    server
        .profiles()
        .register(
            ECHO,
            None,
            None,
            Some(Arc::new(|ch: &Channel, _: &Connection, frame: Frame| {
                if frame.kind() == FrameKind::Msg {
                    ch.send_rpy(frame.msgno(), frame.content()).unwrap();
                }
            })),
        )
        .unwrap();
    server
        .profiles()
        .register(REFUSED, Some(Arc::new(|_: u32, _: &Connection| false)), None, None)
        .unwrap();
    let listener = Listener::new(&server, "127.0.0.1", 0).unwrap();
    (server, listener)
}

fn connect(client: &Context, listener: &Connection) -> Connection {
    Connection::connect(client, "127.0.0.1", listener.port()).unwrap()
}

#[test]
fn test_greeting_lists_profiles() {
    let (server, listener) = echo_server();
    let client = context();
    let conn = connect(&client, &listener);

    assert!(conn.is_ok());
    assert_eq!(conn.role(), Role::Initiator);
    assert!(conn.is_profile_supported(ECHO));
    assert!(conn.is_profile_supported(REFUSED));
    assert!(!conn.is_initial_accept());

    client.exit().unwrap();
    server.exit().unwrap();
}

#[test]
fn test_msg_rpy_round_trip() {
    let (server, listener) = echo_server();
    let client = context();
    let conn = connect(&client, &listener);

    let ch = Channel::open(&conn, ECHO).unwrap();
    assert_eq!(ch.number(), 1);
    assert!(ch.is_opened());
    for i in 0..20 {
        let body = format!("message {}", i);
        let reply = ch.send_msg_and_wait(body.as_bytes(), Duration::from_secs(5)).unwrap();
        assert_eq!(reply.kind(), FrameKind::Rpy);
        assert_eq!(reply.msgno(), i);
        assert_eq!(reply.content(), body.as_bytes());
    }
    assert!(ch.is_ready());

    client.exit().unwrap();
    server.exit().unwrap();
}

#[test]
fn test_message_larger_than_window() {
    let (server, listener) = echo_server();
    let client = context();
    let conn = connect(&client, &listener);
    let ch = Channel::open(&conn, ECHO).unwrap();

    let big: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let reply = ch.send_msg_and_wait(&big, Duration::from_secs(5)).unwrap();
    assert_eq!(reply.content(), big.as_slice());
    assert!(!reply.more());

    client.exit().unwrap();
    server.exit().unwrap();
}

#[test]
fn test_refused_start_and_unknown_profile() {
    let (server, listener) = echo_server();
    let client = context();
    let conn = connect(&client, &listener);

    match Channel::open(&conn, REFUSED) {
        Err(BeepError::ChannelRefused { code, .. }) => assert_eq!(code, 550),
        other => panic!("expected refusal, got {:?}", other.map(|c| c.number())),
    }
    assert!(!conn.channel_exists(1));
    assert!(matches!(Channel::open(&conn, "urn:test:nobody"), Err(BeepError::UnknownProfile(_))));
    assert!(conn.is_ok());

    client.exit().unwrap();
    server.exit().unwrap();
}

#[test]
fn test_extended_start_piggyback() {
    let (server, listener) = echo_server();
    server
        .profiles()
        .register_extended_start(
            ECHO,
            Arc::new(|req: &StartRequest<'_>, _: &Connection| {
                let mut d = StartDecision::accept();
                d.piggyback = req.content.map(|c| format!("hello {}", c));
                d
            }),
        )
        .unwrap();
    let client = context();
    let conn = connect(&client, &listener);

    let options = ChannelOptions { piggyback: Some("client".into()), ..Default::default() };
    let ch = Channel::open_with(&conn, ECHO, options).unwrap();
    assert_eq!(ch.take_piggyback_reply().as_deref(), Some("hello client"));

    client.exit().unwrap();
    server.exit().unwrap();
}

#[test]
fn test_channel_close_and_session_close() {
    let (server, listener) = echo_server();
    let closed_on_server = BlockingQueue::new();
    let sink = closed_on_server.clone();
    server.add_accept_handler(Arc::new(move |conn: &Connection| {
        let sink = sink.clone();
        conn.add_on_close(Arc::new(move |c: &Connection| sink.push(c.id())));
        true
    }));
    let client = context();
    let conn = connect(&client, &listener);

    let ch = Channel::open(&conn, ECHO).unwrap();
    ch.send_msg_and_wait(b"before close", Duration::from_secs(5)).unwrap();
    ch.close().unwrap();
    assert!(!ch.is_opened());
    assert!(!conn.channel_exists(ch.number()));
    assert!(ch.send_msg(b"after").is_err());

    conn.close().unwrap();
    assert!(!conn.is_ok());
    assert_eq!(conn.pop_error().map(|e| e.0), Some(Status::Ok));
    assert!(closed_on_server.timed_pop(Duration::from_secs(2)).is_some());

    client.exit().unwrap();
    server.exit().unwrap();
}

#[test]
fn test_accept_handler_filters() {
    let (server, listener) = echo_server();
    server.add_accept_handler(Arc::new(|_: &Connection| false));
    let client = context();

    // Our side completes its greeting; the server then drops the session
    if let Ok(conn) = Connection::connect(&client, "127.0.0.1", listener.port()) {
        let mut dropped = false;
        for _ in 0..200 {
            if !conn.is_ok() {
                dropped = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(dropped);
    }

    client.exit().unwrap();
    server.exit().unwrap();
}

#[test]
fn test_pool_over_tcp() {
    let (server, listener) = echo_server();
    let client = context();
    let conn = connect(&client, &listener);

    let pool = ChannelPool::new(&conn, ECHO, 2).unwrap();
    assert_eq!(pool.get_num(), 2);

    let a = pool.get_next_ready(false).unwrap();
    let b = pool.get_next_ready(false).unwrap();
    assert!(pool.get_next_ready(false).is_none());
    let c = pool.get_next_ready(true).unwrap();
    assert_eq!(pool.get_num(), 3);
    for ch in [&a, &b, &c] {
        let reply = ch.send_msg_and_wait(b"pooled", Duration::from_secs(5)).unwrap();
        assert_eq!(reply.content(), b"pooled");
    }

    pool.release_channel(&a);
    pool.release_channel(&b);
    assert_eq!(pool.remove(5), 2);
    assert_eq!(pool.get_num(), 1);

    pool.release_channel(&c);
    pool.close();
    assert_eq!(conn.pools_count(), 0);
    assert_eq!(conn.channels_count(), 1);

    client.exit().unwrap();
    server.exit().unwrap();
}

#[test]
fn test_async_open_and_profile_delivery_order() {
    let (server, listener) = echo_server();
    let client = context();
    let conn = connect(&client, &listener);

    let seen = Arc::new(AtomicUsize::new(0));
    let order = BlockingQueue::new();
    let (count, sink) = (Arc::clone(&seen), order.clone());
    client
        .profiles()
        .register(
            ECHO,
            None,
            None,
            Some(Arc::new(move |_: &Channel, _: &Connection, frame: Frame| {
                count.fetch_add(1, Ordering::SeqCst);
                sink.push(frame.msgno());
            })),
        )
        .unwrap();

    let pending = Channel::open_async(&conn, ECHO, ChannelOptions { serialize: true, ..Default::default() }).unwrap();
    let ch = pending.wait_timeout(Duration::from_secs(5)).unwrap().unwrap();
    for _ in 0..10 {
        ch.send_msg(b"x").unwrap();
    }
    for expected in 0..10 {
        assert_eq!(order.timed_pop(Duration::from_secs(5)), Some(expected));
    }
    assert_eq!(seen.load(Ordering::SeqCst), 10);

    client.exit().unwrap();
    server.exit().unwrap();
}
