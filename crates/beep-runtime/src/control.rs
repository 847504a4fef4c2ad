//! Channel 0 processing
//!
//! Replies to our own requests are routed to the waiting caller straight
//! from the reader. Requests from the peer (`<start>`, `<close>`) are
//! served on the worker pool, in arrival order, because they run profile
//! start and close handlers.

use tracing::{debug, info, trace, warn};

use beep_core::constants::MAX_CHANNEL_NO;
use beep_core::{BeepError, Frame, FrameKind, Status};

use crate::channel::Channel;
use crate::connection::{Connection, Role};
use crate::greetings::{self, ControlMessage};
use crate::profiles::StartRequest;
use crate::worker::{Delivery, DeliveryTarget};

/// BEEP reply codes used on channel 0
const CODE_SYNTAX: u32 = 501;
const CODE_REFUSED: u32 = 550;

/// A complete frame arrived on channel 0 of an accepted session.
pub(crate) fn handle_control_frame(conn: &Connection, ch0: &Channel, frame: Frame) {
    match frame.kind() {
        FrameKind::Rpy | FrameKind::Err => conn.complete_control_request(frame),
        FrameKind::Msg => {
            let delivery = Delivery {
                connection: conn.clone(),
                channel: ch0.clone(),
                ticket: ch0.next_ticket(),
                frame,
                target: DeliveryTarget::Control,
            };
            if let Err(d) = conn.context().workers().deliver(delivery) {
                ch0.skip_ticket(d.ticket);
                debug!(conn = conn.id(), "worker pool stopped, channel 0 request dropped");
            }
        }
        FrameKind::Ans { .. } | FrameKind::Nul => {
            conn.shutdown_and_record_error(Status::ProtocolError, "ANS/NUL frame on channel 0");
        }
    }
}

fn reply(conn: &Connection, ch0: &Channel, kind: FrameKind, msgno: u32, xml: &str) {
    match ch0.queue_message(kind, msgno, xml.as_bytes()) {
        Ok(_) => conn.flush(),
        Err(e) => debug!(conn = conn.id(), msgno, error = %e, "channel 0 reply not sent"),
    }
}

/// Serve one `<start>` or `<close>` request. Runs on a worker thread.
pub(crate) fn process_request(conn: &Connection, ch0: &Channel, frame: Frame) {
    let msgno = frame.msgno();
    let request = match greetings::parse_request(&frame.content_str()) {
        Ok(r) => r,
        Err(e) => {
            warn!(conn = conn.id(), msgno, error = %e, "bad channel 0 request");
            reply(conn, ch0, FrameKind::Err, msgno, &greetings::build_error(CODE_SYNTAX, &e.to_string()));
            return;
        }
    };

    match request {
        ControlMessage::Start { number, server_name, profile, encoding, piggyback } => {
            let req = StartRequest {
                channel: number,
                profile: &profile,
                server_name: server_name.as_deref(),
                content: piggyback.as_deref(),
                encoding: encoding.as_deref(),
            };
            match accept_start(conn, &req) {
                Ok(piggyback_reply) => {
                    let channel = Channel::new(conn, number, &profile);
                    if !conn.insert_channel(&channel) {
                        reply(
                            conn,
                            ch0,
                            FrameKind::Err,
                            msgno,
                            &greetings::build_error(CODE_REFUSED, "channel already in use"),
                        );
                        return;
                    }
                    channel.mark_opened();
                    reply(
                        conn,
                        ch0,
                        FrameKind::Rpy,
                        msgno,
                        &greetings::build_profile_reply(&profile, piggyback_reply.as_deref()),
                    );
                    channel.announce_window(conn);
                    debug!(conn = conn.id(), channel = number, profile = %profile, "channel started by peer");
                }
                Err(reason) => {
                    debug!(conn = conn.id(), channel = number, profile = %profile, reason, "start refused");
                    reply(conn, ch0, FrameKind::Err, msgno, &greetings::build_error(CODE_REFUSED, reason));
                }
            }
        }
        ControlMessage::Close { number: 0, .. } => {
            reply(conn, ch0, FrameKind::Rpy, msgno, &greetings::build_ok());
            conn.set_being_closed(true);
            info!(conn = conn.id(), "session closed by peer");
            conn.shutdown_and_record_error(Status::Ok, "session closed by peer");
        }
        ControlMessage::Close { number, code } => {
            let channel = match conn.channel(number) {
                Some(c) => c,
                None => {
                    reply(conn, ch0, FrameKind::Err, msgno, &greetings::build_error(CODE_REFUSED, "no such channel"));
                    return;
                }
            };
            let accepted = match channel.close_handler() {
                Some(handler) => {
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(number, conn))).unwrap_or(false)
                }
                None => conn
                    .context()
                    .profiles()
                    .invoke_close(channel.profile(), number, conn)
                    .unwrap_or(true),
            };
            if accepted {
                conn.remove_channel(number);
                channel.mark_closed();
                reply(conn, ch0, FrameKind::Rpy, msgno, &greetings::build_ok());
                debug!(conn = conn.id(), channel = number, code, "channel closed by peer");
            } else {
                reply(
                    conn,
                    ch0,
                    FrameKind::Err,
                    msgno,
                    &greetings::build_error(CODE_REFUSED, "close refused"),
                );
            }
        }
    }
}

/// Checks for a peer's start request; `Ok` carries the piggyback reply.
fn accept_start(conn: &Connection, req: &StartRequest<'_>) -> Result<Option<String>, &'static str> {
    if req.channel == 0 || req.channel > MAX_CHANNEL_NO {
        return Err("channel number out of range");
    }
    if conn.channel_exists(req.channel) {
        return Err("channel already in use");
    }
    if conn.is_being_closed() {
        return Err("session is closing");
    }
    if conn.is_profile_filtered(req.profile) {
        return Err("profile not available");
    }
    match conn.context().profiles().invoke_start_request(req, conn) {
        None => Err("profile not supported"),
        Some(d) if !d.accept => Err("profile refused the channel"),
        Some(d) => Ok(d.piggyback),
    }
}

/// First frame of a session: the peer's greeting.
///
/// Runs on the reader. On success the connection leaves the initial
/// accept stage and whoever waits in `connect` is released.
pub(crate) fn second_step_accept(conn: &Connection, frame: Frame) {
    let fail = |status: Status, message: String| {
        conn.greeting_done(Err(match status {
            Status::ConnectionFiltered => BeepError::ConnectionFiltered(message.clone()),
            _ => BeepError::Protocol(message.clone()),
        }));
        conn.shutdown_and_record_error(status, message);
    };

    if frame.channel() != 0 || frame.msgno() != 0 || !frame.kind().is_reply() {
        fail(Status::ProtocolError, format!("expected a greeting, got {:?}", frame));
        return;
    }
    let ch0 = match conn.channel(0) {
        Some(c) => c,
        None => return fail(Status::ProtocolError, "channel 0 missing".into()),
    };
    let frame = match ch0.receive(conn, frame) {
        Ok(Some(f)) => f,
        Ok(None) => {
            // Partial greeting; the final fragment completes the accept
            trace!(conn = conn.id(), "greeting fragment stored");
            return;
        }
        Err(v) => {
            fail(Status::ProtocolError, format!("greeting: {}", v));
            return;
        }
    };
    if frame.kind() == FrameKind::Err {
        let (code, message) = greetings::parse_error(&frame.content_str());
        fail(Status::ConnectionError, format!("peer refused the session ({}): {}", code, message));
        return;
    }
    let profiles = match greetings::parse_greeting(&frame.content_str()) {
        Ok(p) => p,
        Err(e) => return fail(Status::ProtocolError, e.to_string()),
    };
    debug!(conn = conn.id(), profiles = ?profiles, "greeting received");
    conn.set_remote_profiles(profiles);

    if conn.role() == Role::Listener && !conn.context().run_accept_handlers(conn) {
        fail(Status::ConnectionFiltered, "connection filtered by accept handler".into());
        return;
    }
    conn.greeting_done(Ok(()));
}
