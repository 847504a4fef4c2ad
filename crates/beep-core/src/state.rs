//! Per-channel sequencing, flow control and reassembly
//!
//! `ChannelState` is the pure half of a channel: counters, the two
//! outstanding-message lists, both flow-control windows, the pending
//! fragment and the outgoing message queue. It does no I/O; the reader
//! drives it per incoming frame in this order:
//!
//! 1. `check_window` - frame fits in the window we advertised
//! 2. `update_incoming_buffer` - maybe produce a `SEQ` advertisement
//! 3. `validate` - message number and sequence number ordering
//! 4. `apply` - counters and outstanding-message bookkeeping
//! 5. `assemble` - fragment joining per the complete flag
//!
//! Senders go through `queue_outgoing` + `pull_frames`, which cut payloads
//! to what the remote window allows. Replies leave in the order their MSGs
//! arrived; one queued early is held until the replies before it are out.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;

use crate::codec::encode_data;
use crate::constants::DEFAULT_WINDOW_SIZE;
use crate::frame::{Frame, FrameKind, SeqFrame};
use crate::seq::{msgno_next, seq_add, seq_distance, seq_fits};

/// Ordering or format rule broken by an incoming frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("MSG {msgno} is already received and unreplied")]
    ReplayedMsg { msgno: u32 },

    #[error("reply for msgno {got}, expected {expected}")]
    UnexpectedReply { expected: u32, got: u32 },

    #[error("seqno {got}, expected {expected}")]
    UnexpectedSeqno { expected: u32, got: u32 },

    #[error("NUL frame with payload or continuation")]
    InvalidNul,

    #[error("frame seqno {seqno} size {size} exceeds window ending at {limit}")]
    WindowExceeded { seqno: u32, size: u32, limit: u32 },

    #[error("fragment does not continue the pending frame")]
    NotJoinable,

    #[error("message spans more than {limit} frames")]
    FrameLimit { limit: usize },
}

/// Result of feeding a validated frame to the reassembly step.
#[derive(Debug)]
pub enum Assembly {
    /// Fragment stored, nothing to deliver yet
    Pending,
    /// Frame (possibly joined) ready for delivery
    Deliver(Frame),
}

#[derive(Debug)]
struct OutgoingMessage {
    kind: FrameKind,
    msgno: u32,
    payload: Vec<u8>,
    offset: usize,
}

#[derive(Debug)]
pub struct ChannelState {
    number: u32,

    // ── outgoing ──
    next_seq_no: u32,
    msg_no: u32,
    /// MSGs we sent that still await their reply
    sent_pending: VecDeque<u32>,
    remote_ackno: u32,
    remote_window: u32,
    outgoing: VecDeque<OutgoingMessage>,
    /// Replies waiting for an earlier MSG to be answered
    held_replies: Vec<OutgoingMessage>,
    /// Next ANS number per MSG being answered
    ansnos: HashMap<u32, u32>,

    // ── incoming ──
    next_expected_seq_no: u32,
    next_expected_reply_no: u32,
    /// MSGs received in full that we have not replied to
    received_unreplied: VecDeque<u32>,
    last_msgno_received: Option<u32>,
    window: u32,
    last_ackno_sent: u32,
    reply_processed: bool,

    // ── reassembly ──
    complete_flag: bool,
    frame_limit: Option<usize>,
    previous: Option<Frame>,
    fragments: usize,
}

impl ChannelState {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            next_seq_no: 0,
            msg_no: 0,
            sent_pending: VecDeque::new(),
            remote_ackno: 0,
            remote_window: DEFAULT_WINDOW_SIZE,
            outgoing: VecDeque::new(),
            held_replies: Vec::new(),
            ansnos: HashMap::new(),
            next_expected_seq_no: 0,
            next_expected_reply_no: 0,
            received_unreplied: VecDeque::new(),
            last_msgno_received: None,
            window: DEFAULT_WINDOW_SIZE,
            last_ackno_sent: 0,
            reply_processed: false,
            complete_flag: true,
            frame_limit: None,
            previous: None,
            fragments: 0,
        }
    }

    /// Channel 0 state: both greetings travel as `RPY 0`, so reply 0 is
    /// expected up front and our own MSGs start at 1.
    pub fn new_control() -> Self {
        let mut st = Self::new(0);
        st.msg_no = 1;
        st.sent_pending.push_back(0);
        st
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn next_seq_no(&self) -> u32 {
        self.next_seq_no
    }

    pub fn next_expected_seq_no(&self) -> u32 {
        self.next_expected_seq_no
    }

    pub fn next_msg_no(&self) -> u32 {
        self.msg_no
    }

    pub fn next_expected_reply_no(&self) -> u32 {
        self.next_expected_reply_no
    }

    pub fn last_msgno_received(&self) -> Option<u32> {
        self.last_msgno_received
    }

    /// Number of our MSGs still waiting for a reply
    pub fn outstanding_replies(&self) -> usize {
        self.sent_pending.len()
    }

    /// Received MSGs we still owe a reply for
    pub fn unreplied(&self) -> impl Iterator<Item = u32> + '_ {
        self.received_unreplied.iter().copied()
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn remote_window(&self) -> u32 {
        self.remote_window
    }

    pub fn complete_flag(&self) -> bool {
        self.complete_flag
    }

    pub fn set_complete_flag(&mut self, on: bool) {
        self.complete_flag = on;
    }

    pub fn set_frame_limit(&mut self, limit: Option<usize>) {
        self.frame_limit = limit;
    }

    /// Returns and clears the "a reply was processed" flag.
    pub fn take_reply_processed(&mut self) -> bool {
        std::mem::replace(&mut self.reply_processed, false)
    }

    pub fn has_pending_fragment(&self) -> bool {
        self.previous.is_some()
    }

    // ── incoming path ──

    /// Frame must fit in the window we advertised.
    pub fn check_window(&self, frame: &Frame) -> Result<(), Violation> {
        if seq_fits(self.last_ackno_sent, self.window, frame.seqno(), frame.size()) {
            Ok(())
        } else {
            Err(Violation::WindowExceeded {
                seqno: frame.seqno(),
                size: frame.size(),
                limit: seq_add(self.last_ackno_sent, self.window),
            })
        }
    }

    /// Account for `frame` in the incoming window.
    ///
    /// Once half the window is consumed since the last acknowledgement a
    /// `SEQ` advertisement is returned for the caller to send.
    pub fn update_incoming_buffer(&mut self, frame: &Frame) -> Option<SeqFrame> {
        if frame.seqno() != self.next_expected_seq_no {
            return None;
        }
        let consumed_to = seq_add(frame.seqno(), frame.size());
        if seq_distance(self.last_ackno_sent, consumed_to) < (self.window / 2).max(1) {
            return None;
        }
        self.last_ackno_sent = consumed_to;
        Some(SeqFrame { channel: self.number, ackno: consumed_to, window: self.window })
    }

    /// Change the incoming window; the returned `SEQ` announces it.
    pub fn set_window(&mut self, window: u32) -> SeqFrame {
        self.window = window;
        self.last_ackno_sent = self.next_expected_seq_no;
        SeqFrame { channel: self.number, ackno: self.next_expected_seq_no, window }
    }

    /// Message number and sequence number ordering rules.
    pub fn validate(&self, frame: &Frame) -> Result<(), Violation> {
        match frame.kind() {
            FrameKind::Msg => {
                if self.received_unreplied.contains(&frame.msgno()) {
                    return Err(Violation::ReplayedMsg { msgno: frame.msgno() });
                }
            }
            _ => {
                if frame.msgno() != self.next_expected_reply_no {
                    return Err(Violation::UnexpectedReply {
                        expected: self.next_expected_reply_no,
                        got: frame.msgno(),
                    });
                }
            }
        }
        if frame.seqno() != self.next_expected_seq_no {
            return Err(Violation::UnexpectedSeqno { expected: self.next_expected_seq_no, got: frame.seqno() });
        }
        if frame.kind() == FrameKind::Nul && (frame.size() != 0 || frame.more()) {
            return Err(Violation::InvalidNul);
        }
        Ok(())
    }

    /// Counter updates for a frame that passed `validate`.
    pub fn apply(&mut self, frame: &Frame) {
        self.next_expected_seq_no = seq_add(self.next_expected_seq_no, frame.size());
        match frame.kind() {
            FrameKind::Msg => {
                if !frame.more() {
                    self.received_unreplied.push_back(frame.msgno());
                    self.last_msgno_received = Some(frame.msgno());
                }
            }
            FrameKind::Rpy | FrameKind::Err => {
                self.reply_processed = true;
                if !frame.more() {
                    self.sent_pending.pop_front();
                    self.next_expected_reply_no = msgno_next(self.next_expected_reply_no);
                }
            }
            FrameKind::Nul => {
                self.reply_processed = true;
                self.sent_pending.pop_front();
                self.next_expected_reply_no = msgno_next(self.next_expected_reply_no);
            }
            FrameKind::Ans { .. } => {
                self.reply_processed = true;
            }
        }
    }

    /// Fragment handling for a validated frame.
    pub fn assemble(&mut self, frame: Frame) -> Result<Assembly, Violation> {
        let prev = match self.previous.take() {
            None if frame.more() && self.complete_flag => {
                self.fragments = 1;
                self.previous = Some(frame);
                return Ok(Assembly::Pending);
            }
            None => return Ok(Assembly::Deliver(frame)),
            Some(prev) => prev,
        };

        if !prev.is_joinable(&frame) {
            self.fragments = 0;
            return Err(Violation::NotJoinable);
        }
        self.fragments += 1;
        if let Some(limit) = self.frame_limit {
            if self.fragments > limit {
                self.fragments = 0;
                return Err(Violation::FrameLimit { limit });
            }
        }
        let joined = prev.join(frame);
        if joined.more() {
            self.previous = Some(joined);
            Ok(Assembly::Pending)
        } else {
            self.fragments = 0;
            Ok(Assembly::Deliver(joined))
        }
    }

    // ── outgoing path ──

    /// Remote advertised `ackno`/`window` in a `SEQ` frame.
    pub fn update_remote_buffer(&mut self, seq: &SeqFrame) {
        self.remote_ackno = seq.ackno;
        self.remote_window = seq.window;
    }

    /// Octets the remote will still accept.
    pub fn remote_available(&self) -> u32 {
        let used = seq_distance(self.remote_ackno, self.next_seq_no);
        self.remote_window.saturating_sub(used)
    }

    /// Reserve the next MSG number and record it as awaiting a reply.
    pub fn allocate_msgno(&mut self) -> u32 {
        let msgno = self.msg_no;
        self.msg_no = msgno_next(msgno);
        self.sent_pending.push_back(msgno);
        msgno
    }

    /// Reserve the next ANS number in the answer series for `msgno`.
    pub fn allocate_ansno(&mut self, msgno: u32) -> u32 {
        let next = self.ansnos.entry(msgno).or_insert(0);
        let ansno = *next;
        *next = msgno_next(ansno);
        ansno
    }

    /// A final reply (`RPY`, `ERR`, `NUL`) for `msgno` went to the
    /// outgoing queue.
    pub fn reply_sent(&mut self, msgno: u32) {
        self.ansnos.remove(&msgno);
        if let Some(idx) = self.received_unreplied.iter().position(|&m| m == msgno) {
            self.received_unreplied.remove(idx);
        }
    }

    /// Queue a message for `pull_frames`.
    ///
    /// Replies to a MSG that is not the oldest unreplied one are held back
    /// and released once every earlier MSG has its final reply queued.
    pub fn queue_outgoing(&mut self, kind: FrameKind, msgno: u32, payload: Vec<u8>) {
        let msg = OutgoingMessage { kind, msgno, payload, offset: 0 };
        let in_turn = kind == FrameKind::Msg
            || self.received_unreplied.front() == Some(&msgno)
            || !self.received_unreplied.contains(&msgno);
        if !in_turn {
            self.held_replies.push(msg);
            return;
        }
        self.push_outgoing(msg);
        self.release_held();
    }

    fn push_outgoing(&mut self, msg: OutgoingMessage) {
        let (kind, msgno) = (msg.kind, msg.msgno);
        self.outgoing.push_back(msg);
        if matches!(kind, FrameKind::Rpy | FrameKind::Err | FrameKind::Nul) {
            self.reply_sent(msgno);
        }
    }

    fn release_held(&mut self) {
        while let Some(&front) = self.received_unreplied.front() {
            match self.held_replies.iter().position(|m| m.msgno == front) {
                Some(idx) => {
                    let msg = self.held_replies.remove(idx);
                    self.push_outgoing(msg);
                }
                None => break,
            }
        }
    }

    /// Messages (or remainders) waiting for window or for their turn
    pub fn pending_outgoing(&self) -> usize {
        self.outgoing.len() + self.held_replies.len()
    }

    /// Replies held back behind an unanswered earlier MSG
    pub fn held_replies(&self) -> usize {
        self.held_replies.len()
    }

    /// Encode every frame the remote window currently allows.
    ///
    /// Frames carry at most `max_frame` octets; a message that does not
    /// fit stays queued at its current offset until the window reopens.
    pub fn pull_frames(&mut self, max_frame: u32) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Some(msg) = self.outgoing.front_mut() {
            let remaining = msg.payload.len() - msg.offset;
            let chunk = if remaining == 0 {
                0
            } else {
                let avail = (self.remote_window.saturating_sub(seq_distance(self.remote_ackno, self.next_seq_no)))
                    .min(max_frame.max(1)) as usize;
                if avail == 0 {
                    break;
                }
                remaining.min(avail)
            };
            let more = msg.offset + chunk < msg.payload.len();
            frames.push(encode_data(
                msg.kind,
                self.number,
                msg.msgno,
                more,
                self.next_seq_no,
                &msg.payload[msg.offset..msg.offset + chunk],
            ));
            self.next_seq_no = seq_add(self.next_seq_no, chunk as u32);
            msg.offset += chunk;
            if !more {
                self.outgoing.pop_front();
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FrameDecoder, Incoming};
    use proptest::prelude::*;

    fn frame(kind: FrameKind, msgno: u32, more: bool, seqno: u32, body: &[u8]) -> Frame {
        Frame::new(kind, 1, msgno, more, seqno, body.to_vec())
    }

    /// Run the full incoming pipeline; `Err` means the connection would be torn down.
    fn receive(st: &mut ChannelState, f: Frame) -> Result<Assembly, Violation> {
        st.check_window(&f)?;
        st.update_incoming_buffer(&f);
        st.validate(&f)?;
        st.apply(&f);
        st.assemble(f)
    }

    #[test]
    fn test_msg_advances_seq_and_tracks_unreplied() {
        let mut st = ChannelState::new(1);
        assert!(matches!(receive(&mut st, frame(FrameKind::Msg, 0, false, 0, b"hi")), Ok(Assembly::Deliver(_))));
        assert_eq!(st.next_expected_seq_no(), 2);
        assert_eq!(st.unreplied().collect::<Vec<_>>(), vec![0]);
        st.reply_sent(0);
        assert_eq!(st.unreplied().count(), 0);
    }

    #[test]
    fn test_replayed_msg_rejected() {
        let mut st = ChannelState::new(1);
        receive(&mut st, frame(FrameKind::Msg, 4, false, 0, b"a")).unwrap();
        let err = receive(&mut st, frame(FrameKind::Msg, 4, false, 1, b"a")).unwrap_err();
        assert_eq!(err, Violation::ReplayedMsg { msgno: 4 });
        assert_eq!(st.next_expected_seq_no(), 1);
    }

    #[test]
    fn test_reply_must_match_expected() {
        let mut st = ChannelState::new(1);
        assert_eq!(st.allocate_msgno(), 0);
        let err = receive(&mut st, frame(FrameKind::Rpy, 3, false, 0, b"x")).unwrap_err();
        assert_eq!(err, Violation::UnexpectedReply { expected: 0, got: 3 });
        receive(&mut st, frame(FrameKind::Rpy, 0, false, 0, b"x")).unwrap();
        assert_eq!(st.outstanding_replies(), 0);
        assert_eq!(st.next_expected_reply_no(), 1);
        assert!(st.take_reply_processed());
        assert!(!st.take_reply_processed());
    }

    #[test]
    fn test_ans_series_closed_by_nul() {
        let mut st = ChannelState::new(1);
        st.allocate_msgno();
        receive(&mut st, frame(FrameKind::Ans { ansno: 0 }, 0, false, 0, b"a")).unwrap();
        receive(&mut st, frame(FrameKind::Ans { ansno: 1 }, 0, false, 1, b"b")).unwrap();
        assert_eq!(st.outstanding_replies(), 1);
        receive(&mut st, frame(FrameKind::Nul, 0, false, 2, b"")).unwrap();
        assert_eq!(st.outstanding_replies(), 0);
        assert_eq!(st.next_expected_reply_no(), 1);
    }

    #[test]
    fn test_nul_with_payload_rejected() {
        let mut st = ChannelState::new(1);
        st.allocate_msgno();
        assert_eq!(receive(&mut st, frame(FrameKind::Nul, 0, false, 0, b"x")).unwrap_err(), Violation::InvalidNul);
        assert_eq!(receive(&mut st, frame(FrameKind::Nul, 0, true, 0, b"")).unwrap_err(), Violation::InvalidNul);
    }

    #[test]
    fn test_out_of_order_seqno_rejected() {
        let mut st = ChannelState::new(1);
        receive(&mut st, frame(FrameKind::Msg, 0, false, 0, b"abc")).unwrap();
        let err = receive(&mut st, frame(FrameKind::Msg, 1, false, 5, b"abc")).unwrap_err();
        assert_eq!(err, Violation::UnexpectedSeqno { expected: 3, got: 5 });
        assert_eq!(st.next_expected_seq_no(), 3);
    }

    #[test]
    fn test_control_channel_expects_greeting() {
        let mut st = ChannelState::new_control();
        assert_eq!(st.next_msg_no(), 1);
        receive(&mut st, Frame::new(FrameKind::Rpy, 0, 0, false, 0, b"<greeting/>".to_vec())).unwrap();
        assert_eq!(st.next_expected_reply_no(), 1);
        assert_eq!(st.allocate_msgno(), 1);
    }

    #[test]
    fn test_window_exceeded() {
        let mut st = ChannelState::new(1);
        let big = vec![0u8; DEFAULT_WINDOW_SIZE as usize + 1];
        assert!(matches!(
            receive(&mut st, frame(FrameKind::Msg, 0, false, 0, &big)),
            Err(Violation::WindowExceeded { .. })
        ));
    }

    #[test]
    fn test_seq_emitted_after_half_window() {
        let mut st = ChannelState::new(7);
        let half = vec![1u8; 2048];
        let f = Frame::new(FrameKind::Msg, 7, 0, true, 0, half.clone());
        assert_eq!(st.update_incoming_buffer(&f), Some(SeqFrame { channel: 7, ackno: 2048, window: 4096 }));
        st.validate(&f).unwrap();
        st.apply(&f);
        // Window slid: 4096 more octets from 2048 are now acceptable
        let f2 = Frame::new(FrameKind::Msg, 7, 0, false, 2048, vec![0u8; 4096]);
        st.check_window(&f2).unwrap();
        let small = Frame::new(FrameKind::Msg, 7, 0, false, 2048, vec![0u8; 10]);
        assert_eq!(st.update_incoming_buffer(&small), None);
    }

    #[test]
    fn test_fragment_without_complete_flag_delivered_as_is() {
        let mut st = ChannelState::new(1);
        st.set_complete_flag(false);
        match receive(&mut st, frame(FrameKind::Msg, 0, true, 0, b"ab")).unwrap() {
            Assembly::Deliver(f) => assert!(f.more()),
            Assembly::Pending => panic!("fragment buffered with complete flag off"),
        }
    }

    #[test]
    fn test_non_joinable_fragment() {
        let mut st = ChannelState::new(1);
        st.allocate_msgno();
        st.allocate_msgno();
        receive(&mut st, frame(FrameKind::Rpy, 0, true, 0, b"ab")).unwrap();
        // ANS cannot continue a pending RPY
        let err = receive(&mut st, frame(FrameKind::Ans { ansno: 0 }, 0, false, 2, b"c")).unwrap_err();
        assert_eq!(err, Violation::NotJoinable);
    }

    #[test]
    fn test_frame_limit() {
        let mut st = ChannelState::new(1);
        st.set_frame_limit(Some(2));
        receive(&mut st, frame(FrameKind::Msg, 0, true, 0, b"a")).unwrap();
        receive(&mut st, frame(FrameKind::Msg, 0, true, 1, b"b")).unwrap();
        assert_eq!(
            receive(&mut st, frame(FrameKind::Msg, 0, false, 2, b"c")).unwrap_err(),
            Violation::FrameLimit { limit: 2 }
        );
    }

    #[test]
    fn test_pull_frames_respects_remote_window() {
        let mut st = ChannelState::new(3);
        let msgno = st.allocate_msgno();
        st.queue_outgoing(FrameKind::Msg, msgno, vec![b'x'; 10_000]);
        let first = st.pull_frames(4096);
        assert_eq!(first.len(), 1);
        assert_eq!(st.remote_available(), 0);
        assert_eq!(st.pending_outgoing(), 1);
        assert!(st.pull_frames(4096).is_empty());

        st.update_remote_buffer(&SeqFrame { channel: 3, ackno: 4096, window: 4096 });
        assert_eq!(st.pull_frames(1000).len(), 5);
        st.update_remote_buffer(&SeqFrame { channel: 3, ackno: 8192, window: 4096 });
        let last = st.pull_frames(4096);
        assert_eq!(last.len(), 1);
        assert_eq!(st.pending_outgoing(), 0);
        assert_eq!(st.next_seq_no(), 10_000);

        let mut d = FrameDecoder::new();
        d.feed(&last[0]);
        match d.decode().unwrap() {
            Some(Incoming::Frame(f)) => {
                assert!(!f.more());
                assert_eq!(f.seqno(), 8192);
                assert_eq!(f.size(), 1808);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_empty_payload_ignores_window() {
        let mut st = ChannelState::new(3);
        st.update_remote_buffer(&SeqFrame { channel: 3, ackno: 0, window: 0 });
        st.queue_outgoing(FrameKind::Nul, 0, Vec::new());
        assert_eq!(st.pull_frames(4096), vec![b"NUL 3 0 . 0 0\r\nEND\r\n".to_vec()]);
    }

    #[test]
    fn test_replies_leave_in_receive_order() {
        let mut st = ChannelState::new(1);
        receive(&mut st, frame(FrameKind::Msg, 0, false, 0, b"a")).unwrap();
        receive(&mut st, frame(FrameKind::Msg, 1, false, 1, b"b")).unwrap();
        receive(&mut st, frame(FrameKind::Msg, 2, false, 2, b"c")).unwrap();

        st.queue_outgoing(FrameKind::Rpy, 2, b"two".to_vec());
        st.queue_outgoing(FrameKind::Ans { ansno: 0 }, 1, b"one".to_vec());
        assert_eq!(st.held_replies(), 2);
        assert!(st.pull_frames(4096).is_empty());

        st.queue_outgoing(FrameKind::Rpy, 0, b"zero".to_vec());
        st.queue_outgoing(FrameKind::Nul, 1, Vec::new());
        assert_eq!(st.held_replies(), 0);
        assert_eq!(st.unreplied().count(), 0);

        let mut d = FrameDecoder::new();
        for f in st.pull_frames(4096) {
            d.feed(&f);
        }
        let mut order = Vec::new();
        while let Some(Incoming::Frame(f)) = d.decode().unwrap() {
            order.push((f.kind(), f.msgno()));
        }
        assert_eq!(
            order,
            vec![
                (FrameKind::Rpy, 0),
                (FrameKind::Ans { ansno: 0 }, 1),
                (FrameKind::Nul, 1),
                (FrameKind::Rpy, 2),
            ]
        );
    }

    #[test]
    fn test_ansno_series_restarts_after_final_reply() {
        let mut st = ChannelState::new(1);
        assert_eq!(st.allocate_ansno(4), 0);
        assert_eq!(st.allocate_ansno(4), 1);
        assert_eq!(st.allocate_ansno(7), 0);
        st.reply_sent(4);
        assert_eq!(st.allocate_ansno(4), 0);
        assert_eq!(st.allocate_ansno(7), 1);
    }

    proptest! {
        #[test]
        fn prop_seq_no_is_sum_of_sizes(sizes in proptest::collection::vec(0usize..300, 1..20)) {
            let mut st = ChannelState::new(1);
            st.set_window(u32::MAX / 2);
            let mut seq = 0u32;
            for (i, size) in sizes.iter().enumerate() {
                let f = frame(FrameKind::Msg, i as u32, false, seq, &vec![0u8; *size]);
                prop_assert!(receive(&mut st, f).is_ok());
                seq = seq.wrapping_add(*size as u32);
                prop_assert_eq!(st.next_expected_seq_no(), seq);
            }
            let before = st.next_expected_seq_no();
            let bad = frame(FrameKind::Msg, 1000, false, before.wrapping_add(1), b"x");
            prop_assert!(receive(&mut st, bad).is_err());
            prop_assert_eq!(st.next_expected_seq_no(), before);
        }

        #[test]
        fn prop_fragments_rejoin(payload in proptest::collection::vec(any::<u8>(), 1..2000), cuts in proptest::collection::vec(1usize..400, 0..10)) {
            let mut st = ChannelState::new(1);
            let mut pieces = Vec::new();
            let mut rest = &payload[..];
            for c in cuts {
                if rest.len() <= c { break; }
                let (a, b) = rest.split_at(c);
                pieces.push(a);
                rest = b;
            }
            pieces.push(rest);

            let mut seq = 0u32;
            let mut delivered = None;
            for (i, piece) in pieces.iter().enumerate() {
                let more = i + 1 < pieces.len();
                match receive(&mut st, frame(FrameKind::Msg, 0, more, seq, piece)) {
                    Ok(Assembly::Deliver(f)) => { prop_assert!(!more); delivered = Some(f); }
                    Ok(Assembly::Pending) => prop_assert!(more),
                    Err(e) => return Err(TestCaseError::fail(e.to_string())),
                }
                seq += piece.len() as u32;
            }
            let f = delivered.expect("final fragment delivers");
            prop_assert_eq!(f.payload(), &payload[..]);
            prop_assert!(!f.more());
        }

        #[test]
        fn prop_replay_never_accepted(msgnos in proptest::collection::vec(0u32..8, 1..30)) {
            let mut st = ChannelState::new(1);
            let mut seq = 0u32;
            let mut accepted = std::collections::HashSet::new();
            for m in msgnos {
                let res = receive(&mut st, frame(FrameKind::Msg, m, false, seq, b"z"));
                if accepted.contains(&m) {
                    prop_assert_eq!(res.unwrap_err(), Violation::ReplayedMsg { msgno: m });
                } else {
                    prop_assert!(res.is_ok());
                    accepted.insert(m);
                    seq += 1;
                }
            }
        }
    }
}
