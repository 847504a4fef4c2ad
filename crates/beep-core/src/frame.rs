//! Frame model
//!
//! A data frame (`MSG`, `RPY`, `ERR`, `ANS`, `NUL`) is a [`Frame`]; the
//! flow-control `SEQ` frame is a separate [`SeqFrame`] since it shares no
//! fields beyond the channel number.

use std::fmt;

use crate::mime::{MimeError, MimeHeaders};
use crate::seq::seq_add;

/// Wire token of a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Msg,
    Rpy,
    Err,
    Ans,
    Nul,
    Seq,
}

impl FrameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Msg => "MSG",
            FrameType::Rpy => "RPY",
            FrameType::Err => "ERR",
            FrameType::Ans => "ANS",
            FrameType::Nul => "NUL",
            FrameType::Seq => "SEQ",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "MSG" => FrameType::Msg,
            "RPY" => FrameType::Rpy,
            "ERR" => FrameType::Err,
            "ANS" => FrameType::Ans,
            "NUL" => FrameType::Nul,
            "SEQ" => FrameType::Seq,
            _ => return None,
        })
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a data frame. `ANS` carries its answer number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Msg,
    Rpy,
    Err,
    Ans { ansno: u32 },
    Nul,
}

impl FrameKind {
    pub fn frame_type(&self) -> FrameType {
        match self {
            FrameKind::Msg => FrameType::Msg,
            FrameKind::Rpy => FrameType::Rpy,
            FrameKind::Err => FrameType::Err,
            FrameKind::Ans { .. } => FrameType::Ans,
            FrameKind::Nul => FrameType::Nul,
        }
    }

    /// Any reply kind (`RPY`, `ERR`, `ANS`, `NUL`)
    pub fn is_reply(&self) -> bool {
        !matches!(self, FrameKind::Msg)
    }
}

/// One BEEP data frame.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    id: u64,
    kind: FrameKind,
    channel: u32,
    msgno: u32,
    more: bool,
    seqno: u32,
    payload: Vec<u8>,
    /// Octets of MIME header block at the start of `payload`
    content_offset: usize,
    mime: Option<MimeHeaders>,
}

impl Frame {
    pub fn new(kind: FrameKind, channel: u32, msgno: u32, more: bool, seqno: u32, payload: Vec<u8>) -> Self {
        Self {
            id: 0,
            kind,
            channel,
            msgno,
            more,
            seqno,
            payload,
            content_offset: 0,
            mime: None,
        }
    }

    /// Process-unique id assigned when the frame enters a context
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn frame_type(&self) -> FrameType {
        self.kind.frame_type()
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    pub fn msgno(&self) -> u32 {
        self.msgno
    }

    pub fn ansno(&self) -> Option<u32> {
        match self.kind {
            FrameKind::Ans { ansno } => Some(ansno),
            _ => None,
        }
    }

    pub fn more(&self) -> bool {
        self.more
    }

    pub fn seqno(&self) -> u32 {
        self.seqno
    }

    /// Payload size in octets, MIME headers included
    pub fn size(&self) -> u32 {
        self.payload.len() as u32
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload without the MIME header block
    pub fn content(&self) -> &[u8] {
        &self.payload[self.content_offset..]
    }

    pub fn content_size(&self) -> u32 {
        (self.payload.len() - self.content_offset) as u32
    }

    /// Content as UTF-8, lossy
    pub fn content_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.content())
    }

    pub fn mime(&self) -> Option<&MimeHeaders> {
        self.mime.as_ref()
    }

    pub fn content_type(&self) -> &str {
        match &self.mime {
            Some(m) => m.content_type(),
            None => crate::constants::DEFAULT_MIME_TYPE,
        }
    }

    pub fn transfer_encoding(&self) -> &str {
        match &self.mime {
            Some(m) => m.transfer_encoding(),
            None => crate::constants::DEFAULT_TRANSFER_ENCODING,
        }
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Split the MIME header block off the payload.
    ///
    /// On failure the frame is left untouched and the whole payload stays
    /// content.
    pub fn parse_mime(&mut self) -> Result<(), MimeError> {
        let (headers, offset) = MimeHeaders::parse(&self.payload)?;
        self.mime = Some(headers);
        self.content_offset = offset;
        Ok(())
    }

    /// Whether `next` continues the logical message this frame starts.
    ///
    /// Same kind, channel, message and answer number, `self` flagged
    /// `more`, and `next` beginning right where `self` ends.
    pub fn is_joinable(&self, next: &Frame) -> bool {
        self.more
            && self.kind == next.kind
            && self.channel == next.channel
            && self.msgno == next.msgno
            && next.seqno == seq_add(self.seqno, self.size())
    }

    /// Append `next` to this frame. Callers check `is_joinable` first.
    pub fn join(mut self, next: Frame) -> Frame {
        self.more = self.more && next.more;
        self.payload.extend_from_slice(&next.payload);
        self
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("channel", &self.channel)
            .field("msgno", &self.msgno)
            .field("more", &self.more)
            .field("seqno", &self.seqno)
            .field("size", &self.payload.len())
            .finish()
    }
}

/// `SEQ channel ackno window`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqFrame {
    pub channel: u32,
    pub ackno: u32,
    pub window: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(seqno: u32, more: bool, body: &[u8]) -> Frame {
        Frame::new(FrameKind::Msg, 3, 7, more, seqno, body.to_vec())
    }

    #[test]
    fn test_frame_type_tokens() {
        for t in [FrameType::Msg, FrameType::Rpy, FrameType::Err, FrameType::Ans, FrameType::Nul, FrameType::Seq] {
            assert_eq!(FrameType::from_token(t.as_str()), Some(t));
        }
        assert_eq!(FrameType::from_token("msg"), None);
    }

    #[test]
    fn test_joinable_requires_contiguous_seqno() {
        let a = msg(100, true, b"abc");
        assert!(a.is_joinable(&msg(103, false, b"de")));
        assert!(!a.is_joinable(&msg(104, false, b"de")));
        let mut other = msg(103, false, b"de");
        other.msgno = 8;
        assert!(!a.is_joinable(&other));
        assert!(!msg(100, false, b"abc").is_joinable(&msg(103, false, b"de")));
    }

    #[test]
    fn test_join_concatenates_and_clears_more() {
        let joined = msg(0, true, b"hel").join(msg(3, true, b"lo ")).join(msg(6, false, b"there"));
        assert_eq!(joined.payload(), b"hello there");
        assert!(!joined.more());
        assert_eq!(joined.seqno(), 0);
        assert_eq!(joined.size(), 11);
    }

    #[test]
    fn test_parse_mime_moves_content_offset() {
        let mut f = msg(0, false, b"Content-Type: text/plain\r\n\r\nbody");
        f.parse_mime().unwrap();
        assert_eq!(f.content(), b"body");
        assert_eq!(f.content_type(), "text/plain");
        assert_eq!(f.size(), 32);
        assert_eq!(f.content_size(), 4);
    }

    #[test]
    fn test_parse_mime_failure_keeps_payload() {
        let mut f = msg(0, false, b"hi");
        assert!(f.parse_mime().is_err());
        assert_eq!(f.content(), b"hi");
        assert_eq!(f.content_type(), "application/octet-stream");
    }
}
