//! Wire codec
//!
//! ```text
//! MSG 1 0 . 0 5\r\n          <- type channel msgno more seqno size
//! hello                      <- payload (size octets)
//! END\r\n
//!
//! ANS 1 0 * 52 10 3\r\n      <- ANS adds the answer number
//! SEQ 1 52 4096\r\n          <- channel ackno window, no payload
//! ```
//!
//! [`FrameDecoder`] buffers partial reads so the reader can feed whatever
//! a non-blocking `recv` returned and pull complete frames out.

use crate::constants::{MAX_BUFFER_SIZE, MAX_CHANNEL_NO, MAX_HEADER_LEN, MAX_MSG_NO, TRAILER};
use crate::error::DecodeError;
use crate::frame::{Frame, FrameKind, FrameType, SeqFrame};

/// One decoded unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Frame(Frame),
    Seq(SeqFrame),
}

impl Incoming {
    pub fn channel(&self) -> u32 {
        match self {
            Incoming::Frame(f) => f.channel(),
            Incoming::Seq(s) => s.channel,
        }
    }
}

/// Parsed header line, before the payload is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    Data {
        kind: FrameKind,
        channel: u32,
        msgno: u32,
        more: bool,
        seqno: u32,
        size: u32,
    },
    Seq(SeqFrame),
}

fn number(field: &'static str, token: Option<&str>, max: u64) -> Result<u32, DecodeError> {
    let token = token.ok_or_else(|| DecodeError::MalformedHeader(format!("missing {}", field)))?;
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DecodeError::MalformedHeader(format!("{} '{}' is not a number", field, token)));
    }
    let value: u64 = token
        .parse()
        .map_err(|_| DecodeError::OutOfRange { field, value: u64::MAX })?;
    if value > max {
        return Err(DecodeError::OutOfRange { field, value });
    }
    Ok(value as u32)
}

/// Parse a header line with its CRLF already stripped.
pub fn parse_header(line: &str) -> Result<Header, DecodeError> {
    let mut tokens = line.split(' ');
    let token = tokens.next().unwrap_or_default();
    let ftype = FrameType::from_token(token).ok_or_else(|| DecodeError::UnknownType(token.to_string()))?;

    let header = if ftype == FrameType::Seq {
        Header::Seq(SeqFrame {
            channel: number("channel", tokens.next(), MAX_CHANNEL_NO as u64)?,
            ackno: number("ackno", tokens.next(), u32::MAX as u64)?,
            window: number("window", tokens.next(), MAX_MSG_NO as u64)?,
        })
    } else {
        let channel = number("channel", tokens.next(), MAX_CHANNEL_NO as u64)?;
        let msgno = number("msgno", tokens.next(), MAX_MSG_NO as u64)?;
        let more = match tokens.next() {
            Some(".") => false,
            Some("*") => true,
            other => {
                return Err(DecodeError::MalformedHeader(format!(
                    "continuation indicator {:?}",
                    other.unwrap_or("")
                )))
            }
        };
        let seqno = number("seqno", tokens.next(), u32::MAX as u64)?;
        let size = number("size", tokens.next(), MAX_MSG_NO as u64)?;
        let kind = match ftype {
            FrameType::Msg => FrameKind::Msg,
            FrameType::Rpy => FrameKind::Rpy,
            FrameType::Err => FrameKind::Err,
            FrameType::Nul => FrameKind::Nul,
            _ => FrameKind::Ans { ansno: number("ansno", tokens.next(), MAX_MSG_NO as u64)? },
        };
        Header::Data { kind, channel, msgno, more, seqno, size }
    };

    if tokens.next().is_some() {
        return Err(DecodeError::MalformedHeader(format!("trailing fields in '{}'", line)));
    }
    Ok(header)
}

/// Incremental frame decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_payload: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_BUFFER_SIZE)
    }

    /// Frames announcing more than `max_payload` octets are rejected.
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { buf: Vec::new(), max_payload }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Octets buffered but not yet decoded
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Pull the next complete frame. `Ok(None)` means more bytes are needed.
    pub fn decode(&mut self) -> Result<Option<Incoming>, DecodeError> {
        let scan = self.buf.len().min(MAX_HEADER_LEN);
        let eol = match self.buf[..scan].iter().position(|&b| b == b'\n') {
            Some(i) => i,
            None if self.buf.len() >= MAX_HEADER_LEN => return Err(DecodeError::HeaderTooLong(MAX_HEADER_LEN)),
            None => return Ok(None),
        };
        if eol == 0 || self.buf[eol - 1] != b'\r' {
            return Err(DecodeError::MissingCrlf);
        }
        let line = std::str::from_utf8(&self.buf[..eol - 1])
            .map_err(|_| DecodeError::MalformedHeader("non-ASCII header".into()))?;
        let header_len = eol + 1;

        match parse_header(line)? {
            Header::Seq(seq) => {
                self.buf.drain(..header_len);
                Ok(Some(Incoming::Seq(seq)))
            }
            Header::Data { kind, channel, msgno, more, seqno, size } => {
                let size = size as usize;
                if size > self.max_payload {
                    tracing::debug!(channel, size, max = self.max_payload, "frame exceeds payload limit");
                    return Err(DecodeError::OutOfRange { field: "size", value: size as u64 });
                }
                let total = header_len + size + TRAILER.len();
                if self.buf.len() < total {
                    return Ok(None);
                }
                if &self.buf[header_len + size..total] != TRAILER {
                    tracing::debug!(channel, msgno, size, "frame trailer mismatch");
                    return Err(DecodeError::BadTrailer);
                }
                let payload = self.buf[header_len..header_len + size].to_vec();
                self.buf.drain(..total);
                Ok(Some(Incoming::Frame(Frame::new(kind, channel, msgno, more, seqno, payload))))
            }
        }
    }
}

/// Serialize a data frame from its parts.
pub fn encode_data(kind: FrameKind, channel: u32, msgno: u32, more: bool, seqno: u32, payload: &[u8]) -> Vec<u8> {
    let cont = if more { '*' } else { '.' };
    let header = match kind {
        FrameKind::Ans { ansno } => format!(
            "ANS {} {} {} {} {} {}\r\n",
            channel,
            msgno,
            cont,
            seqno,
            payload.len(),
            ansno
        ),
        _ => format!(
            "{} {} {} {} {} {}\r\n",
            kind.frame_type(),
            channel,
            msgno,
            cont,
            seqno,
            payload.len()
        ),
    };
    let mut out = Vec::with_capacity(header.len() + payload.len() + TRAILER.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(TRAILER);
    out
}

pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    encode_data(frame.kind(), frame.channel(), frame.msgno(), frame.more(), frame.seqno(), frame.payload())
}

pub fn encode_seq(seq: &SeqFrame) -> Vec<u8> {
    format!("SEQ {} {} {}\r\n", seq.channel, seq.ackno, seq.window).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Result<Vec<Incoming>, DecodeError> {
        let mut d = FrameDecoder::new();
        d.feed(bytes);
        let mut out = Vec::new();
        while let Some(i) = d.decode()? {
            out.push(i);
        }
        Ok(out)
    }

    #[test]
    fn test_decode_msg() {
        let got = decode_all(b"MSG 5 0 . 0 2\r\nhiEND\r\n").unwrap();
        match &got[..] {
            [Incoming::Frame(f)] => {
                assert_eq!(f.kind(), FrameKind::Msg);
                assert_eq!(f.channel(), 5);
                assert_eq!(f.msgno(), 0);
                assert!(!f.more());
                assert_eq!(f.payload(), b"hi");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_ans_and_seq() {
        let got = decode_all(b"ANS 1 4 * 10 3 7\r\nabcEND\r\nSEQ 1 13 4096\r\n").unwrap();
        assert_eq!(got.len(), 2);
        match &got[0] {
            Incoming::Frame(f) => {
                assert_eq!(f.ansno(), Some(7));
                assert!(f.more());
                assert_eq!(f.seqno(), 10);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(got[1], Incoming::Seq(SeqFrame { channel: 1, ackno: 13, window: 4096 }));
    }

    #[test]
    fn test_partial_reads_buffer() {
        let wire = encode_data(FrameKind::Rpy, 2, 9, false, 100, b"partial payload");
        let mut d = FrameDecoder::new();
        for chunk in wire.chunks(4) {
            d.feed(chunk);
            if d.buffered() < wire.len() {
                assert_eq!(d.decode().unwrap(), None);
            }
        }
        match d.decode().unwrap() {
            Some(Incoming::Frame(f)) => assert_eq!(f.payload(), b"partial payload"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(d.buffered(), 0);
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(decode_all(b"FOO 1 0 . 0 0\r\nEND\r\n"), Err(DecodeError::UnknownType("FOO".into())));
        assert_eq!(decode_all(b"MSG 1 0 . 0 0\nEND\r\n"), Err(DecodeError::MissingCrlf));
        assert_eq!(decode_all(b"MSG 1 0 . 0 2\r\nhiEOF\r\n"), Err(DecodeError::BadTrailer));
        assert!(matches!(decode_all(b"MSG 1 0 ? 0 0\r\nEND\r\n"), Err(DecodeError::MalformedHeader(_))));
        assert!(matches!(decode_all(b"MSG 1 0 . 0 0 9\r\nEND\r\n"), Err(DecodeError::MalformedHeader(_))));
        assert!(matches!(decode_all(b"MSG x 0 . 0 0\r\nEND\r\n"), Err(DecodeError::MalformedHeader(_))));
        assert!(matches!(
            decode_all(b"MSG 2147483648 0 . 0 0\r\nEND\r\n"),
            Err(DecodeError::OutOfRange { field: "channel", .. })
        ));
        assert_eq!(decode_all(&[b'M'; 120]), Err(DecodeError::HeaderTooLong(MAX_HEADER_LEN)));
    }

    #[test]
    fn test_size_limit() {
        let mut d = FrameDecoder::with_max_payload(8);
        d.feed(b"MSG 1 0 . 0 9\r\n");
        assert!(matches!(d.decode(), Err(DecodeError::OutOfRange { field: "size", value: 9 })));
    }

    #[test]
    fn test_encode_matches_wire_format() {
        assert_eq!(encode_data(FrameKind::Nul, 3, 1, false, 77, b""), b"NUL 3 1 . 77 0\r\nEND\r\n");
        assert_eq!(
            encode_data(FrameKind::Ans { ansno: 2 }, 3, 1, true, 0, b"x"),
            b"ANS 3 1 * 0 1 2\r\nxEND\r\n"
        );
        assert_eq!(encode_seq(&SeqFrame { channel: 0, ackno: 52, window: 4096 }), b"SEQ 0 52 4096\r\n");
    }
}
