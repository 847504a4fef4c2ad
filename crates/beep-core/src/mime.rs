//! MIME header block parsing
//!
//! BEEP payloads start with an RFC 2045 style header block terminated by
//! an empty line. A payload starting with the empty line carries no
//! headers and defaults apply.

use thiserror::Error;

use crate::constants::{DEFAULT_MIME_TYPE, DEFAULT_TRANSFER_ENCODING};

/// Longest header line accepted, CRLF excluded
const MAX_LINE: usize = 995;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MimeError {
    #[error("no empty line terminating the MIME header block")]
    Unterminated,

    #[error("invalid octet {0:#04x} in header name")]
    InvalidNameChar(u8),

    #[error("empty header name")]
    EmptyName,

    #[error("header line exceeds {MAX_LINE} octets")]
    LineTooLong,
}

/// Parsed header block, in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MimeHeaders {
    headers: Vec<(String, String)>,
}

impl MimeHeaders {
    /// Parse the header block at the start of `payload`.
    ///
    /// Returns the headers and the number of octets the block occupies,
    /// terminating empty line included.
    pub fn parse(payload: &[u8]) -> Result<(MimeHeaders, usize), MimeError> {
        let mut headers: Vec<(String, String)> = Vec::new();
        let mut pos = 0;

        loop {
            // Empty line ends the block
            if let Some(n) = line_break_at(payload, pos) {
                return Ok((MimeHeaders { headers }, pos + n));
            }
            if pos >= payload.len() {
                return Err(MimeError::Unterminated);
            }

            // Continuation of the previous header value
            if payload[pos] == b' ' || payload[pos] == b'\t' {
                let (line, next) = read_line(payload, pos)?;
                match headers.last_mut() {
                    Some((_, value)) => {
                        value.push(' ');
                        value.push_str(line.trim());
                    }
                    None => return Err(MimeError::EmptyName),
                }
                pos = next;
                continue;
            }

            let (line, next) = read_line(payload, pos)?;
            let colon = line.find(':').ok_or(MimeError::Unterminated)?;
            let name = &line[..colon];
            if name.is_empty() {
                return Err(MimeError::EmptyName);
            }
            if let Some(&bad) = name.as_bytes().iter().find(|b| !(33..=126).contains(*b)) {
                return Err(MimeError::InvalidNameChar(bad));
            }
            headers.push((name.to_string(), line[colon + 1..].trim().to_string()));
            pos = next;
        }
    }

    /// Case-insensitive lookup of the first header named `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> &str {
        self.get("Content-Type").unwrap_or(DEFAULT_MIME_TYPE)
    }

    pub fn transfer_encoding(&self) -> &str {
        self.get("Content-Transfer-Encoding").unwrap_or(DEFAULT_TRANSFER_ENCODING)
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Header block announcing `mime_type` and `encoding`.
    ///
    /// Defaults are omitted, so two defaults produce just the empty line.
    pub fn encode_block(mime_type: &str, encoding: &str) -> Vec<u8> {
        let mut out = Vec::new();
        if !mime_type.is_empty() && mime_type != DEFAULT_MIME_TYPE {
            out.extend_from_slice(b"Content-Type: ");
            out.extend_from_slice(mime_type.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if !encoding.is_empty() && encoding != DEFAULT_TRANSFER_ENCODING {
            out.extend_from_slice(b"Content-Transfer-Encoding: ");
            out.extend_from_slice(encoding.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Length of the line break at `pos` (2 for CRLF, 1 for bare LF).
fn line_break_at(buf: &[u8], pos: usize) -> Option<usize> {
    match buf.get(pos..) {
        Some([b'\r', b'\n', ..]) => Some(2),
        Some([b'\n', ..]) => Some(1),
        _ => None,
    }
}

/// One header line starting at `pos`, and the offset after its line break.
fn read_line(buf: &[u8], pos: usize) -> Result<(String, usize), MimeError> {
    let rest = &buf[pos..];
    let end = rest.iter().position(|&b| b == b'\n').ok_or(MimeError::Unterminated)?;
    let mut line = &rest[..end];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    if line.len() > MAX_LINE {
        return Err(MimeError::LineTooLong);
    }
    Ok((String::from_utf8_lossy(line).into_owned(), pos + end + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_block() {
        let (h, off) = MimeHeaders::parse(b"\r\nhello").unwrap();
        assert!(h.is_empty());
        assert_eq!(off, 2);
        assert_eq!(h.content_type(), "application/octet-stream");
        assert_eq!(h.transfer_encoding(), "binary");
    }

    #[test]
    fn test_headers_and_offset() {
        let p = b"Content-Type: application/beep+xml\r\nContent-Transfer-Encoding: base64\r\n\r\n<ok />";
        let (h, off) = MimeHeaders::parse(p).unwrap();
        assert_eq!(h.len(), 2);
        assert_eq!(h.content_type(), "application/beep+xml");
        assert_eq!(h.transfer_encoding(), "base64");
        assert_eq!(&p[off..], b"<ok />");
    }

    #[test]
    fn test_folded_value() {
        let p = b"X-Long: first\r\n  second\r\n\r\n";
        let (h, off) = MimeHeaders::parse(p).unwrap();
        assert_eq!(h.get("x-long"), Some("first second"));
        assert_eq!(off, p.len());
    }

    #[test]
    fn test_no_block_fails() {
        assert_eq!(MimeHeaders::parse(b"hi"), Err(MimeError::Unterminated));
        assert_eq!(MimeHeaders::parse(b""), Err(MimeError::Unterminated));
        assert_eq!(MimeHeaders::parse(b"A: b\r\n"), Err(MimeError::Unterminated));
    }

    #[test]
    fn test_bad_name() {
        assert_eq!(MimeHeaders::parse(b"Bad Name: x\r\n\r\n"), Err(MimeError::InvalidNameChar(b' ')));
        assert_eq!(MimeHeaders::parse(b": x\r\n\r\n"), Err(MimeError::EmptyName));
    }

    #[test]
    fn test_line_too_long() {
        let mut p = b"X: ".to_vec();
        p.extend(std::iter::repeat(b'a').take(1000));
        p.extend_from_slice(b"\r\n\r\n");
        assert_eq!(MimeHeaders::parse(&p), Err(MimeError::LineTooLong));
    }

    #[test]
    fn test_encode_block() {
        assert_eq!(MimeHeaders::encode_block("application/octet-stream", "binary"), b"\r\n");
        let block = MimeHeaders::encode_block("text/plain", "binary");
        assert_eq!(block, b"Content-Type: text/plain\r\n\r\n");
        let (h, off) = MimeHeaders::parse(&block).unwrap();
        assert_eq!(h.content_type(), "text/plain");
        assert_eq!(off, block.len());
    }
}
