//! RESP encoding and frame parsing (component C1 of the design spec).
//!
//! Only the subset of RESP this server speaks is modeled: simple strings,
//! errors, integers, bulk strings (including the null bulk string), arrays,
//! and an unterminated binary blob (`File`) used for the RDB transfer.

use std::fmt::Display;

use tracing::warn;

use crate::error::{RedisError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Resp {
    Simple(String),
    Error(String),
    Int(i64),
    Bulk(String),
    Null,
    Array(Vec<Resp>),
    /// `$<len>\r\n<bytes>` with NO trailing `\r\n` — the RDB snapshot payload.
    File(Vec<u8>),
}

impl Resp {
    pub fn bulk(s: impl Into<String>) -> Resp {
        Resp::Bulk(s.into())
    }

    pub fn ok() -> Resp {
        Resp::Simple("OK".to_string())
    }

    pub fn array_of_bulks<I, S>(items: I) -> Resp
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Resp::Array(items.into_iter().map(|s| Resp::Bulk(s.into())).collect())
    }

    /// Serialize to wire bytes. This is the only encoding path; simple-string
    /// and error replies are constructed directly by command handlers rather
    /// than derived from some other representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Resp::Simple(s) => {
                buf.push(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Resp::Error(s) => {
                buf.push(b'-');
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            // the leading `+` is kept verbatim to match the source's observable output
            Resp::Int(n) => {
                buf.extend_from_slice(format!(":+{}\r\n", n).as_bytes());
            }
            Resp::Bulk(s) => {
                buf.extend_from_slice(format!("${}\r\n", s.len()).as_bytes());
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Resp::Null => {
                buf.extend_from_slice(b"$-1\r\n");
            }
            Resp::Array(items) => {
                buf.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode_into(buf);
                }
            }
            Resp::File(bytes) => {
                buf.extend_from_slice(format!("${}\r\n", bytes.len()).as_bytes());
                buf.extend_from_slice(bytes);
            }
        }
    }
}

impl Display for Resp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resp::Simple(s) => write!(f, "{}", s),
            Resp::Error(s) => write!(f, "-{}", s),
            Resp::Int(n) => write!(f, "{}", n),
            Resp::Bulk(s) => write!(f, "{}", s),
            Resp::Null => write!(f, "(nil)"),
            Resp::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Resp::File(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

/// One complete command frame: its argv and the number of bytes it occupied
/// in the input buffer. `consumed` is semantically significant — replicas
/// feed it directly into their replication offset.
#[derive(Debug, Clone)]
pub struct Frame {
    pub argv: Vec<String>,
    pub consumed: usize,
}

/// Parse as many complete `*N\r\n$L\r\n<bytes>\r\n...` frames as `buf` holds.
/// Does not require the buffer to end on a frame boundary: the trailing
/// incomplete frame, if any, is simply not returned, and its bytes remain
/// unconsumed for the caller to retry once more data arrives.
pub fn parse_frames(buf: &[u8]) -> Result<Vec<Frame>> {
    let mut frames = Vec::new();
    let mut pos = 0;
    loop {
        match parse_one_frame(&buf[pos..])? {
            Some((argv, consumed)) => {
                pos += consumed;
                frames.push(Frame { argv, consumed });
            }
            None => break,
        }
    }
    Ok(frames)
}

/// Returns `Ok(None)` if `buf` does not yet contain a complete frame.
fn parse_one_frame(buf: &[u8]) -> Result<Option<(Vec<String>, usize)>> {
    let mut cursor = 0;

    let (header_line, header_len) = match read_line(&buf[cursor..]) {
        Some(v) => v,
        None => return Ok(None),
    };
    if header_line.first() != Some(&b'*') {
        warn!(line = %String::from_utf8_lossy(header_line), "malformed array header");
        return Err(RedisError::Protocol(format!(
            "expected array header, got {:?}",
            String::from_utf8_lossy(header_line)
        )));
    }
    let count: usize = std::str::from_utf8(&header_line[1..])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| RedisError::Protocol("invalid array length".to_string()))?;
    cursor += header_len;

    let mut argv = Vec::with_capacity(count);
    for _ in 0..count {
        let (bulk_line, bulk_len) = match read_line(&buf[cursor..]) {
            Some(v) => v,
            None => return Ok(None),
        };
        if bulk_line.first() != Some(&b'$') {
            warn!(line = %String::from_utf8_lossy(bulk_line), "malformed bulk string header");
            return Err(RedisError::Protocol(format!(
                "expected bulk string header, got {:?}",
                String::from_utf8_lossy(bulk_line)
            )));
        }
        let len: usize = std::str::from_utf8(&bulk_line[1..])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| RedisError::Protocol("invalid bulk length".to_string()))?;
        cursor += bulk_len;

        if buf.len() < cursor + len + 2 {
            return Ok(None);
        }
        let data = &buf[cursor..cursor + len];
        if &buf[cursor + len..cursor + len + 2] != b"\r\n" {
            return Err(RedisError::Protocol("missing bulk string terminator".to_string()));
        }
        let s = String::from_utf8(data.to_vec())
            .map_err(|_| RedisError::Protocol("bulk string is not valid utf-8".to_string()))?;
        argv.push(s);
        cursor += len + 2;
    }

    Ok(Some((argv, cursor)))
}

/// Read up to and including the next `\r\n`, returning the line without the
/// terminator and the total number of bytes (line + terminator) consumed.
fn read_line(buf: &[u8]) -> Option<(&[u8], usize)> {
    let idx = buf.windows(2).position(|w| w == b"\r\n")?;
    Some((&buf[..idx], idx + 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_simple_and_bulk_and_array() {
        assert_eq!(Resp::Simple("PONG".into()).encode(), b"+PONG\r\n");
        assert_eq!(Resp::Bulk("hi".into()).encode(), b"$2\r\nhi\r\n");
        assert_eq!(Resp::Null.encode(), b"$-1\r\n");
        assert_eq!(
            Resp::Array(vec![Resp::Bulk("a".into()), Resp::Bulk("bc".into())]).encode(),
            b"*2\r\n$1\r\na\r\n$2\r\nbc\r\n"
        );
        assert_eq!(Resp::Int(7).encode(), b":+7\r\n");
    }

    #[test]
    fn parses_single_frame() {
        let buf = b"*1\r\n$4\r\nPING\r\n";
        let frames = parse_frames(buf).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].argv, vec!["PING".to_string()]);
        assert_eq!(frames[0].consumed, buf.len());
    }

    #[test]
    fn parses_coalesced_frames_and_reports_consumed_sum() {
        let buf = b"*1\r\n$4\r\nPING\r\n*2\r\n$4\r\nECHO\r\n$2\r\nhi\r\n";
        let frames = parse_frames(buf).unwrap();
        assert_eq!(frames.len(), 2);
        let total: usize = frames.iter().map(|f| f.consumed).sum();
        assert_eq!(total, buf.len());
    }

    #[test]
    fn leaves_partial_trailing_frame_unconsumed() {
        let buf = b"*1\r\n$4\r\nPING\r\n*2\r\n$4\r\nECHO\r\n$5\r\nhel";
        let frames = parse_frames(buf).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].consumed, 14);
    }

    #[test]
    fn rejects_malformed_header() {
        let buf = b"not-a-frame\r\n";
        assert!(parse_frames(buf).is_err());
    }
}
