//! Minimal RESP2 framing: command encoding and reply decoding.
//!
//! Only what the connection itself needs to speak: multi-bulk commands in
//! both directions and the five RESP2 reply types.

use crate::error::{ShmResult, TransportError};
use std::fmt;

/// Upper bound on a bulk string or array length accepted from the wire.
pub const MAX_BULK_LEN: i64 = 8 * 1024 * 1024;

/// Deepest array nesting accepted from the wire.
pub const MAX_NESTING: usize = 32;

/// Outcome of decoding the front of a receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T> {
    /// A full frame and the number of bytes it used
    Complete(T, usize),
    /// Not enough input; decoding cannot progress before the buffer holds
    /// at least `wanted` bytes
    Partial {
        /// Minimum buffer length worth retrying at
        wanted: usize,
    },
}

impl<T> Decoded<T> {
    fn complete(self) -> Option<(T, usize)> {
        match self {
            Decoded::Complete(value, used) => Some((value, used)),
            Decoded::Partial { .. } => None,
        }
    }
}

/// A decoded RESP2 reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+OK`
    Status(String),
    /// `-ERR ...`
    Error(String),
    /// `:1`
    Integer(i64),
    /// `$3\r\nfoo`, or `$-1` for nil
    Bulk(Option<Vec<u8>>),
    /// `*2\r\n...`, or `*-1` for nil
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// Serialize the reply in wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Reply::Status(s) => push_line(out, b'+', s.as_bytes()),
            Reply::Error(s) => push_line(out, b'-', s.as_bytes()),
            Reply::Integer(n) => push_line(out, b':', n.to_string().as_bytes()),
            Reply::Bulk(None) => out.extend_from_slice(b"$-1\r\n"),
            Reply::Bulk(Some(data)) => push_bulk(out, data),
            Reply::Array(None) => out.extend_from_slice(b"*-1\r\n"),
            Reply::Array(Some(items)) => {
                push_line(out, b'*', items.len().to_string().as_bytes());
                for item in items {
                    item.encode_into(out);
                }
            }
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status(s) => write!(f, "status '{s}'"),
            Reply::Error(s) => write!(f, "error '{s}'"),
            Reply::Integer(n) => write!(f, "integer {n}"),
            Reply::Bulk(None) => write!(f, "nil bulk"),
            Reply::Bulk(Some(data)) => write!(f, "bulk '{}'", String::from_utf8_lossy(data)),
            Reply::Array(None) => write!(f, "nil array"),
            Reply::Array(Some(items)) => write!(f, "array of {}", items.len()),
        }
    }
}

/// Encode a command as a RESP multi-bulk request.
pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    push_line(&mut out, b'*', args.len().to_string().as_bytes());
    for arg in args {
        push_bulk(&mut out, arg);
    }
    out
}

/// Decode one reply from the front of `buf`.
///
/// Returns `Ok(None)` while the buffer holds an incomplete reply, and
/// `Ok(Some((reply, consumed)))` once a full reply is available.
pub fn parse_reply(buf: &[u8]) -> ShmResult<Option<(Reply, usize)>> {
    decode_reply(buf).map(Decoded::complete)
}

/// Decode one multi-bulk command (array of bulk strings) from `buf`.
pub fn parse_command(buf: &[u8]) -> ShmResult<Option<(Vec<Vec<u8>>, usize)>> {
    decode_command(buf).map(Decoded::complete)
}

/// Like [`parse_reply`], but an incomplete reply reports how much input
/// it needs at least.
pub fn decode_reply(buf: &[u8]) -> ShmResult<Decoded<Reply>> {
    parse_at(buf, 0, 0)
}

/// Like [`parse_command`], but an incomplete command reports how much
/// input it needs at least.
pub fn decode_command(buf: &[u8]) -> ShmResult<Decoded<Vec<Vec<u8>>>> {
    let (reply, consumed) = match parse_at(buf, 0, 0)? {
        Decoded::Complete(reply, consumed) => (reply, consumed),
        Decoded::Partial { wanted } => return Ok(Decoded::Partial { wanted }),
    };
    let Reply::Array(Some(items)) = reply else {
        return Err(TransportError::Protocol(format!(
            "expected multi-bulk command, got {reply}"
        )));
    };

    let mut args = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Reply::Bulk(Some(data)) => args.push(data),
            other => {
                return Err(TransportError::Protocol(format!(
                    "expected bulk argument, got {other}"
                )));
            }
        }
    }
    Ok(Decoded::Complete(args, consumed))
}

fn push_line(out: &mut Vec<u8>, prefix: u8, body: &[u8]) {
    out.push(prefix);
    out.extend_from_slice(body);
    out.extend_from_slice(b"\r\n");
}

fn push_bulk(out: &mut Vec<u8>, data: &[u8]) {
    push_line(out, b'$', data.len().to_string().as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Index just past the `\r\n` ending the line that starts at `start`.
fn line_end(buf: &[u8], start: usize) -> Option<(usize, usize)> {
    buf[start..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|offset| (start + offset, start + offset + 2))
}

fn parse_int(line: &[u8]) -> ShmResult<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            TransportError::Protocol(format!(
                "invalid integer '{}'",
                String::from_utf8_lossy(line)
            ))
        })
}

fn parse_at(buf: &[u8], start: usize, depth: usize) -> ShmResult<Decoded<Reply>> {
    // An unterminated line needs at least one more byte.
    let partial = Decoded::Partial {
        wanted: buf.len() + 1,
    };
    if start >= buf.len() {
        return Ok(partial);
    }
    let Some((eol, next)) = line_end(buf, start + 1) else {
        return Ok(partial);
    };
    let line = &buf[start + 1..eol];

    let reply = match buf[start] {
        b'+' => Reply::Status(String::from_utf8_lossy(line).into_owned()),
        b'-' => Reply::Error(String::from_utf8_lossy(line).into_owned()),
        b':' => Reply::Integer(parse_int(line)?),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Decoded::Complete(Reply::Bulk(None), next));
            }
            if len > MAX_BULK_LEN {
                return Err(TransportError::Protocol(format!("bulk length {len} too large")));
            }
            let end = next + len as usize;
            if buf.len() < end + 2 {
                return Ok(Decoded::Partial { wanted: end + 2 });
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(TransportError::Protocol("bulk not terminated by CRLF".into()));
            }
            return Ok(Decoded::Complete(
                Reply::Bulk(Some(buf[next..end].to_vec())),
                end + 2,
            ));
        }
        b'*' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Decoded::Complete(Reply::Array(None), next));
            }
            if len > MAX_BULK_LEN {
                return Err(TransportError::Protocol(format!("array length {len} too large")));
            }
            if depth >= MAX_NESTING {
                return Err(TransportError::Protocol(format!(
                    "arrays nested deeper than {MAX_NESTING}"
                )));
            }
            let mut items = Vec::with_capacity((len as usize).min(64));
            let mut pos = next;
            for _ in 0..len {
                match parse_at(buf, pos, depth + 1)? {
                    Decoded::Complete(item, after) => {
                        items.push(item);
                        pos = after;
                    }
                    partial => return Ok(partial),
                }
            }
            return Ok(Decoded::Complete(Reply::Array(Some(items)), pos));
        }
        other => {
            return Err(TransportError::Protocol(format!(
                "unexpected reply type byte {other:#04x}"
            )));
        }
    };
    Ok(Decoded::Complete(reply, next))
}
