//! Relay wire protocol.
//!
//! ```text
//! Client -> Server (first):      <name>\n
//! Client -> Server (subsequent): <destination> <body>\n
//! Client -> Server (disconnect): <space>
//! Server -> Client:              <sender>\n<body>\n
//! ```
//!
//! The parser is incremental: it looks at whatever a connection has buffered
//! so far and either consumes exactly one complete unit, asks for more data,
//! or reports a violation. Nothing is consumed unless a unit is complete.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Longest allowed user name, in bytes, excluding the delimiter.
pub const MAX_NAME_LEN: usize = 255;

/// Which unit a connection is expected to send next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Waiting for `<name>\n`.
    Unregistered,
    /// Registered; waiting for `<destination> <body>\n`.
    Ready,
}

/// A complete protocol unit taken off a connection's buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Registration of a user name.
    Register { name: Bytes },
    /// Message addressed to another user.
    Message { destination: Bytes, body: Bytes },
    /// Empty destination: the client is leaving.
    Disconnect,
}

/// Protocol violations. Each one ends the offending connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Registration line with nothing before the newline.
    EmptyName,
    /// Name or destination longer than `MAX_NAME_LEN`.
    NameTooLong,
    /// Newline reached before the destination's terminating space.
    MissingBody,
    /// Buffered bytes reached the frame limit without a complete unit.
    FrameTooLarge { limit: usize },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::EmptyName => write!(f, "empty user name"),
            ProtocolError::NameTooLong => {
                write!(f, "user name exceeds {MAX_NAME_LEN} bytes")
            }
            ProtocolError::MissingBody => write!(f, "message without destination delimiter"),
            ProtocolError::FrameTooLarge { limit } => {
                write!(f, "frame exceeds {limit} bytes")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// One unit was consumed from the buffer.
    Complete(Frame),
    /// Not enough data yet; the buffer is untouched.
    Incomplete,
    /// The buffered bytes can never form a valid unit.
    Error(ProtocolError),
}

/// Take at most one unit off the front of `buf`.
///
/// `max_frame_size` bounds READY units (destination, space, body and
/// newline together). Registrations are bounded by `MAX_NAME_LEN`.
pub fn parse(state: ParseState, buf: &mut BytesMut, max_frame_size: usize) -> ParseResult {
    match state {
        ParseState::Unregistered => parse_registration(buf),
        ParseState::Ready => parse_message(buf, max_frame_size),
    }
}

fn parse_registration(buf: &mut BytesMut) -> ParseResult {
    match find_byte(buf, b'\n', MAX_NAME_LEN + 1) {
        Some(0) => ParseResult::Error(ProtocolError::EmptyName),
        Some(end) => {
            let name = buf.split_to(end).freeze();
            buf.advance(1);
            ParseResult::Complete(Frame::Register { name })
        }
        None if buf.len() > MAX_NAME_LEN => ParseResult::Error(ProtocolError::NameTooLong),
        None => ParseResult::Incomplete,
    }
}

fn parse_message(buf: &mut BytesMut, max_frame_size: usize) -> ParseResult {
    if buf.first() == Some(&b' ') {
        buf.advance(1);
        return ParseResult::Complete(Frame::Disconnect);
    }

    let dest_end = match buf
        .iter()
        .take(MAX_NAME_LEN + 1)
        .position(|&b| b == b' ' || b == b'\n')
    {
        Some(pos) if buf[pos] == b'\n' => return ParseResult::Error(ProtocolError::MissingBody),
        Some(pos) => pos,
        None if buf.len() > MAX_NAME_LEN => {
            return ParseResult::Error(ProtocolError::NameTooLong)
        }
        None => return ParseResult::Incomplete,
    };

    let body_start = dest_end + 1;
    let body_len = match find_byte(&buf[body_start..], b'\n', usize::MAX) {
        Some(len) => len,
        None if buf.len() >= max_frame_size => {
            return ParseResult::Error(ProtocolError::FrameTooLarge {
                limit: max_frame_size,
            })
        }
        None => return ParseResult::Incomplete,
    };

    if body_start + body_len + 1 > max_frame_size {
        return ParseResult::Error(ProtocolError::FrameTooLarge {
            limit: max_frame_size,
        });
    }

    let destination = buf.split_to(dest_end).freeze();
    buf.advance(1);
    let body = buf.split_to(body_len).freeze();
    buf.advance(1);

    ParseResult::Complete(Frame::Message { destination, body })
}

/// Position of `needle` within the first `limit` bytes of `haystack`.
fn find_byte(haystack: &[u8], needle: u8, limit: usize) -> Option<usize> {
    haystack.iter().take(limit).position(|&b| b == needle)
}

/// Encode a registration line.
pub fn encode_registration(name: &[u8], out: &mut BytesMut) {
    out.reserve(name.len() + 1);
    out.put_slice(name);
    out.put_u8(b'\n');
}

/// Encode a client message addressed to `destination`.
pub fn encode_message(destination: &[u8], body: &[u8], out: &mut BytesMut) {
    out.reserve(destination.len() + body.len() + 2);
    out.put_slice(destination);
    out.put_u8(b' ');
    out.put_slice(body);
    out.put_u8(b'\n');
}

/// Encode the frame delivered to a recipient.
pub fn encode_delivery(sender: &[u8], body: &[u8], out: &mut BytesMut) {
    out.reserve(sender.len() + body.len() + 2);
    out.put_slice(sender);
    out.put_u8(b'\n');
    out.put_slice(body);
    out.put_u8(b'\n');
}

/// Length of the delivery frame for `sender` and `body`.
pub fn delivery_len(sender: &[u8], body: &[u8]) -> usize {
    sender.len() + body.len() + 2
}
