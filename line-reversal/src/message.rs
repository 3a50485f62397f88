//! Wire-format definitions for LRCP messages.
//!
//! Every datagram exchanged between peers is a single [`Message`].  This
//! module is responsible for:
//! - Defining the four message kinds and their fields.
//! - Serialising a [`Message`] into the textual wire form.
//! - Parsing a raw datagram back into a [`Message`], returning a
//!   [`ParseError`] that names the first rule the input broke.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! Messages are ASCII, delimited by `/` at both ends and between fields:
//!
//! ```text
//! /connect/SESSION/
//! /data/SESSION/POS/DATA/
//! /ack/SESSION/LENGTH/
//! /close/SESSION/
//! ```
//!
//! `SESSION`, `POS` and `LENGTH` are decimal integers in
//! `0..=`[`MAX_NUMERIC`].  Inside `DATA`, the bytes `/` and `\` are escaped
//! with a preceding `\`.  A whole message is always shorter than
//! [`MAX_MESSAGE_LEN`] bytes.

use std::fmt;

use thiserror::Error;

/// Exclusive upper bound on the size of a serialised message.
pub const MAX_MESSAGE_LEN: usize = 1000;

/// Largest value a numeric field may carry (`2^31 - 1`).
pub const MAX_NUMERIC: u32 = 2_147_483_647;

const DELIMITER: u8 = b'/';
const ESCAPE: u8 = b'\\';

/// The four message kinds, identified on the wire by their lowercase token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Connect,
    Data,
    Ack,
    Close,
}

impl Kind {
    /// The exact token used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Connect => "connect",
            Kind::Data => "data",
            Kind::Ack => "ack",
            Kind::Close => "close",
        }
    }

    fn from_token(token: &[u8]) -> Option<Self> {
        match token {
            b"connect" => Some(Kind::Connect),
            b"data" => Some(Kind::Data),
            b"ack" => Some(Kind::Ack),
            b"close" => Some(Kind::Close),
            _ => None,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded LRCP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Open a session (or re-request the opening ack).
    Connect { session: u32 },
    /// Payload bytes starting at stream offset `pos`, already unescaped.
    Data { session: u32, pos: u32, data: Vec<u8> },
    /// The peer has received `length` contiguous bytes of the stream.
    Ack { session: u32, length: u32 },
    /// Tear the session down.
    Close { session: u32 },
}

impl Message {
    pub fn kind(&self) -> Kind {
        match self {
            Message::Connect { .. } => Kind::Connect,
            Message::Data { .. } => Kind::Data,
            Message::Ack { .. } => Kind::Ack,
            Message::Close { .. } => Kind::Close,
        }
    }

    /// Session id carried by every message kind.
    pub fn session(&self) -> u32 {
        match *self {
            Message::Connect { session }
            | Message::Data { session, .. }
            | Message::Ack { session, .. }
            | Message::Close { session } => session,
        }
    }

    /// Serialise this message into a newly allocated byte vector.
    ///
    /// Only the fields relevant to the kind are emitted; Data payloads are
    /// escaped.  The caller is responsible for keeping Data payloads small
    /// enough that the result stays under [`MAX_MESSAGE_LEN`].
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::Connect { session } | Message::Close { session } => {
                format!("/{}/{}/", self.kind(), session).into_bytes()
            }
            Message::Ack { session, length } => {
                format!("/{}/{}/{}/", self.kind(), session, length).into_bytes()
            }
            Message::Data { session, pos, data } => {
                let mut buf = format!("/{}/{}/{}/", self.kind(), session, pos).into_bytes();
                buf.reserve(escaped_len(data) + 1);
                for &b in data {
                    if needs_escape(b) {
                        buf.push(ESCAPE);
                    }
                    buf.push(b);
                }
                buf.push(DELIMITER);
                buf
            }
        }
    }

    /// Parse a [`Message`] from a raw datagram.
    ///
    /// Returns [`Err`] if the datagram is empty or too long, is not framed by
    /// `/`, carries an unknown kind, has a malformed or out-of-range numeric
    /// field, has a bad Data payload, or carries bytes past the final `/`.
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() >= MAX_MESSAGE_LEN {
            return Err(ParseError::TooLong(buf.len()));
        }
        if buf.is_empty() {
            return Err(ParseError::Empty);
        }
        if buf[0] != DELIMITER || buf[buf.len() - 1] != DELIMITER {
            return Err(ParseError::NotFramed);
        }

        let mut cursor = Cursor { buf, pos: 1 };
        let kind = cursor.kind()?;
        let session = cursor.numeric()?;

        let msg = match kind {
            Kind::Connect => Message::Connect { session },
            Kind::Close => Message::Close { session },
            Kind::Ack => {
                let length = cursor.numeric()?;
                Message::Ack { session, length }
            }
            Kind::Data => {
                let pos = cursor.numeric()?;
                let data = cursor.escaped()?;
                Message::Data { session, pos, data }
            }
        };

        cursor.finish()?;
        Ok(msg)
    }
}

/// `true` for payload bytes that travel with a leading `\`.
pub fn needs_escape(b: u8) -> bool {
    b == DELIMITER || b == ESCAPE
}

/// Number of bytes `data` occupies on the wire once escaped.
pub fn escaped_len(data: &[u8]) -> usize {
    data.len() + data.iter().filter(|&&b| needs_escape(b)).count()
}

/// Errors that can arise when parsing a raw datagram.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
    #[error("message of {0} bytes exceeds the size limit")]
    TooLong(usize),
    #[error("message does not start and end with '/'")]
    NotFramed,
    #[error("unknown message type")]
    UnknownKind,
    #[error("numeric field is empty or not a number")]
    MissingNumber,
    #[error("numeric field exceeds 2147483647")]
    NumberTooLarge,
    #[error("numeric field is not followed by '/'")]
    UnterminatedField,
    #[error("unescaped '/' inside data payload")]
    UnescapedDelimiter,
    #[error("invalid escape sequence: '\\' followed by byte {0:#04x}")]
    InvalidEscape(u8),
    #[error("data payload is missing its terminating '/'")]
    UnterminatedData,
    #[error("unexpected trailing bytes after the last field")]
    TrailingBytes,
}

/// Forward-only reader over a framed datagram.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    /// Read the kind token and consume its terminating `/`.
    fn kind(&mut self) -> Result<Kind, ParseError> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == DELIMITER)
            .ok_or(ParseError::UnknownKind)?;
        let kind = Kind::from_token(&rest[..end]).ok_or(ParseError::UnknownKind)?;
        self.pos += end + 1;
        Ok(kind)
    }

    /// Read a decimal field and consume its terminating `/`.
    fn numeric(&mut self) -> Result<u32, ParseError> {
        let mut value: u32 = 0;
        let mut digits = 0;
        while let Some(&b) = self.buf.get(self.pos) {
            if !b.is_ascii_digit() {
                break;
            }
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add(u32::from(b - b'0')))
                .filter(|&v| v <= MAX_NUMERIC)
                .ok_or(ParseError::NumberTooLarge)?;
            digits += 1;
            self.pos += 1;
        }
        if digits == 0 {
            return Err(ParseError::MissingNumber);
        }
        if self.buf.get(self.pos) != Some(&DELIMITER) {
            return Err(ParseError::UnterminatedField);
        }
        self.pos += 1;
        Ok(value)
    }

    /// Unescape everything up to the final `/`, which is consumed.
    fn escaped(&mut self) -> Result<Vec<u8>, ParseError> {
        // The framing check guarantees the last byte is the terminator.
        let end = self.buf.len() - 1;
        if self.pos > end {
            return Err(ParseError::UnterminatedData);
        }
        let body = &self.buf[self.pos..end];

        let mut data = Vec::with_capacity(body.len());
        let mut escaped = false;
        for &b in body {
            if escaped {
                if b != DELIMITER && b != ESCAPE {
                    return Err(ParseError::InvalidEscape(b));
                }
                data.push(b);
                escaped = false;
            } else if b == ESCAPE {
                escaped = true;
            } else if b == DELIMITER {
                return Err(ParseError::UnescapedDelimiter);
            } else {
                data.push(b);
            }
        }
        // A trailing `\` escapes the final `/`, leaving the payload open.
        if escaped {
            return Err(ParseError::UnterminatedData);
        }
        self.pos = self.buf.len();
        Ok(data)
    }

    fn finish(&self) -> Result<(), ParseError> {
        if self.pos != self.buf.len() {
            return Err(ParseError::TrailingBytes);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(s: &str) -> Result<Message, ParseError> {
        Message::decode(s.as_bytes())
    }

    fn data(session: u32, pos: u32, payload: &[u8]) -> Message {
        Message::Data {
            session,
            pos,
            data: payload.to_vec(),
        }
    }

    #[test]
    fn parses_data_message() {
        assert_eq!(
            decode("/data/123456/810/hello this/"),
            Ok(data(123456, 810, b"hello this"))
        );
    }

    #[test]
    fn parses_control_messages() {
        assert_eq!(
            decode("/connect/2147483647/"),
            Ok(Message::Connect { session: 2147483647 })
        );
        assert_eq!(decode("/close/0/"), Ok(Message::Close { session: 0 }));
        assert_eq!(
            decode("/ack/123456/789/"),
            Ok(Message::Ack {
                session: 123456,
                length: 789
            })
        );
        assert_eq!(
            decode("/ack/2147483647/2147483647/"),
            Ok(Message::Ack {
                session: 2147483647,
                length: 2147483647
            })
        );
    }

    #[test]
    fn parses_empty_and_escaped_payloads() {
        assert_eq!(decode("/data/123456/810//"), Ok(data(123456, 810, b"")));
        assert_eq!(decode("/data/1/0/h\n/"), Ok(data(1, 0, b"h\n")));
        assert_eq!(
            decode(r"/data/123456/810/foo\/bar\\baz/"),
            Ok(data(123456, 810, br"foo/bar\baz"))
        );
        assert_eq!(decode(r"/data/0/0/\\\/\\\/\\\//"), Ok(data(0, 0, br"\/\/\/")));
        assert_eq!(
            decode(r"/data/100/50/test\\message\\/"),
            Ok(data(100, 50, br"test\message\"))
        );
    }

    #[test]
    fn rejects_bad_framing() {
        assert_eq!(decode(""), Err(ParseError::Empty));
        assert_eq!(decode("connect/1/"), Err(ParseError::NotFramed));
        assert_eq!(decode("/connect/1"), Err(ParseError::NotFramed));
        assert_eq!(decode("/"), Err(ParseError::UnknownKind));
        assert_eq!(decode("///connect///"), Err(ParseError::UnknownKind));
        assert_eq!(decode("/CONNECT/1/"), Err(ParseError::UnknownKind));
        assert_eq!(decode("/reset/1/"), Err(ParseError::UnknownKind));
    }

    #[test]
    fn rejects_bad_numbers() {
        assert_eq!(decode("/connect//"), Err(ParseError::MissingNumber));
        assert_eq!(decode("/connect/xyz/"), Err(ParseError::MissingNumber));
        assert_eq!(decode("/connect/-13/"), Err(ParseError::MissingNumber));
        assert_eq!(decode("/connect/33.151/"), Err(ParseError::UnterminatedField));
        assert_eq!(decode("/connect/2147483648/"), Err(ParseError::NumberTooLarge));
        assert_eq!(
            decode("/connect/99999999999999999999999/"),
            Err(ParseError::NumberTooLarge)
        );
        assert_eq!(decode("/ack/2147483647/"), Err(ParseError::MissingNumber));
        assert_eq!(decode("/ack/123456//181/"), Err(ParseError::MissingNumber));
        assert_eq!(decode("/ack/123456/-181/"), Err(ParseError::MissingNumber));
        assert_eq!(decode("/ack/1/2147483648/"), Err(ParseError::NumberTooLarge));
    }

    #[test]
    fn rejects_bad_payloads() {
        assert_eq!(
            decode("/data/1413578440/520/illegal data/has too many/parts/"),
            Err(ParseError::UnescapedDelimiter)
        );
        assert_eq!(
            decode(r"/data/123/456/invalid\x/"),
            Err(ParseError::InvalidEscape(b'x'))
        );
        assert_eq!(
            decode(r"/data/123/456/invalid\n/"),
            Err(ParseError::InvalidEscape(b'n'))
        );
        assert_eq!(decode(r"/data/1/0/abc\/"), Err(ParseError::UnterminatedData));
        assert_eq!(decode("/data/1/0/"), Err(ParseError::UnterminatedData));
    }

    #[test]
    fn rejects_trailing_bytes() {
        assert_eq!(decode("/connect/2147483647//"), Err(ParseError::TrailingBytes));
        assert_eq!(decode("/close/1/2/"), Err(ParseError::TrailingBytes));
        assert_eq!(decode("/ack/1/2/3/"), Err(ParseError::TrailingBytes));
    }

    #[test]
    fn rejects_oversized_messages() {
        let mut raw = b"/data/1/0/".to_vec();
        raw.resize(MAX_MESSAGE_LEN - 1, b'a');
        raw.push(b'/');
        assert_eq!(raw.len(), MAX_MESSAGE_LEN);
        assert_eq!(Message::decode(&raw), Err(ParseError::TooLong(MAX_MESSAGE_LEN)));

        // One byte shorter is accepted.
        raw.truncate(MAX_MESSAGE_LEN - 2);
        raw.push(b'/');
        assert!(Message::decode(&raw).is_ok());
    }

    #[test]
    fn encodes_each_kind() {
        assert_eq!(Message::Connect { session: 0 }.encode(), b"/connect/0/");
        assert_eq!(Message::Close { session: 123456 }.encode(), b"/close/123456/");
        assert_eq!(
            Message::Ack {
                session: 2147483647,
                length: 2147483647
            }
            .encode(),
            b"/ack/2147483647/2147483647/"
        );
        assert_eq!(
            data(123456, 810, b"hello this").encode(),
            b"/data/123456/810/hello this/"
        );
        assert_eq!(data(123456, 810, b"").encode(), b"/data/123456/810//");
    }

    #[test]
    fn encode_escapes_payload() {
        assert_eq!(
            data(123456, 810, br"foo/bar\baz").encode(),
            br"/data/123456/810/foo\/bar\\baz/"
        );
        assert_eq!(data(0, 0, br"\/\/\/").encode(), br"/data/0/0/\\\/\\\/\\\//");
    }

    #[test]
    fn escaped_len_counts_escapes() {
        assert_eq!(escaped_len(b"plain"), 5);
        assert_eq!(escaped_len(br"a/b\c"), 7);
        assert_eq!(escaped_len(b""), 0);
    }

    #[test]
    fn kind_tokens() {
        assert_eq!(Kind::Data.to_string(), "data");
        assert_eq!(data(7, 0, b"x").kind(), Kind::Data);
        assert_eq!(data(7, 0, b"x").session(), 7);
        assert_eq!(Message::Ack { session: 9, length: 1 }.session(), 9);
    }
}
