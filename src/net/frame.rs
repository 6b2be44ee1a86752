//! Reply values of the Redis serialization protocol (RESP) and an incremental
//! decoder that assembles them from a byte stream arriving in arbitrary fragments.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

const MAX_BULK_STRING_LENGTH: i64 = 512 * (1 << 20); // 512MB
const MAX_ARRAY_LENGTH: i64 = 1 << 20;

/// Error from decoding a reply
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Unexpected bytes encountered during parse
    #[error("Invalid frame encoding")]
    BadEncoding,

    /// Could not read bytes as integer
    #[error("Could not parse bytes as an integer (got {0})")]
    NotInteger(String),

    /// Could not read bytes as utf8 string
    #[error("Could not parse bytes as an UTF-8 string - {0}")]
    NotUtf8(#[from] std::string::FromUtf8Error),

    /// A length prefix is larger than what the decoder accepts
    #[error("Length prefix {0} exceeds the protocol limit")]
    TooLarge(i64),

    /// A previous error left the decoder without a usable state
    #[error("Decoder failed earlier and must be reset")]
    Poisoned,
}

/// A reply in [Redis Serialization Protocol (RESP)].
///
/// [Redis Serialization Protocol (RESP)]: https://redis.io/topics/protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A status line such as `OK` or `PONG`.
    Status(String),
    /// An error line sent by the server.
    Error(String),
    /// A signed 64-bit number.
    Integer(i64),
    /// A binary-safe bytes sequence.
    Bulk(Bytes),
    /// Nothingness, sent as either a null bulk string or a null array.
    Null,
    /// A sequence of replies, possibly nested.
    Array(Vec<Reply>),
}

impl Reply {
    /// Returns `true` for the protocol-level null.
    pub fn is_null(&self) -> bool {
        matches!(self, Reply::Null)
    }

    /// Borrows the payload of a bulk string or a status line.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Bulk(b) => Some(b),
            Reply::Status(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Turns an error reply into [`Error::Command`], passing every other reply through.
    ///
    /// [`Error::Command`]: crate::net::Error::Command
    pub fn into_result(self) -> Result<Reply, super::Error> {
        match self {
            Reply::Error(msg) => Err(super::Error::Command(msg)),
            reply => Ok(reply),
        }
    }

    /// Serializes the reply the way a server would send it.
    pub fn write_to(&self, dst: &mut BytesMut) {
        match self {
            Reply::Status(s) => {
                dst.put_u8(b'+');
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Reply::Error(e) => {
                dst.put_u8(b'-');
                dst.put_slice(e.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Reply::Integer(i) => {
                dst.put_u8(b':');
                put_decimal(dst, *i);
                dst.put_slice(b"\r\n");
            }
            Reply::Bulk(b) => {
                dst.put_u8(b'$');
                put_decimal(dst, b.len() as i64);
                dst.put_slice(b"\r\n");
                dst.put_slice(b);
                dst.put_slice(b"\r\n");
            }
            Reply::Null => dst.put_slice(b"$-1\r\n"),
            Reply::Array(items) => {
                dst.put_u8(b'*');
                put_decimal(dst, items.len() as i64);
                dst.put_slice(b"\r\n");
                for item in items {
                    item.write_to(dst);
                }
            }
        }
    }
}

impl fmt::Display for Reply {
    /// Renders the reply the way `redis-cli` prints it.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status(s) => write!(f, "{}", s),
            Reply::Error(e) => write!(f, "(error) {}", e),
            Reply::Integer(i) => write!(f, "(integer) {}", i),
            Reply::Bulk(b) => write!(f, "\"{}\"", b.escape_ascii()),
            Reply::Null => write!(f, "(nil)"),
            Reply::Array(items) if items.is_empty() => write!(f, "(empty array)"),
            Reply::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    let prefix = format!("{}) ", i + 1);
                    for (j, line) in item.to_string().split('\n').enumerate() {
                        if j == 0 {
                            write!(f, "{}{}", prefix, line)?;
                        } else {
                            write!(f, "\n{:width$}{}", "", line, width = prefix.len())?;
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

/// What the decoder is waiting for before it can make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Need {
    /// A type-tagged line ending with `\r\n`.
    Line,
    /// This many more bytes of a bulk string body, its trailing `\r\n` included.
    Bytes(usize),
}

// An array whose header was read but whose elements are still arriving.
#[derive(Debug)]
struct OpenArray {
    remaining: usize,
    items: Vec<Reply>,
}

/// Streaming RESP decoder.
///
/// Bytes are handed over with [`feed`] as they arrive from the transport, in chunks
/// of any size, and [`gets`] hands back a reply once one is fully assembled. Partial
/// state survives across calls: open arrays are kept on a stack, one entry per
/// nesting level, and a consumed bulk header leaves the decoder expecting a raw body.
///
/// [`feed`]: Decoder::feed
/// [`gets`]: Decoder::gets
#[derive(Debug, Default)]
pub struct Decoder {
    buffer: BytesMut,
    stack: Vec<OpenArray>,
    // length of the bulk string body whose header has been consumed
    bulk: Option<usize>,
    // bytes of `buffer` already searched for a line feed
    scanned: usize,
    poisoned: bool,
}

impl Decoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            ..Default::default()
        }
    }

    /// Appends a chunk of bytes received from the server.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Returns the next complete reply.
    ///
    /// `Ok(None)` means that more bytes are needed, which is distinct from a decoded
    /// [`Reply::Null`]. Once an error is returned the decoder is poisoned and keeps
    /// returning [`FrameError::Poisoned`] until [`reset`] is called.
    ///
    /// [`reset`]: Decoder::reset
    pub fn gets(&mut self) -> Result<Option<Reply>, FrameError> {
        if self.poisoned {
            return Err(FrameError::Poisoned);
        }
        match self.advance() {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.clear();
                self.poisoned = true;
                Err(e)
            }
        }
    }

    /// Reports whether the decoder is waiting for a line or for a bulk body.
    pub fn need(&self) -> Need {
        match self.bulk {
            Some(len) => Need::Bytes((len + 2).saturating_sub(self.buffer.len())),
            None => Need::Line,
        }
    }

    /// Returns `true` if no reply is partially decoded and no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.stack.is_empty() && self.bulk.is_none()
    }

    /// Drops every buffered byte and partial state, clearing a previous failure.
    pub fn reset(&mut self) {
        self.clear();
        self.poisoned = false;
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    fn clear(&mut self) {
        self.buffer.clear();
        self.stack.clear();
        self.bulk = None;
        self.scanned = 0;
    }

    fn advance(&mut self) -> Result<Option<Reply>, FrameError> {
        loop {
            let value = match self.bulk {
                Some(len) => {
                    if self.buffer.len() < len + 2 {
                        return Ok(None);
                    }
                    let body = self.buffer.split_to(len).freeze();
                    if &self.buffer[..2] != b"\r\n" {
                        return Err(FrameError::BadEncoding);
                    }
                    self.buffer.advance(2);
                    self.bulk = None;
                    Reply::Bulk(body)
                }
                None => {
                    let line = match self.take_line()? {
                        Some(line) => line,
                        None => return Ok(None),
                    };
                    match self.parse_line(&line)? {
                        Some(value) => value,
                        // a header was consumed, its content follows
                        None => continue,
                    }
                }
            };
            if let Some(reply) = self.close_value(value) {
                return Ok(Some(reply));
            }
        }
    }

    /// Splits off the next line without its `\r\n`. Fails when the line feed is not
    /// preceded by a carriage return.
    fn take_line(&mut self) -> Result<Option<BytesMut>, FrameError> {
        let lf = match self.buffer[self.scanned..].iter().position(|&b| b == b'\n') {
            Some(pos) => self.scanned + pos,
            None => {
                self.scanned = self.buffer.len();
                return Ok(None);
            }
        };
        self.scanned = 0;
        if lf == 0 || self.buffer[lf - 1] != b'\r' {
            return Err(FrameError::BadEncoding);
        }
        let mut line = self.buffer.split_to(lf + 1);
        line.truncate(lf - 1);
        Ok(Some(line))
    }

    fn parse_line(&mut self, line: &[u8]) -> Result<Option<Reply>, FrameError> {
        let (&lead, rest) = line.split_first().ok_or(FrameError::BadEncoding)?;
        match lead {
            b'+' => Ok(Some(Reply::Status(String::from_utf8(rest.to_vec())?))),
            b'-' => Ok(Some(Reply::Error(String::from_utf8(rest.to_vec())?))),
            b':' => Ok(Some(Reply::Integer(parse_integer(rest)?))),
            b'$' => match parse_length(rest, MAX_BULK_STRING_LENGTH)? {
                None => Ok(Some(Reply::Null)),
                Some(len) => {
                    self.bulk = Some(len);
                    Ok(None)
                }
            },
            b'*' => match parse_length(rest, MAX_ARRAY_LENGTH)? {
                None => Ok(Some(Reply::Null)),
                Some(0) => Ok(Some(Reply::Array(Vec::new()))),
                Some(len) => {
                    self.stack.push(OpenArray {
                        remaining: len,
                        items: Vec::with_capacity(len.min(64)),
                    });
                    Ok(None)
                }
            },
            _ => Err(FrameError::BadEncoding),
        }
    }

    /// Appends a finished value to the innermost open array, folding every array it
    /// completes into its parent. Returns the top-level reply once the stack empties.
    fn close_value(&mut self, mut value: Reply) -> Option<Reply> {
        loop {
            let Some(top) = self.stack.last_mut() else {
                return Some(value);
            };
            top.items.push(value);
            top.remaining -= 1;
            if top.remaining > 0 {
                return None;
            }
            let done = self.stack.pop()?;
            value = Reply::Array(done.items);
        }
    }
}

/// Parses a length prefix. `-1` stands for null, any other negative value is invalid.
fn parse_length(digits: &[u8], max: i64) -> Result<Option<usize>, FrameError> {
    match parse_integer(digits)? {
        -1 => Ok(None),
        n if n < 0 => Err(FrameError::BadEncoding),
        n if n > max => Err(FrameError::TooLarge(n)),
        n => Ok(Some(n as usize)),
    }
}

fn parse_integer(digits: &[u8]) -> Result<i64, FrameError> {
    let not_integer = || FrameError::NotInteger(String::from_utf8_lossy(digits).into_owned());
    let (negative, body) = match digits.split_first() {
        Some((b'-', rest)) => (true, rest),
        Some((b'+', rest)) => (false, rest),
        _ => (false, digits),
    };
    if body.is_empty() {
        return Err(not_integer());
    }
    body.iter()
        .try_fold(0i64, |num, &b| {
            let n = ascii_to_i64(b)?;
            let num = num.checked_mul(10)?;
            if negative {
                num.checked_sub(n)
            } else {
                num.checked_add(n)
            }
        })
        .ok_or_else(not_integer)
}

fn ascii_to_i64(b: u8) -> Option<i64> {
    if !(48..=57).contains(&b) {
        return None;
    }
    Some(b as i64 - 48)
}

pub(crate) fn put_decimal(dst: &mut BytesMut, value: i64) {
    dst.put_slice(value.to_string().as_bytes());
}
