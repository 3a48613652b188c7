//! Redis Serialization Protocol (RESP) encoding for commands.
//!
//! The durable log and the replication stream share one wire format: every
//! command is an array of bulk strings (`*<n>\r\n` followed by `n` entries
//! of `$<len>\r\n<bytes>\r\n`). This module encodes that format and decodes
//! it back incrementally from a byte buffer, so the same decoder serves log
//! replay and anything reading the replication stream.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

const CRLF: &[u8] = b"\r\n";

/// Longest integer header we accept before declaring the stream corrupt.
const MAX_HEADER_DIGITS: usize = 20;

/// Errors produced while decoding a RESP command.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RespError {
    #[error("expected '{expected}' but found byte 0x{found:02X}")]
    UnexpectedPrefix { expected: char, found: u8 },
    #[error("invalid length header")]
    InvalidLength,
    #[error("missing CRLF terminator")]
    MissingTerminator,
}

/// A RESP value as sent to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    NullBulkString,
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Serializes the value into its wire representation.
    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::new();
        self.encode_into(&mut buffer);
        buffer.freeze()
    }

    fn encode_into(&self, buffer: &mut BytesMut) {
        match self {
            RespValue::SimpleString(s) => {
                buffer.put_u8(b'+');
                buffer.put_slice(s.as_bytes());
                buffer.put_slice(CRLF);
            }
            RespValue::Error(s) => {
                buffer.put_u8(b'-');
                buffer.put_slice(s.as_bytes());
                buffer.put_slice(CRLF);
            }
            RespValue::Integer(i) => {
                buffer.put_slice(format!(":{}\r\n", i).as_bytes());
            }
            RespValue::BulkString(bytes) => put_bulk(buffer, bytes),
            RespValue::NullBulkString => buffer.put_slice(b"$-1\r\n"),
            RespValue::Array(values) => {
                buffer.put_slice(format!("*{}\r\n", values.len()).as_bytes());
                for value in values {
                    value.encode_into(buffer);
                }
            }
        }
    }
}

fn put_bulk(buffer: &mut BytesMut, bytes: &[u8]) {
    buffer.put_slice(format!("${}\r\n", bytes.len()).as_bytes());
    buffer.put_slice(bytes);
    buffer.put_slice(CRLF);
}

/// Encodes a command (name followed by its arguments) as a RESP array of
/// bulk strings.
///
/// # Examples
///
/// ```ignore
/// let bytes = encode_command(["SET", "a", "1"]);
/// assert_eq!(&bytes[..], b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n");
/// ```
pub fn encode_command<I, A>(args: I) -> Bytes
where
    I: IntoIterator<Item = A>,
    A: AsRef<[u8]>,
{
    let args: Vec<A> = args.into_iter().collect();
    let mut buffer = BytesMut::with_capacity(
        16 + args.iter().map(|arg| arg.as_ref().len() + 16).sum::<usize>(),
    );

    buffer.put_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in &args {
        put_bulk(&mut buffer, arg.as_ref());
    }

    buffer.freeze()
}

/// Decodes one command from the front of `buffer`.
///
/// # Returns
///
/// * `Ok(Some((args, consumed)))` - A complete command and the number of
///   bytes it occupied
/// * `Ok(None)` - The buffer ends before the command does
/// * `Err(RespError)` - The bytes are not a RESP array of bulk strings
pub fn decode_command(buffer: &[u8]) -> Result<Option<(Vec<Bytes>, usize)>, RespError> {
    if buffer.is_empty() {
        return Ok(None);
    }

    if buffer[0] != b'*' {
        return Err(RespError::UnexpectedPrefix {
            expected: '*',
            found: buffer[0],
        });
    }

    let Some((count, mut cursor)) = read_header(buffer, 1)? else {
        return Ok(None);
    };

    let count = usize::try_from(count).map_err(|_| RespError::InvalidLength)?;
    let mut args = Vec::with_capacity(count.min(1024));

    for _ in 0..count {
        let Some(&prefix) = buffer.get(cursor) else {
            return Ok(None);
        };

        if prefix != b'$' {
            return Err(RespError::UnexpectedPrefix {
                expected: '$',
                found: prefix,
            });
        }

        let Some((length, next)) = read_header(buffer, cursor + 1)? else {
            return Ok(None);
        };

        let length = usize::try_from(length).map_err(|_| RespError::InvalidLength)?;
        let end = next + length;

        if buffer.len() < end + CRLF.len() {
            return Ok(None);
        }

        if &buffer[end..end + CRLF.len()] != CRLF {
            return Err(RespError::MissingTerminator);
        }

        args.push(Bytes::copy_from_slice(&buffer[next..end]));
        cursor = end + CRLF.len();
    }

    Ok(Some((args, cursor)))
}

/// Reads a signed decimal header terminated by CRLF starting at `start`.
fn read_header(buffer: &[u8], start: usize) -> Result<Option<(i64, usize)>, RespError> {
    let rest = buffer.get(start..).unwrap_or_default();

    let Some(position) = rest.windows(2).position(|window| window == CRLF) else {
        if rest.len() > MAX_HEADER_DIGITS {
            return Err(RespError::InvalidLength);
        }
        return Ok(None);
    };

    let digits = std::str::from_utf8(&rest[..position]).map_err(|_| RespError::InvalidLength)?;
    let value = digits
        .parse::<i64>()
        .map_err(|_| RespError::InvalidLength)?;

    Ok(Some((value, start + position + CRLF.len())))
}
