//! Protocol codec
//!
//! Encoding and decoding functions for the RESP2 wire protocol.
//!
//! ## Wire Format
//!
//! ### Request (Command) Format
//! Every command is an array of bulk strings:
//! ```text
//! *<argc>\r\n
//! $<len>\r\n<arg>\r\n      (repeated argc times)
//! ```
//!
//! ### Reply Format
//! ```text
//! +<status>\r\n            simple status
//! -<message>\r\n           error
//! :<integer>\r\n           integer
//! $<len>\r\n<bytes>\r\n    bulk ($-1 = nil)
//! *<count>\r\n<replies>    array (*-1 = nil)
//! ```
//!
//! Decoding is incremental: an incomplete frame yields `Ok(None)` and leaves
//! the buffer untouched so more bytes can be read into it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Command, Reply};
use crate::error::{CacheError, Result};

/// Maximum bulk payload size (512 MB, the server-side limit)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum length of a header line before the frame is rejected
pub const MAX_LINE_SIZE: usize = 64 * 1024;

/// Maximum number of elements in one array frame
pub const MAX_ARRAY_LEN: usize = 1024 * 1024;

const CRLF: &[u8] = b"\r\n";

// =============================================================================
// Command Encoding/Decoding
// =============================================================================

/// Encode a command to bytes
pub fn encode_command(command: &Command) -> Bytes {
    let mut buf = BytesMut::new();
    encode_command_into(command, &mut buf);
    buf.freeze()
}

/// Append an encoded command to a buffer (used to build pipelines)
pub fn encode_command_into(command: &Command, buf: &mut BytesMut) {
    let args = command.to_args();
    write_header(buf, b'*', args.len() as i64);
    for arg in &args {
        write_header(buf, b'$', arg.len() as i64);
        buf.put_slice(arg);
        buf.put_slice(CRLF);
    }
}

/// Decode one command from the front of the buffer
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame
pub fn decode_command(buf: &mut BytesMut) -> Result<Option<Command>> {
    let reply = match decode_reply(buf)? {
        Some(reply) => reply,
        None => return Ok(None),
    };

    let items = match reply {
        Reply::Array(Some(items)) => items,
        other => {
            return Err(CacheError::Protocol(format!(
                "Command must be an array of bulk strings, got {:?}",
                other
            )))
        }
    };

    let args = items
        .into_iter()
        .map(|item| match item {
            Reply::Bulk(Some(arg)) => Ok(arg),
            other => Err(CacheError::Protocol(format!(
                "Command argument must be a bulk string, got {:?}",
                other
            ))),
        })
        .collect::<Result<Vec<_>>>()?;

    Command::from_args(args).map(Some)
}

// =============================================================================
// Reply Encoding/Decoding
// =============================================================================

/// Encode a reply to bytes
pub fn encode_reply(reply: &Reply) -> Bytes {
    let mut buf = BytesMut::new();
    encode_reply_into(reply, &mut buf);
    buf.freeze()
}

/// Append an encoded reply to a buffer
pub fn encode_reply_into(reply: &Reply, buf: &mut BytesMut) {
    match reply {
        Reply::Status(status) => {
            buf.put_u8(b'+');
            buf.put_slice(status.as_bytes());
            buf.put_slice(CRLF);
        }
        Reply::Error(message) => {
            buf.put_u8(b'-');
            buf.put_slice(message.as_bytes());
            buf.put_slice(CRLF);
        }
        Reply::Integer(n) => write_header(buf, b':', *n),
        Reply::Bulk(None) => write_header(buf, b'$', -1),
        Reply::Bulk(Some(value)) => {
            write_header(buf, b'$', value.len() as i64);
            buf.put_slice(value);
            buf.put_slice(CRLF);
        }
        Reply::Array(None) => write_header(buf, b'*', -1),
        Reply::Array(Some(items)) => {
            write_header(buf, b'*', items.len() as i64);
            for item in items {
                encode_reply_into(item, buf);
            }
        }
    }
}

/// Decode one reply from the front of the buffer
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame
pub fn decode_reply(buf: &mut BytesMut) -> Result<Option<Reply>> {
    match parse_reply(&buf[..], 0)? {
        Some((reply, consumed)) => {
            buf.advance(consumed);
            Ok(Some(reply))
        }
        None => Ok(None),
    }
}

fn write_header(buf: &mut BytesMut, prefix: u8, n: i64) {
    buf.put_u8(prefix);
    buf.put_slice(n.to_string().as_bytes());
    buf.put_slice(CRLF);
}

/// Parse the frame starting at `pos`; returns the reply and the end offset
fn parse_reply(buf: &[u8], pos: usize) -> Result<Option<(Reply, usize)>> {
    if pos >= buf.len() {
        return Ok(None);
    }

    let prefix = buf[pos];
    let (line, next) = match read_line(buf, pos + 1)? {
        Some(found) => found,
        None => return Ok(None),
    };

    match prefix {
        b'+' => Ok(Some((Reply::Status(line_text(line)?), next))),
        b'-' => Ok(Some((Reply::Error(line_text(line)?), next))),
        b':' => Ok(Some((Reply::Integer(parse_int(line)?), next))),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((Reply::Bulk(None), next)));
            }
            let len = len as usize;
            if len > MAX_BULK_SIZE {
                return Err(CacheError::Protocol(format!(
                    "Bulk too large: {} bytes (max {})",
                    len, MAX_BULK_SIZE
                )));
            }

            let end = next + len;
            if buf.len() < end + CRLF.len() {
                return Ok(None);
            }
            if &buf[end..end + CRLF.len()] != CRLF {
                return Err(CacheError::Protocol(
                    "Bulk payload not terminated by CRLF".to_string(),
                ));
            }

            let value = Bytes::copy_from_slice(&buf[next..end]);
            Ok(Some((Reply::Bulk(Some(value)), end + CRLF.len())))
        }
        b'*' => {
            let count = parse_int(line)?;
            if count < 0 {
                return Ok(Some((Reply::Array(None), next)));
            }
            let count = count as usize;
            if count > MAX_ARRAY_LEN {
                return Err(CacheError::Protocol(format!(
                    "Array too large: {} elements (max {})",
                    count, MAX_ARRAY_LEN
                )));
            }

            let mut items = Vec::with_capacity(count);
            let mut cursor = next;
            for _ in 0..count {
                match parse_reply(buf, cursor)? {
                    Some((item, end)) => {
                        items.push(item);
                        cursor = end;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Reply::Array(Some(items)), cursor)))
        }
        other => Err(CacheError::Protocol(format!(
            "Unknown reply type: 0x{:02x}",
            other
        ))),
    }
}

/// Find the CRLF-terminated line starting at `start`
fn read_line(buf: &[u8], start: usize) -> Result<Option<(&[u8], usize)>> {
    let window = &buf[start.min(buf.len())..];
    match window.windows(2).position(|w| w == CRLF) {
        Some(offset) => Ok(Some((&window[..offset], start + offset + CRLF.len()))),
        None if window.len() > MAX_LINE_SIZE => Err(CacheError::Protocol(format!(
            "Header line exceeds {} bytes",
            MAX_LINE_SIZE
        ))),
        None => Ok(None),
    }
}

fn line_text(line: &[u8]) -> Result<String> {
    String::from_utf8(line.to_vec())
        .map_err(|_| CacheError::Protocol("Line is not valid UTF-8".to_string()))
}

fn parse_int(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            CacheError::Protocol(format!(
                "Invalid integer: {:?}",
                String::from_utf8_lossy(line)
            ))
        })
}

// =============================================================================
// Stream-based I/O helpers
// =============================================================================

/// Read a complete reply from a stream
///
/// `buf` carries leftover bytes between calls; pipelined replies often
/// arrive in one read.
pub async fn read_reply<R>(reader: &mut R, buf: &mut BytesMut) -> Result<Reply>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(reply) = decode_reply(buf)? {
            return Ok(reply);
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(CacheError::Connection(
                "Connection closed while reading reply".to_string(),
            ));
        }
    }
}

/// Read a complete command from a stream
///
/// Returns `Ok(None)` on a clean end of stream between commands
pub async fn read_command<R>(reader: &mut R, buf: &mut BytesMut) -> Result<Option<Command>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(command) = decode_command(buf)? {
            return Ok(Some(command));
        }
        if reader.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(CacheError::Connection(
                "Connection closed mid-command".to_string(),
            ));
        }
    }
}

/// Write a reply to a stream
pub async fn write_reply<W>(writer: &mut W, reply: &Reply) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_reply(reply)).await?;
    writer.flush().await?;
    Ok(())
}
