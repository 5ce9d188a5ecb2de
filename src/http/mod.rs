//! A streaming HTTP/1.x layer over the reactor.
//!
//! Both sides are incremental state machines implementing [`Handler`]: bytes
//! arrive through `ready_read`, parsed messages surface through a user
//! callback, and outgoing messages leave through the socket's write-behind
//! buffer so nothing ever blocks on a slow peer.
//!
//! [`HttpClient`] pairs each response with the request that provoked it via
//! an in-flight FIFO. [`HttpServer`] hands each parsed request to a
//! [`RequestHandler`] and serializes whatever it returns; [`HttpAccept`]
//! turns a listening socket into a stream of `HttpServer` connections.
//!
//! [`Handler`]: crate::Handler

use std::io;

mod chunked;
mod client;
mod message;
mod server;

pub use self::chunked::ChunkedEncoder;
pub(crate) use self::chunked::ChunkedDecoder;
pub use self::client::{HttpClient, ResponseHandler};
pub use self::message::{HeaderMap, Request, Response, Target, Version};
pub use self::server::{HttpAccept, HttpServer, RequestHandler};

/// Longest single protocol line (status line, header, chunk-size line) the
/// parsers accept before declaring the peer hostile.
pub(crate) const MAX_LINE: usize = 1024 * 1024;

pub(crate) fn bad_message(detail: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, detail)
}

/// Pop one CRLF-terminated line off the front of `buf`, without the CRLF.
/// `Ok(None)` means the line is still incomplete; a line that outgrows
/// [`MAX_LINE`] is a malformed message.
pub(crate) fn take_line(buf: &mut Vec<u8>) -> io::Result<Option<Vec<u8>>> {
    match buf.windows(2).position(|pair| pair == b"\r\n") {
        Some(at) if at > MAX_LINE => Err(bad_message("protocol line exceeds the line cap")),
        Some(at) => {
            let mut line: Vec<u8> = buf.drain(..at + 2).collect();
            line.truncate(at);
            Ok(Some(line))
        }
        None if buf.len() > MAX_LINE => Err(bad_message("protocol line exceeds the line cap")),
        None => Ok(None),
    }
}

/// Parse one `name: value` header line into `headers`.
///
/// The line splits at the first colon; leading whitespace is trimmed from
/// the value. Continuation lines (obsolete folding) are rejected: folding
/// was dropped from the protocol long ago and accepting it silently would
/// let a value smuggle what looks like another header.
pub(crate) fn parse_header_line(line: &[u8], headers: &mut message::HeaderMap) -> io::Result<()> {
    if line.first().is_some_and(|&b| b == b' ' || b == b'\t') {
        return Err(bad_message("folded header lines are not supported"));
    }
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| bad_message("header line without a colon"))?;
    if colon == 0 {
        return Err(bad_message("header line with an empty name"));
    }

    let name = String::from_utf8_lossy(&line[..colon]);
    let value = String::from_utf8_lossy(&line[colon + 1..]);
    headers.insert(name.trim(), value.trim_start());
    Ok(())
}

/// True when a `Connection` header asks for the connection to be closed
/// after the current exchange.
pub(crate) fn connection_close(headers: &message::HeaderMap) -> bool {
    headers
        .get("Connection")
        .map(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("close"))
        })
        .unwrap_or(false)
}

/// Whether a `Transfer-Encoding` header names the chunked coding.
pub(crate) fn is_chunked(headers: &message::HeaderMap) -> bool {
    headers
        .get("Transfer-Encoding")
        .map(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
        })
        .unwrap_or(false)
}

/// Parse a decimal `Content-Length` value.
pub(crate) fn parse_content_length(value: &str) -> io::Result<u64> {
    let value = value.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad_message("malformed Content-Length"));
    }
    value
        .parse::<u64>()
        .map_err(|_| bad_message("Content-Length out of range"))
}
