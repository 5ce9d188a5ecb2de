use std::collections::VecDeque;
use std::io::{self, Read};

use crate::http::{
    bad_message, connection_close, is_chunked, parse_content_length, parse_header_line, take_line,
    ChunkedDecoder, ChunkedEncoder, Request, Response,
};
use crate::http::message::parse_version;
use crate::{Handler, Socket};

/// Receives each `(request, response)` pair an [`HttpClient`] completes.
pub trait ResponseHandler {
    /// A response arrived and was paired with the request that caused it.
    fn response_received(&mut self, request: Request, response: Response);

    /// The connection failed; `err` is what the reactor observed (a parse
    /// failure surfaces here as `InvalidData`).
    fn error(&mut self, err: &io::Error) {
        let _ = err;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Nothing in flight; only stray blank lines are acceptable input.
    Idle,
    /// Waiting for (the rest of) a status line.
    Status,
    /// Accumulating header lines.
    Headers,
    /// Reading a body of known remaining length.
    BodyLength,
    /// Reading a chunked body.
    BodyChunked,
    /// Reading a body that runs until the peer closes.
    BodyUntilClose,
}

/// The client half of the HTTP/1.x state machine.
///
/// Requests go out through [`write_request`]; the socket buffers whatever
/// the kernel will not take and the reactor drains it on writability. Every
/// request joins an in-flight FIFO, and as responses stream back in each is
/// paired with the front of that queue and handed to the
/// [`ResponseHandler`]. Requests may be pipelined by writing several before
/// serving the client to a reactor.
///
/// [`write_request`]: HttpClient::write_request
pub struct HttpClient {
    socket: Socket,
    sink: Box<dyn ResponseHandler>,
    buf: Vec<u8>,
    phase: Phase,
    response: Response,
    remaining: u64,
    chunks: ChunkedDecoder,
    inflight: VecDeque<Request>,
}

impl HttpClient {
    /// A client over a connected socket, reporting to `sink`.
    pub fn new(socket: Socket, sink: Box<dyn ResponseHandler>) -> HttpClient {
        HttpClient {
            socket,
            sink,
            buf: Vec::new(),
            phase: Phase::Idle,
            response: Response::empty(),
            remaining: 0,
            chunks: ChunkedDecoder::new(),
            inflight: VecDeque::new(),
        }
    }

    /// Requests written but not yet answered.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Send `request` with its inline body and enqueue it for pairing.
    ///
    /// The request is finalized first: `Host` is derived from the target's
    /// hostname and any `Transfer-Encoding` is dropped, since the body goes
    /// out by length. The writer invents no framing of its own; a request
    /// carrying an inline body should also carry its `Content-Length`.
    pub fn write_request(&mut self, mut request: Request) -> io::Result<()> {
        request.finalize();
        let mut bytes = Vec::new();
        request.write_to(&mut bytes)?;
        self.socket.write(&bytes)?;
        self.enqueue(request);
        Ok(())
    }

    /// Send `request` with a streamed, chunk-encoded body read from `body`.
    ///
    /// On a blocking socket the whole body is sent before this returns; on a
    /// non-blocking one the encoder is drained across the reactor's
    /// writability callbacks.
    pub fn write_chunked_request(
        &mut self,
        mut request: Request,
        body: Box<dyn Read>,
    ) -> io::Result<()> {
        request.finalize();
        request.headers.insert("Transfer-Encoding", "chunked");
        request.headers.remove("Content-Length");
        let mut bytes = Vec::new();
        request.write_head_to(&mut bytes)?;
        self.socket.write(&bytes)?;
        self.socket.send_source(Box::new(ChunkedEncoder::new(body)))?;
        self.enqueue(request);
        Ok(())
    }

    fn enqueue(&mut self, request: Request) {
        if self.phase == Phase::Idle {
            self.phase = Phase::Status;
        }
        self.inflight.push_back(request);
    }

    /// Drive the state machine over whatever the input buffer holds.
    fn process(&mut self) -> io::Result<()> {
        loop {
            match self.phase {
                Phase::Idle => {
                    while self.buf.starts_with(b"\r\n") {
                        self.buf.drain(..2);
                    }
                    if !self.buf.is_empty() {
                        return Err(bad_message("response bytes with no request in flight"));
                    }
                    return Ok(());
                }
                Phase::Status => {
                    let line = match take_line(&mut self.buf)? {
                        None => return Ok(()),
                        Some(line) => line,
                    };
                    // Stray blank lines ahead of a status line are tolerated.
                    if line.is_empty() {
                        continue;
                    }
                    self.response = parse_status_line(&line)?;
                    self.phase = Phase::Headers;
                }
                Phase::Headers => {
                    let line = match take_line(&mut self.buf)? {
                        None => return Ok(()),
                        Some(line) => line,
                    };
                    if line.is_empty() {
                        self.begin_body()?;
                    } else {
                        parse_header_line(&line, &mut self.response.headers)?;
                    }
                }
                Phase::BodyLength => {
                    let take = (self.remaining as usize).min(self.buf.len());
                    self.response.body.extend(self.buf.drain(..take));
                    self.remaining -= take as u64;
                    if self.remaining > 0 {
                        return Ok(());
                    }
                    self.emit()?;
                }
                Phase::BodyChunked => {
                    let mut body = std::mem::take(&mut self.response.body);
                    let done = self.chunks.advance(&mut self.buf, &mut body);
                    self.response.body = body;
                    if !done? {
                        return Ok(());
                    }
                    self.emit()?;
                }
                Phase::BodyUntilClose => {
                    self.response.body.append(&mut self.buf);
                    return Ok(());
                }
            }
        }
    }

    /// Headers are complete; decide how the body is framed.
    fn begin_body(&mut self) -> io::Result<()> {
        let head_request = self
            .inflight
            .front()
            .ok_or_else(|| bad_message("response bytes with no request in flight"))?;

        // Some exchanges never carry a body, whatever the headers claim.
        let code = self.response.code;
        if (100..200).contains(&code)
            || code == 204
            || code == 304
            || head_request.method.eq_ignore_ascii_case("HEAD")
        {
            return self.emit();
        }

        if is_chunked(&self.response.headers) {
            self.chunks = ChunkedDecoder::new();
            self.phase = Phase::BodyChunked;
        } else if let Some(value) = self.response.headers.get("Content-Length") {
            let length = parse_content_length(value)?;
            if length == 0 {
                return self.emit();
            }
            self.remaining = length;
            self.phase = Phase::BodyLength;
        } else {
            self.phase = Phase::BodyUntilClose;
        }
        Ok(())
    }

    /// Pair the finished response with the front of the in-flight queue and
    /// hand both to the sink.
    fn emit(&mut self) -> io::Result<()> {
        let response = std::mem::replace(&mut self.response, Response::empty());
        let request = self
            .inflight
            .pop_front()
            .ok_or_else(|| bad_message("response bytes with no request in flight"))?;

        let close = connection_close(&request.headers) || connection_close(&response.headers);
        log::trace!(
            "paired {} {} -> {}",
            request.method,
            response.code,
            self.inflight.len(),
        );
        self.sink.response_received(request, response);

        if close {
            self.socket.disconnect();
        }
        self.phase = if self.inflight.is_empty() {
            Phase::Idle
        } else {
            Phase::Status
        };
        Ok(())
    }
}

impl Handler for HttpClient {
    fn socket(&self) -> &Socket {
        &self.socket
    }

    fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }

    fn ready_read(&mut self) -> io::Result<()> {
        self.socket.read_all(&mut self.buf)?;
        self.process()
    }

    fn disconnected(&mut self, _err: Option<io::Error>) {
        // A body framed by connection lifetime is complete exactly now.
        if self.phase == Phase::BodyUntilClose {
            let _ = self.emit();
        }
    }

    fn error(&mut self, err: &io::Error) {
        self.sink.error(err);
    }
}

/// Parse `HTTP/<M>.<m> <code> <reason>`.
fn parse_status_line(line: &[u8]) -> io::Result<Response> {
    let space = line
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| bad_message("malformed status line"))?;
    let version = parse_version(&line[..space])?;

    let rest = &line[space + 1..];
    if rest.len() < 3 || !rest[..3].iter().all(|b| b.is_ascii_digit()) {
        return Err(bad_message("malformed status code"));
    }
    let code = (rest[..3])
        .iter()
        .fold(0u16, |acc, &b| acc * 10 + (b - b'0') as u16);

    let reason = match rest.get(3) {
        None => "",
        Some(&b' ') => std::str::from_utf8(&rest[4..])
            .map_err(|_| bad_message("malformed reason phrase"))?,
        Some(_) => return Err(bad_message("malformed status line")),
    };

    let mut response = Response::new(code, reason);
    response.version = version;
    Ok(response)
}
