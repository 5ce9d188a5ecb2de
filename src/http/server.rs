use std::io;

use url::Url;

use crate::http::message::parse_version;
use crate::http::{
    bad_message, connection_close, is_chunked, parse_content_length, parse_header_line, take_line,
    ChunkedDecoder, Request, Response, Target,
};
use crate::{Handler, Socket};

/// Produces a [`Response`] for each fully-parsed [`Request`] an
/// [`HttpServer`] connection receives.
pub trait RequestHandler {
    /// A complete request arrived. The returned response is serialized back
    /// to the peer; an `Err` tears the connection down.
    fn request_received(&mut self, request: Request) -> io::Result<Response>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    RequestLine,
    Headers,
    BodyLength,
    BodyChunked,
}

/// The server half of the HTTP/1.x state machine: one accepted connection.
///
/// Parses request line, headers and body incrementally; once a request is
/// complete the [`RequestHandler`] produces the response, which leaves
/// through the socket's write-behind buffer. Requests with neither
/// `Content-Length` nor a chunked `Transfer-Encoding` have an empty body
/// and are dispatched as soon as their headers end. `Expect: 100-continue`
/// is ignored: no interim response is sent, the peer's body is simply read
/// when it arrives.
pub struct HttpServer {
    socket: Socket,
    handler: Box<dyn RequestHandler>,
    buf: Vec<u8>,
    phase: Phase,
    request: Request,
    remaining: u64,
    chunks: ChunkedDecoder,
}

impl HttpServer {
    /// A server connection over an accepted socket.
    pub fn new(socket: Socket, handler: Box<dyn RequestHandler>) -> HttpServer {
        HttpServer {
            socket,
            handler,
            buf: Vec::new(),
            phase: Phase::RequestLine,
            request: empty_request(),
            remaining: 0,
            chunks: ChunkedDecoder::new(),
        }
    }

    fn process(&mut self) -> io::Result<()> {
        loop {
            match self.phase {
                Phase::RequestLine => {
                    let line = match take_line(&mut self.buf)? {
                        None => return Ok(()),
                        Some(line) => line,
                    };
                    // Stray blank lines between pipelined requests are
                    // tolerated.
                    if line.is_empty() {
                        continue;
                    }
                    self.request = parse_request_line(&line)?;
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
                        parse_header_line(&line, &mut self.request.headers)?;
                    }
                }
                Phase::BodyLength => {
                    let take = (self.remaining as usize).min(self.buf.len());
                    self.request.body.extend(self.buf.drain(..take));
                    self.remaining -= take as u64;
                    if self.remaining > 0 {
                        return Ok(());
                    }
                    self.respond()?;
                }
                Phase::BodyChunked => {
                    let mut body = std::mem::take(&mut self.request.body);
                    let done = self.chunks.advance(&mut self.buf, &mut body);
                    self.request.body = body;
                    if !done? {
                        return Ok(());
                    }
                    self.respond()?;
                }
            }
        }
    }

    fn begin_body(&mut self) -> io::Result<()> {
        if is_chunked(&self.request.headers) {
            self.chunks = ChunkedDecoder::new();
            self.phase = Phase::BodyChunked;
            return Ok(());
        }
        if let Some(value) = self.request.headers.get("Content-Length") {
            let length = parse_content_length(value)?;
            if length > 0 {
                self.remaining = length;
                self.phase = Phase::BodyLength;
                return Ok(());
            }
        }
        // No framing: a request body ends with its headers.
        self.respond()
    }

    fn respond(&mut self) -> io::Result<()> {
        let request = std::mem::replace(&mut self.request, empty_request());
        let mut close = connection_close(&request.headers);
        log::trace!("request {} dispatched", request.method);

        let response = self.handler.request_received(request)?;
        close = close || connection_close(&response.headers);

        let mut bytes = Vec::new();
        response.write_to(&mut bytes)?;
        self.socket.write(&bytes)?;

        if close {
            self.socket.disconnect();
        }
        self.phase = Phase::RequestLine;
        Ok(())
    }
}

impl Handler for HttpServer {
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
}

/// A listening-socket handler that wraps every accepted connection in an
/// [`HttpServer`], each with a handler from `factory`.
///
/// ```no_run
/// use muxio::http::{HttpAccept, Request, RequestHandler, Response};
/// use muxio::{Reactor, Socket};
/// use std::io;
/// use std::net::TcpListener;
///
/// struct Hello;
///
/// impl RequestHandler for Hello {
///     fn request_received(&mut self, _request: Request) -> io::Result<Response> {
///         let mut response = Response::new(200, "OK");
///         response.body = b"hello".to_vec();
///         response.headers.insert("Content-Length", "5");
///         Ok(response)
///     }
/// }
///
/// let listener = TcpListener::bind("127.0.0.1:8080")?;
/// listener.set_nonblocking(true)?;
/// let mut socket = Socket::from(listener);
/// socket.set_blocking(false)?;
///
/// let mut reactor = Reactor::new()?;
/// let accept = HttpAccept::new(socket, || -> Box<dyn RequestHandler> { Box::new(Hello) });
/// reactor.serve(Box::new(accept))?;
/// reactor.run()?;
/// # Ok::<(), io::Error>(())
/// ```
pub struct HttpAccept<F> {
    socket: Socket,
    factory: F,
}

impl<F> HttpAccept<F>
where
    F: FnMut() -> Box<dyn RequestHandler>,
{
    /// Serve HTTP on `listener`, one `factory()` handler per connection.
    pub fn new(listener: Socket, factory: F) -> HttpAccept<F> {
        HttpAccept {
            socket: listener,
            factory,
        }
    }
}

impl<F> Handler for HttpAccept<F>
where
    F: FnMut() -> Box<dyn RequestHandler>,
{
    fn socket(&self) -> &Socket {
        &self.socket
    }

    fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }

    fn accept(&mut self, peer: Socket) -> io::Result<Option<Box<dyn Handler>>> {
        Ok(Some(Box::new(HttpServer::new(peer, (self.factory)()))))
    }
}

fn empty_request() -> Request {
    Request::wildcard("GET")
}

/// Parse `METHOD SP target SP HTTP/M.m`.
fn parse_request_line(line: &[u8]) -> io::Result<Request> {
    let text = std::str::from_utf8(line).map_err(|_| bad_message("malformed request line"))?;
    let mut parts = text.split(' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(method), Some(target), Some(version), None) => (method, target, version),
        _ => return Err(bad_message("malformed request line")),
    };
    if method.is_empty() {
        return Err(bad_message("malformed request line"));
    }

    let target = if target == "*" {
        Target::Wildcard
    } else if target.starts_with('/') {
        Target::Origin(target.to_owned())
    } else {
        match Url::parse(target) {
            Ok(url) => Target::Absolute(url),
            Err(_) => return Err(bad_message("malformed request target")),
        }
    };

    let mut request = Request::wildcard(method.to_ascii_uppercase());
    request.target = target;
    request.version = parse_version(version.as_bytes())?;
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_parses_origin_form() {
        let request = parse_request_line(b"get /a/b?c=d HTTP/1.1").unwrap();
        assert_eq!(request.method, "GET");
        assert!(matches!(&request.target, Target::Origin(path) if path == "/a/b?c=d"));
    }

    #[test]
    fn request_line_parses_wildcard_and_absolute() {
        let request = parse_request_line(b"OPTIONS * HTTP/1.1").unwrap();
        assert!(matches!(request.target, Target::Wildcard));

        let request = parse_request_line(b"GET http://example.test/x HTTP/1.0").unwrap();
        assert!(matches!(request.target, Target::Absolute(_)));
        assert_eq!(request.version.minor, 0);
    }

    #[test]
    fn request_line_rejects_extra_tokens() {
        assert!(parse_request_line(b"GET / HTTP/1.1 extra").is_err());
        assert!(parse_request_line(b"GET /").is_err());
    }
}
