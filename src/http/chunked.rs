use std::io::{self, Read};

use crate::http::{bad_message, take_line};

const BLOCK: usize = 8192;

/// Wraps a body source in the chunked transfer coding.
///
/// Each block read from the inner source becomes one chunk: its length in
/// lowercase hex, CRLF, the block, CRLF. When the source runs dry the
/// terminating zero-size chunk is emitted and the encoder reports
/// end-of-stream.
///
/// Attach one to a socket with [`Socket::send_source`] (or through
/// [`HttpClient::write_chunked_request`]) and the reactor drains it as the
/// peer keeps up; on a blocking socket the drain runs synchronously.
///
/// [`Socket::send_source`]: crate::Socket::send_source
/// [`HttpClient::write_chunked_request`]: crate::http::HttpClient::write_chunked_request
pub struct ChunkedEncoder<R> {
    inner: Option<R>,
    pending: Vec<u8>,
    at: usize,
}

impl<R: Read> ChunkedEncoder<R> {
    /// Encode `inner` chunk by chunk.
    pub fn new(inner: R) -> ChunkedEncoder<R> {
        ChunkedEncoder {
            inner: Some(inner),
            pending: Vec::new(),
            at: 0,
        }
    }
}

impl<R: Read> Read for ChunkedEncoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.at < self.pending.len() {
                let n = (self.pending.len() - self.at).min(buf.len());
                buf[..n].copy_from_slice(&self.pending[self.at..self.at + n]);
                self.at += n;
                return Ok(n);
            }

            let mut inner = match self.inner.take() {
                None => return Ok(0),
                Some(inner) => inner,
            };

            let mut block = [0u8; BLOCK];
            let n = inner.read(&mut block)?;
            self.pending.clear();
            self.at = 0;
            if n == 0 {
                self.pending.extend_from_slice(b"0\r\n\r\n");
                // Source exhausted; it stays dropped.
            } else {
                self.pending
                    .extend_from_slice(format!("{:x}\r\n", n).as_bytes());
                self.pending.extend_from_slice(&block[..n]);
                self.pending.extend_from_slice(b"\r\n");
                self.inner = Some(inner);
            }
        }
    }
}

/// Incremental decoder for the chunked transfer coding.
///
/// Fed from the connection's input buffer; consumes framing, appends payload
/// bytes to the message body, and reports when the terminating chunk (and
/// any trailer lines) have been fully consumed.
#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    state: State,
}

#[derive(Debug)]
enum State {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
    Done,
}

impl ChunkedDecoder {
    pub(crate) fn new() -> ChunkedDecoder {
        ChunkedDecoder { state: State::Size }
    }

    /// Consume what `input` holds. Returns true once the body is complete;
    /// false means more input is needed.
    pub(crate) fn advance(&mut self, input: &mut Vec<u8>, body: &mut Vec<u8>) -> io::Result<bool> {
        loop {
            match self.state {
                State::Size => {
                    let line = match take_line(input)? {
                        None => return Ok(false),
                        Some(line) => line,
                    };
                    // Chunk extensions after ';' are tolerated and ignored.
                    let digits = match line.iter().position(|&b| b == b';') {
                        Some(at) => &line[..at],
                        None => &line[..],
                    };
                    let size = parse_chunk_size(digits)?;
                    self.state = if size == 0 {
                        State::Trailer
                    } else {
                        State::Data(size)
                    };
                }
                State::Data(remaining) => {
                    if input.is_empty() {
                        return Ok(false);
                    }
                    let take = (remaining as usize).min(input.len());
                    body.extend(input.drain(..take));
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        State::DataEnd
                    } else {
                        State::Data(remaining)
                    };
                }
                State::DataEnd => {
                    if input.len() < 2 {
                        return Ok(false);
                    }
                    if &input[..2] != b"\r\n" {
                        return Err(bad_message("chunk data not followed by CRLF"));
                    }
                    input.drain(..2);
                    self.state = State::Size;
                }
                State::Trailer => {
                    let line = match take_line(input)? {
                        None => return Ok(false),
                        Some(line) => line,
                    };
                    if line.is_empty() {
                        self.state = State::Done;
                        return Ok(true);
                    }
                    // Trailer fields are consumed and ignored.
                }
                State::Done => return Ok(true),
            }
        }
    }
}

/// Chunk sizes are hex, either case on input.
fn parse_chunk_size(digits: &[u8]) -> io::Result<u64> {
    let digits = std::str::from_utf8(digits)
        .map_err(|_| bad_message("malformed chunk size"))?
        .trim();
    if digits.is_empty() {
        return Err(bad_message("malformed chunk size"));
    }
    u64::from_str_radix(digits, 16).map_err(|_| bad_message("malformed chunk size"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_frames_and_terminates() {
        let mut encoder = ChunkedEncoder::new(&b"Wikipedia"[..]);
        let mut out = Vec::new();
        encoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"9\r\nWikipedia\r\n0\r\n\r\n");
    }

    #[test]
    fn decoder_reassembles_split_input() {
        let mut decoder = ChunkedDecoder::new();
        let mut body = Vec::new();

        let mut input = b"4\r\nWi".to_vec();
        assert!(!decoder.advance(&mut input, &mut body).unwrap());

        input.extend_from_slice(b"ki\r\n5\r\npedia\r\n0\r\n\r\n");
        assert!(decoder.advance(&mut input, &mut body).unwrap());
        assert_eq!(body, b"Wikipedia");
        assert!(input.is_empty());
    }

    #[test]
    fn decoder_round_trips_encoder_output() {
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let mut encoded = Vec::new();
        ChunkedEncoder::new(&payload[..])
            .read_to_end(&mut encoded)
            .unwrap();

        let mut decoder = ChunkedDecoder::new();
        let mut body = Vec::new();
        assert!(decoder.advance(&mut encoded, &mut body).unwrap());
        assert_eq!(body, payload);
    }

    #[test]
    fn decoder_rejects_garbage_size() {
        let mut decoder = ChunkedDecoder::new();
        let mut input = b"zz\r\n".to_vec();
        assert!(decoder.advance(&mut input, &mut Vec::new()).is_err());
    }

    #[test]
    fn decoder_accepts_uppercase_hex() {
        let mut decoder = ChunkedDecoder::new();
        let mut input = b"A\r\n0123456789\r\n0\r\n\r\n".to_vec();
        let mut body = Vec::new();
        assert!(decoder.advance(&mut input, &mut body).unwrap());
        assert_eq!(body, b"0123456789");
    }
}
