use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::io;

use url::Url;

use crate::http::bad_message;

/// An HTTP protocol version, `HTTP/<major>.<minor>` on the wire.
///
/// Parsed components are clamped to a byte each; the protocol never went
/// past single digits anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    /// Major version number.
    pub major: u8,
    /// Minor version number.
    pub minor: u8,
}

impl Version {
    /// HTTP/1.0.
    pub const HTTP_10: Version = Version { major: 1, minor: 0 };
    /// HTTP/1.1.
    pub const HTTP_11: Version = Version { major: 1, minor: 1 };
}

impl Default for Version {
    fn default() -> Version {
        Version::HTTP_11
    }
}

impl fmt::Display for Version {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// Parse `HTTP/<major>.<minor>`, clamping each component to a byte.
pub(crate) fn parse_version(token: &[u8]) -> io::Result<Version> {
    let rest = token
        .strip_prefix(b"HTTP/")
        .ok_or_else(|| bad_message("malformed HTTP version"))?;
    let dot = rest
        .iter()
        .position(|&b| b == b'.')
        .ok_or_else(|| bad_message("malformed HTTP version"))?;
    let major = parse_clamped_u8(&rest[..dot])?;
    let minor = parse_clamped_u8(&rest[dot + 1..])?;
    Ok(Version { major, minor })
}

fn parse_clamped_u8(digits: &[u8]) -> io::Result<u8> {
    if digits.is_empty() || !digits.iter().all(|b| b.is_ascii_digit()) {
        return Err(bad_message("malformed HTTP version"));
    }
    let mut value: u32 = 0;
    for &b in digits {
        value = value.saturating_mul(10).saturating_add((b - b'0') as u32);
    }
    Ok(value.min(255) as u8)
}

/// A header-map key: ASCII-case-insensitive, compared character by
/// character in lowercase with length as the final tiebreak.
#[derive(Debug, Clone)]
struct HeaderKey(String);

impl Ord for HeaderKey {
    fn cmp(&self, other: &HeaderKey) -> Ordering {
        let lhs = self.0.bytes().map(|b| b.to_ascii_lowercase());
        let rhs = other.0.bytes().map(|b| b.to_ascii_lowercase());
        lhs.cmp(rhs)
    }
}

impl PartialOrd for HeaderKey {
    fn partial_cmp(&self, other: &HeaderKey) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeaderKey {
    fn eq(&self, other: &HeaderKey) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for HeaderKey {}

/// A case-insensitive header map with set-last-wins semantics.
///
/// Lookup, insertion and removal all ignore ASCII case. Inserting over an
/// existing name replaces the value (the stored spelling of the name is the
/// first one seen). Iteration order is the comparator's, not insertion
/// order; nothing in the protocol depends on header order.
///
/// # Examples
///
/// ```
/// use muxio::http::HeaderMap;
///
/// let mut headers = HeaderMap::new();
/// headers.insert("Content-Type", "text/plain");
/// assert_eq!(headers.get("content-type"), Some("text/plain"));
///
/// headers.insert("CONTENT-TYPE", "text/html");
/// assert_eq!(headers.get("Content-Type"), Some("text/html"));
/// assert_eq!(headers.len(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: BTreeMap<HeaderKey, String>,
}

impl HeaderMap {
    /// An empty map.
    pub fn new() -> HeaderMap {
        HeaderMap::default()
    }

    /// Set `name` to `value`, replacing any previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        // BTreeMap::insert keeps the original key on replacement, which is
        // exactly the first-spelling-wins behaviour wanted here.
        self.entries.insert(HeaderKey(name), value);
    }

    /// Look up `name`, ignoring case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&HeaderKey(name.to_owned()))
            .map(String::as_str)
    }

    /// Remove `name`, returning its value when present.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries.remove(&HeaderKey(name.to_owned()))
    }

    /// True when `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&HeaderKey(name.to_owned()))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the map holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(name, value)` pairs in comparator order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.0.as_str(), value.as_str()))
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in self.iter() {
            write_sanitized(out, name);
            out.extend_from_slice(b": ");
            write_sanitized(out, value);
            out.extend_from_slice(b"\r\n");
        }
    }
}

/// Emit `text` minus any CR/LF, which would otherwise fabricate lines.
fn write_sanitized(out: &mut Vec<u8>, text: &str) {
    out.extend(text.bytes().filter(|&b| b != b'\r' && b != b'\n'));
}

/// The request-target of an HTTP request.
#[derive(Debug, Clone)]
pub enum Target {
    /// The `*` target of server-wide requests (`OPTIONS * HTTP/1.1`).
    Wildcard,
    /// Origin form: a percent-encoded path, optionally `?query`.
    Origin(String),
    /// Absolute form: a full URL, as a client request carries.
    Absolute(Url),
}

impl Target {
    /// The host this target names, when it names one.
    pub fn host(&self) -> Option<&str> {
        match self {
            Target::Absolute(url) => url.host_str(),
            _ => None,
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Target::Wildcard => out.push(b'*'),
            Target::Origin(path) if path.is_empty() => out.push(b'/'),
            Target::Origin(path) => write_sanitized(out, path),
            Target::Absolute(url) => {
                let path = url.path();
                if path.is_empty() {
                    out.push(b'/');
                } else {
                    write_sanitized(out, path);
                }
                if let Some(query) = url.query() {
                    out.push(b'?');
                    write_sanitized(out, query);
                }
                if let Some(fragment) = url.fragment() {
                    out.push(b'#');
                    write_sanitized(out, fragment);
                }
            }
        }
    }
}

/// An HTTP request: request line, headers, body.
#[derive(Debug, Clone)]
pub struct Request {
    /// Protocol version on the request line.
    pub version: Version,
    /// Request method, canonically uppercase.
    pub method: String,
    /// The request-target.
    pub target: Target,
    /// Header fields.
    pub headers: HeaderMap,
    /// Body bytes, when the request carries any inline.
    pub body: Vec<u8>,
}

impl Request {
    /// A request for `url` with the given method.
    pub fn new(method: impl Into<String>, url: Url) -> Request {
        Request {
            version: Version::default(),
            method: method.into(),
            target: Target::Absolute(url),
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// A server-wide (`*`) request with the given method.
    pub fn wildcard(method: impl Into<String>) -> Request {
        Request {
            version: Version::default(),
            method: method.into(),
            target: Target::Wildcard,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// Prepare the request for the wire: derive `Host` from the target's
    /// hostname and drop any `Transfer-Encoding` (inline bodies are sent
    /// with their literal length; streamed bodies re-add the coding).
    pub(crate) fn finalize(&mut self) {
        if let Some(host) = self.target.host() {
            self.headers.insert("Host", host);
        }
        self.headers.remove("Transfer-Encoding");
    }

    /// Serialize the request line and headers, without the body.
    pub(crate) fn write_head_to(&self, out: &mut Vec<u8>) -> io::Result<()> {
        if self.method.is_empty()
            || self
                .method
                .bytes()
                .any(|b| b.is_ascii_whitespace() || b == b'\r' || b == b'\n')
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "request method is empty or contains whitespace",
            ));
        }

        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        self.target.write_to(out);
        out.push(b' ');
        out.extend_from_slice(self.version.to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        self.headers.write_to(out);
        out.extend_from_slice(b"\r\n");
        Ok(())
    }

    /// Serialize the whole request, body included.
    pub fn write_to(&self, out: &mut Vec<u8>) -> io::Result<()> {
        self.write_head_to(out)?;
        out.extend_from_slice(&self.body);
        Ok(())
    }
}

/// An HTTP response: status line, headers, body.
#[derive(Debug, Clone)]
pub struct Response {
    /// Protocol version on the status line.
    pub version: Version,
    /// Status code; `0` marks a response not (yet) parsed.
    pub code: u16,
    /// Reason phrase. CR/LF are stripped on emission.
    pub reason: String,
    /// Header fields.
    pub headers: HeaderMap,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl Response {
    /// A response with the given status code and reason phrase.
    pub fn new(code: u16, reason: impl Into<String>) -> Response {
        Response {
            version: Version::default(),
            code,
            reason: reason.into(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    pub(crate) fn empty() -> Response {
        Response::new(0, "")
    }

    /// Serialize the whole response.
    pub fn write_to(&self, out: &mut Vec<u8>) -> io::Result<()> {
        out.extend_from_slice(self.version.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.code.to_string().as_bytes());
        out.push(b' ');
        write_sanitized(out, &self.reason);
        out.extend_from_slice(b"\r\n");
        self.headers.write_to(out);
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_key_ordering_ignores_case() {
        let a = HeaderKey("Content-Type".to_owned());
        let b = HeaderKey("content-type".to_owned());
        assert_eq!(a.cmp(&b), Ordering::Equal);
        assert_eq!(a, b);
    }

    #[test]
    fn header_key_shorter_is_less_on_shared_prefix() {
        let short = HeaderKey("Accept".to_owned());
        let long = HeaderKey("Accept-Language".to_owned());
        assert_eq!(short.cmp(&long), Ordering::Less);
    }

    #[test]
    fn version_parse_clamps_components() {
        let version = parse_version(b"HTTP/1.1").unwrap();
        assert_eq!(version, Version::HTTP_11);

        let clamped = parse_version(b"HTTP/999.1000").unwrap();
        assert_eq!((clamped.major, clamped.minor), (255, 255));

        assert!(parse_version(b"HTP/1.1").is_err());
        assert!(parse_version(b"HTTP/1x.1").is_err());
    }

    #[test]
    fn sanitized_emission_strips_line_breaks() {
        let mut response = Response::new(200, "OK\r\nX-Fake: injected");
        response.headers.insert("X-Note", "a\r\nb");
        let mut out = Vec::new();
        response.write_to(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OKX-Fake: injected\r\n"));
        assert!(text.contains("X-Note: ab\r\n"));
    }
}
